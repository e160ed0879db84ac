//! SVF player: replays Serial Vector Format files onto the JTAG
//! engine. Covers the statement set the vendor loader files use:
//! TRST, ENDIR/ENDDR, STATE, FREQUENCY, RUNTEST, SIR/SDR with
//! TDI/TDO/MASK operands, and the HDR/HIR/TDR/TIR headers.

use log::debug;

use crate::bits;
use crate::cable::Transport;
use crate::jtag::{Jtag, TapState};
use crate::parser::parse_err;
use crate::{ProgError, Result};

/// One parsed shift operand set: `<len> TDI(..) [TDO(..)] [MASK(..)]`.
#[derive(Default, Clone)]
struct ShiftOp {
    len: usize,
    tdi: Vec<u8>,
    tdo: Option<Vec<u8>>,
    mask: Option<Vec<u8>>,
}

pub struct SvfPlayer<'a, C: Transport> {
    jtag: &'a mut Jtag<C>,
    endir: TapState,
    enddr: TapState,
    run_state: TapState,
    hdr: ShiftOp,
    hir: ShiftOp,
    tdr: ShiftOp,
    tir: ShiftOp,
}

fn state_by_name(name: &str) -> Result<TapState> {
    Ok(match name {
        "RESET" => TapState::TestLogicReset,
        "IDLE" => TapState::RunTestIdle,
        "DRSELECT" => TapState::SelectDrScan,
        "DRCAPTURE" => TapState::CaptureDr,
        "DRSHIFT" => TapState::ShiftDr,
        "DREXIT1" => TapState::Exit1Dr,
        "DRPAUSE" => TapState::PauseDr,
        "DREXIT2" => TapState::Exit2Dr,
        "DRUPDATE" => TapState::UpdateDr,
        "IRSELECT" => TapState::SelectIrScan,
        "IRCAPTURE" => TapState::CaptureIr,
        "IRSHIFT" => TapState::ShiftIr,
        "IREXIT1" => TapState::Exit1Ir,
        "IRPAUSE" => TapState::PauseIr,
        "IREXIT2" => TapState::Exit2Ir,
        "IRUPDATE" => TapState::UpdateIr,
        other => return Err(parse_err(&format!("svf: unknown state {}", other))),
    })
}

/// Hex operand to a little-endian byte buffer holding `len` bits.
fn hex_to_bytes(hex: &str, len: usize) -> Result<Vec<u8>> {
    let nbytes = bits::bytes_for_bits(len);
    let mut out = vec![0u8; nbytes];
    let mut nibble_idx = 0;
    for c in hex.chars().rev() {
        let digit = c
            .to_digit(16)
            .ok_or_else(|| parse_err(&format!("svf: bad hex digit '{}'", c)))?
            as u8;
        let byte_idx = nibble_idx / 2;
        if byte_idx >= nbytes {
            break;
        }
        if nibble_idx % 2 == 0 {
            out[byte_idx] |= digit;
        } else {
            out[byte_idx] |= digit << 4;
        }
        nibble_idx += 1;
    }
    Ok(out)
}

impl<'a, C: Transport> SvfPlayer<'a, C> {
    pub fn new(jtag: &'a mut Jtag<C>) -> Self {
        Self {
            jtag,
            endir: TapState::RunTestIdle,
            enddr: TapState::RunTestIdle,
            run_state: TapState::RunTestIdle,
            hdr: ShiftOp::default(),
            hir: ShiftOp::default(),
            tdr: ShiftOp::default(),
            tir: ShiftOp::default(),
        }
    }

    pub fn play_file(&mut self, path: &str) -> Result<()> {
        let raw = crate::parser::read_file(path)?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        self.play(&text)
    }

    /// Execute every `;`-terminated statement in `text`.
    pub fn play(&mut self, text: &str) -> Result<()> {
        // Strip `!` and `//` comments, then join and split on ';'.
        let mut clean = String::with_capacity(text.len());
        for line in text.lines() {
            let line = match line.find('!') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = match line.find("//") {
                Some(pos) => &line[..pos],
                None => line,
            };
            clean.push_str(line);
            clean.push(' ');
        }

        for stmt in clean.split(';') {
            let tokens: Vec<&str> = stmt.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            self.statement(&tokens)?;
        }
        self.jtag.flush()
    }

    fn parse_shift_op(&self, tokens: &[&str]) -> Result<ShiftOp> {
        let len: usize = tokens[0]
            .parse()
            .map_err(|_| parse_err("svf: bad shift length"))?;
        let mut op = ShiftOp { len, ..ShiftOp::default() };
        // Default TDI is all zeros of the stated length.
        op.tdi = vec![0u8; bits::bytes_for_bits(len)];

        // Sequential `NAME (hex)` groups.
        let rest = tokens[1..].join(" ");
        let mut s = rest.as_str();
        while let Some(open) = s.find('(') {
            let name = s[..open].trim().to_string();
            let close = s[open..]
                .find(')')
                .ok_or_else(|| parse_err("svf: unterminated operand"))?
                + open;
            let hex: String = s[open + 1..close]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            match name.as_str() {
                "TDI" => op.tdi = hex_to_bytes(&hex, len)?,
                "TDO" => op.tdo = Some(hex_to_bytes(&hex, len)?),
                "MASK" => op.mask = Some(hex_to_bytes(&hex, len)?),
                "SMASK" => {}
                other => {
                    return Err(parse_err(&format!("svf: unknown operand {}", other)))
                }
            }
            s = &s[close + 1..];
        }
        Ok(op)
    }

    /// Concatenate header + payload + trailer TDI bits for a shift.
    fn build_tx(header: &ShiftOp, op: &ShiftOp, trailer: &ShiftOp) -> (Vec<u8>, usize) {
        let total = header.len + op.len + trailer.len;
        let mut tx = vec![0u8; bits::bytes_for_bits(total)];
        let mut pos = 0;
        for (src, len) in &[
            (&header.tdi, header.len),
            (&op.tdi, op.len),
            (&trailer.tdi, trailer.len),
        ] {
            for i in 0..*len {
                bits::set_bit(&mut tx, pos + i, bits::get_bit(src, i));
            }
            pos += len;
        }
        (tx, total)
    }

    fn check_tdo(op: &ShiftOp, rx: &[u8], skip: usize) -> Result<()> {
        let expected = match &op.tdo {
            Some(tdo) => tdo,
            None => return Ok(()),
        };
        for i in 0..op.len {
            let masked = match &op.mask {
                Some(mask) => bits::get_bit(mask, i),
                None => true,
            };
            if !masked {
                continue;
            }
            if bits::get_bit(rx, skip + i) != bits::get_bit(expected, i) {
                return Err(ProgError::ProtocolError(format!(
                    "svf: TDO mismatch at bit {}", i
                ))
                .into());
            }
        }
        Ok(())
    }

    fn statement(&mut self, tokens: &[&str]) -> Result<()> {
        match tokens[0] {
            "TRST" => Ok(()),
            "FREQUENCY" => {
                if tokens.len() >= 2 {
                    let hz: f64 = tokens[1]
                        .parse()
                        .map_err(|_| parse_err("svf: bad frequency"))?;
                    self.jtag.set_clk_freq(hz as u32)?;
                }
                Ok(())
            }
            "ENDIR" => {
                self.endir = state_by_name(tokens[1])?;
                Ok(())
            }
            "ENDDR" => {
                self.enddr = state_by_name(tokens[1])?;
                Ok(())
            }
            "STATE" => {
                for name in &tokens[1..] {
                    let state = state_by_name(name)?;
                    self.jtag.set_state(state)?;
                }
                self.jtag.flush()
            }
            "RUNTEST" => {
                // RUNTEST [run_state] count TCK|SEC [...] [ENDSTATE state]
                let mut idx = 1;
                if tokens.len() > 1 {
                    if let Ok(state) = state_by_name(tokens[idx]) {
                        self.run_state = state;
                        idx += 1;
                    }
                }
                let count: f64 = tokens
                    .get(idx)
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| parse_err("svf: bad RUNTEST count"))?;
                idx += 1;

                let clocks = match tokens.get(idx) {
                    Some(&"SEC") => {
                        std::thread::sleep(std::time::Duration::from_secs_f64(
                            count.min(1.0),
                        ));
                        0
                    }
                    _ => count as u32,
                };

                let mut end_state = self.run_state;
                if let Some(pos) = tokens.iter().position(|&t| t == "ENDSTATE") {
                    end_state = state_by_name(tokens[pos + 1])?;
                }

                self.jtag.set_state(self.run_state)?;
                if clocks > 0 {
                    self.jtag.toggle_clk(clocks)?;
                }
                self.jtag.set_state(end_state)?;
                self.jtag.flush()
            }
            "HDR" => {
                self.hdr = self.parse_shift_op(&tokens[1..])?;
                Ok(())
            }
            "HIR" => {
                self.hir = self.parse_shift_op(&tokens[1..])?;
                Ok(())
            }
            "TDR" => {
                self.tdr = self.parse_shift_op(&tokens[1..])?;
                Ok(())
            }
            "TIR" => {
                self.tir = self.parse_shift_op(&tokens[1..])?;
                Ok(())
            }
            "SIR" => {
                let op = self.parse_shift_op(&tokens[1..])?;
                let (tx, total) = Self::build_tx(&self.hir, &op, &self.tir);
                let mut rx = vec![0u8; bits::bytes_for_bits(total)];
                let need_rx = op.tdo.is_some();
                debug!("svf SIR {} bits", total);
                self.jtag.shift_ir(
                    &tx,
                    if need_rx { Some(&mut rx) } else { None },
                    total,
                    self.endir,
                )?;
                Self::check_tdo(&op, &rx, self.hir.len)
            }
            "SDR" => {
                let op = self.parse_shift_op(&tokens[1..])?;
                let (tx, total) = Self::build_tx(&self.hdr, &op, &self.tdr);
                let mut rx = vec![0u8; bits::bytes_for_bits(total)];
                let need_rx = op.tdo.is_some();
                debug!("svf SDR {} bits", total);
                self.jtag.shift_dr(
                    Some(&tx),
                    if need_rx { Some(&mut rx) } else { None },
                    total,
                    self.enddr,
                )?;
                Self::check_tdo(&op, &rx, self.hdr.len)
            }
            other => Err(parse_err(&format!("svf: unknown statement {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TapSim;

    #[test]
    fn hex_operand_parsing() {
        assert_eq!(hex_to_bytes("0F", 8).unwrap(), vec![0x0F]);
        assert_eq!(hex_to_bytes("1234", 16).unwrap(), vec![0x34, 0x12]);
        assert_eq!(hex_to_bytes("5", 3).unwrap(), vec![0x05]);
    }

    #[test]
    fn plays_shift_statements() {
        let mut jtag = Jtag::new(TapSim::new());
        {
            let mut svf = SvfPlayer::new(&mut jtag);
            svf.play(
                "! comment\n\
                 ENDIR IDLE;\n\
                 ENDDR IDLE;\n\
                 STATE RESET;\n\
                 SIR 10 TDI (006);\n\
                 SDR 16 TDI (ABCD);\n\
                 RUNTEST IDLE 100 TCK;\n",
            )
            .unwrap();
        }
        let sim = jtag.cable_mut();
        assert_eq!(sim.ir_updates, vec![0x006]);
        assert_eq!(sim.dr_updates, vec![vec![0xCD, 0xAB]]);
        assert!(sim.idle_clocks >= 100);
    }

    #[test]
    fn tdo_mask_verification() {
        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut().script_tdo_bytes(&[0x55]);
        {
            let mut svf = SvfPlayer::new(&mut jtag);
            // Scripted TDO is 0x55; expect it with a full mask.
            svf.play("SDR 8 TDI (00) TDO (55) MASK (FF);").unwrap();
        }

        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut().script_tdo_bytes(&[0x55]);
        let err = {
            let mut svf = SvfPlayer::new(&mut jtag);
            svf.play("SDR 8 TDI (00) TDO (AA) MASK (FF);").unwrap_err()
        };
        assert!(err.to_string().contains("TDO mismatch"));

        // A mask of zero ignores the mismatch.
        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut().script_tdo_bytes(&[0x55]);
        {
            let mut svf = SvfPlayer::new(&mut jtag);
            svf.play("SDR 8 TDI (00) TDO (AA) MASK (00);").unwrap();
        }
    }

    #[test]
    fn headers_prepend_bits() {
        let mut jtag = Jtag::new(TapSim::new());
        {
            let mut svf = SvfPlayer::new(&mut jtag);
            svf.play(
                "HDR 4 TDI (F);\n\
                 TDR 4 TDI (0);\n\
                 SDR 8 TDI (A5);",
            )
            .unwrap();
        }
        let sim = jtag.cable_mut();
        assert_eq!(sim.dr_lengths, vec![16]);
        // 4 ones, then A5, then 4 zeros, LSB-first.
        assert_eq!(sim.dr_updates[0], vec![0x5F, 0x0A]);
    }

    #[test]
    fn unknown_statement_rejected() {
        let mut jtag = Jtag::new(TapSim::new());
        let mut svf = SvfPlayer::new(&mut jtag);
        assert!(svf.play("BOGUS 1;").is_err());
    }
}
