//! Black Magic Probe remote protocol over its CDC-ACM tty.
//!
//! Packets are ASCII framed as `!<class><op>[args]#`; the probe
//! answers `&<K|E...><payload>#`. JTAG sequences are limited to 32
//! clock cycles per packet.

use std::io::{Read, Write};
use std::time::Duration;

use failure::ResultExt;
use log::debug;

use crate::bits;
use crate::display::{print_info, print_warn};
use crate::{ProgError, Result};

const SOM: u8 = b'!';
const EOM: u8 = b'#';
const RESP: u8 = b'&';
const RESP_OK: u8 = b'K';
const RESP_ERR: u8 = b'E';

const MAX_MSG_SIZE: usize = 1024;
const SERIAL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Bmd {
    port: Box<dyn serialport::SerialPort>,
    last_tms: bool,
}

impl Bmd {
    pub fn open(dev: &str, freq_hz: u32) -> Result<Self> {
        let port = serialport::new(dev, 115_200)
            .timeout(SERIAL_TIMEOUT)
            .open()
            .context("Error opening Black Magic Probe tty")?;

        let mut probe = Self { port, last_tms: false };

        // `+#!GA#`: leave any previous packet, then remote start.
        let answer = probe.xfer(b"+#!GA#")?;
        print_info(&format!("Remote is {}", String::from_utf8_lossy(&answer)));

        // JTAG init.
        probe.xfer(b"+#!JS#")?;

        probe.set_clk_freq(freq_hz)?;
        Ok(probe)
    }

    /// Write one packet and read back the `&...#` response payload.
    fn xfer(&mut self, pkt: &[u8]) -> Result<Vec<u8>> {
        debug!("bmd > {}", String::from_utf8_lossy(pkt));
        self.port.write_all(pkt).context("BMP write failed")?;

        let mut payload = Vec::new();
        let mut byte = [0u8; 1];
        let mut seen_resp = false;
        loop {
            self.port
                .read_exact(&mut byte)
                .context("BMP read failed")?;
            match byte[0] {
                RESP => {
                    seen_resp = true;
                    payload.clear();
                }
                EOM if seen_resp => break,
                b if seen_resp => {
                    payload.push(b);
                    if payload.len() > MAX_MSG_SIZE {
                        return Err(ProgError::ProtocolError(
                            "BMP answer overflow".into(),
                        )
                        .into());
                    }
                }
                _ => {}
            }
        }
        debug!("bmd < {}", String::from_utf8_lossy(&payload));

        match payload.first().copied() {
            Some(RESP_OK) => Ok(payload.split_off(1)),
            Some(RESP_ERR) => Err(ProgError::ProtocolError(format!(
                "BMP error answer: {}",
                String::from_utf8_lossy(&payload[1..])
            ))
            .into()),
            _ => Err(ProgError::ProtocolError("BMP malformed answer".into()).into()),
        }
    }

    fn hex_to_u64(payload: &[u8]) -> u64 {
        let mut val = 0u64;
        for &c in payload {
            let digit = match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                b'A'..=b'F' => c - b'A' + 10,
                _ => break,
            };
            val = (val << 4) | digit as u64;
        }
        val
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        let pkt = format!("!GF{:08x}#", freq_hz);
        if self.xfer(pkt.as_bytes()).is_err() {
            print_warn("BMP firmware cannot set the SWJ frequency");
        }
        let answer = self.xfer(b"!Gf#")?;
        let real = Self::hex_to_u64(&answer) as u32;
        print_info(&format!(
            "Jtag frequency: requested {}Hz -> real {}Hz", freq_hz, real
        ));
        Ok(real)
    }

    pub fn write_tms(&mut self, tms: &[u8], nbits: usize, _flush: bool) -> Result<()> {
        let mut pos = 0;
        while pos < nbits {
            let chunk = (nbits - pos).min(32);
            let mut word = 0u32;
            for i in 0..chunk {
                if bits::get_bit(tms, pos + i) {
                    word |= 1 << i;
                }
                self.last_tms = bits::get_bit(tms, pos + i);
            }
            let pkt = format!("!JT{:02x}{:x}#", chunk, word);
            self.xfer(pkt.as_bytes())?;
            pos += chunk;
        }
        Ok(())
    }

    pub fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        mut rx: Option<&mut [u8]>,
        nbits: usize,
        end: bool,
    ) -> Result<()> {
        // 'D' shifts without a final TMS rise, 'd' with one.
        let mut pos = 0;
        while pos < nbits {
            let chunk = (nbits - pos).min(32);
            let last = pos + chunk == nbits;
            let op = if last && end { b'D' } else { b'd' };

            let mut word = 0u32;
            for i in 0..chunk {
                let bit = match tx {
                    Some(data) => bits::get_bit(data, pos + i),
                    None => true,
                };
                if bit {
                    word |= 1 << i;
                }
            }
            let pkt = format!("!J{}{:02x}{:x}#", op as char, chunk, word);
            let answer = self.xfer(pkt.as_bytes())?;
            if let Some(buf) = rx.as_deref_mut() {
                let data = Self::hex_to_u64(&answer);
                for i in 0..chunk {
                    bits::set_bit(buf, pos + i, data & (1 << i) != 0);
                }
            }
            pos += chunk;
        }
        if end {
            self.last_tms = true;
        }
        Ok(())
    }

    pub fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        // No dedicated idle-clock packet: emit TMS sequences holding
        // the requested level.
        let fill = if tms { 0xFFu8 } else { 0x00 };
        let _ = tdi;
        let buf = [fill; 4];
        let mut rest = cycles as usize;
        while rest > 0 {
            let chunk = rest.min(32);
            self.write_tms(&buf, chunk, false)?;
            rest -= chunk;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        // Packets are synchronous; nothing is buffered.
        Ok(())
    }

    pub fn buffer_capacity(&self) -> usize {
        32
    }
}
