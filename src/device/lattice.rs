//! Lattice MachXO3 driver.
//!
//! Flash programming through the ISC instruction set: enable offline
//! access, erase, write the feature row and feabits, stream the JEDEC
//! fuse rows, program DONE and release. Every slow instruction is
//! followed by a CHECK_BUSY poll.

use log::debug;

use crate::cable::Transport;
use crate::device::{Device, ProgMode};
use crate::display::{print_info, print_success};
use crate::jtag::{Jtag, TapState};
use crate::parser::jed::JedFile;
use crate::{ProgError, Result};

const READ_ID: u8 = 0xE0;
const USERCODE: u8 = 0xC0;
const LSC_READ_STATUS: u8 = 0x3C;
const LSC_CHECK_BUSY: u8 = 0xF0;
const ISC_ENABLE: u8 = 0xC6;
const ISC_DISABLE: u8 = 0x26;
const ISC_PROGRAM_USERCODE: u8 = 0xC2;
const ISC_ERASE: u8 = 0x0E;
const ISC_PROGRAM_DONE: u8 = 0x5E;
const LSC_INIT_ADDRESS: u8 = 0x46;
const LSC_PROG_INCR_RTI: u8 = 0x82;
const LSC_PROG_FEATURE: u8 = 0xE4;
const LSC_PROG_FEABITS: u8 = 0xF8;
const LSC_REFRESH: u8 = 0x79;
const ISC_NOOP: u8 = 0xFF;

const IRLEN: usize = 8;

// LSC_READ_STATUS word.
const STATUS_DONE: u32 = 1 << 8;
const STATUS_BUSY: u32 = 1 << 12;
const STATUS_FAIL: u32 = 1 << 13;

const BUSY_POLL_LIMIT: u32 = 100_000;

pub struct Lattice<'a, C: Transport> {
    jtag: &'a mut Jtag<C>,
    jed: Option<JedFile>,
    mode: ProgMode,
}

impl<'a, C: Transport> Lattice<'a, C> {
    pub fn new(jtag: &'a mut Jtag<C>, jed: Option<JedFile>) -> Self {
        let mode = if jed.is_some() {
            ProgMode::FlashWrite
        } else {
            ProgMode::None
        };
        Self { jtag, jed, mode }
    }

    fn wr_rd(
        &mut self,
        cmd: u8,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
    ) -> Result<()> {
        self.jtag
            .shift_ir(&[cmd], None, IRLEN, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(2)?;
        if tx.is_some() || rx.is_some() {
            let nbits = 8 * tx.map(|t| t.len())
                .or_else(|| rx.as_deref().map(|r| r.len()))
                .unwrap_or(0);
            self.jtag.shift_dr(tx, rx, nbits, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(2)?;
        }
        self.jtag.flush()?;
        Ok(())
    }

    fn read_status(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(LSC_READ_STATUS, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    /// CHECK_BUSY returns one byte with the busy flag in its MSB.
    fn poll_busy(&mut self) -> Result<()> {
        for _ in 0..BUSY_POLL_LIMIT {
            let mut rx = [0u8; 1];
            self.wr_rd(LSC_CHECK_BUSY, None, Some(&mut rx))?;
            if rx[0] & 0x80 == 0 {
                return Ok(());
            }
        }
        Err(ProgError::FlashTimeout.into())
    }

    fn enable_isc(&mut self) -> Result<()> {
        // Operand 0x00 selects offline (flash) access.
        self.wr_rd(ISC_ENABLE, Some(&[0x00]), None)?;
        self.poll_busy()
    }

    fn disable_isc(&mut self) -> Result<()> {
        self.wr_rd(ISC_DISABLE, None, None)?;
        self.wr_rd(ISC_NOOP, None, None)?;
        self.jtag.flush()
    }

    fn erase(&mut self) -> Result<()> {
        print_info("erase flash");
        // Erase configuration flash, UFM and feature row.
        self.wr_rd(ISC_ERASE, Some(&[0x0F]), None)?;
        self.poll_busy()?;
        let status = self.read_status()?;
        if status & STATUS_FAIL != 0 {
            return Err(ProgError::FlashEraseFailed(0).into());
        }
        print_success("Done");
        Ok(())
    }

    fn write_features(&mut self, features_row: u64, feabits: u16) -> Result<()> {
        self.wr_rd(LSC_PROG_FEATURE, Some(&features_row.to_le_bytes()), None)?;
        self.poll_busy()?;
        self.wr_rd(LSC_PROG_FEABITS, Some(&feabits.to_le_bytes()), None)?;
        self.poll_busy()
    }

    fn program_fuses(&mut self, jed: &JedFile) -> Result<()> {
        let rows: Vec<Vec<u8>> = jed
            .areas
            .iter()
            .flat_map(|a| a.rows.iter().cloned())
            .collect();
        let progress = crate::display::ProgressBar::new("Flash", rows.len() as u64);

        self.wr_rd(LSC_INIT_ADDRESS, None, None)?;
        for (idx, row) in rows.iter().enumerate() {
            self.wr_rd(LSC_PROG_INCR_RTI, Some(row), None)?;
            self.jtag.toggle_clk(1000)?;
            self.poll_busy()?;
            progress.display(idx as u64 + 1);
        }
        progress.done();
        Ok(())
    }

    fn program_done(&mut self) -> Result<()> {
        self.wr_rd(ISC_PROGRAM_DONE, None, None)?;
        self.poll_busy()?;
        let status = self.read_status()?;
        debug!("status after DONE: {:08x}", status);
        if status & STATUS_FAIL != 0 || status & STATUS_BUSY != 0 {
            return Err(ProgError::FlashProgramFailed(0).into());
        }
        if status & STATUS_DONE == 0 {
            return Err(ProgError::ProtocolError(
                "DONE flag not set after programming".into(),
            )
            .into());
        }
        Ok(())
    }

    pub fn read_usercode(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(USERCODE, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    fn refresh(&mut self) -> Result<()> {
        self.wr_rd(LSC_REFRESH, None, None)?;
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1000)?;
        self.jtag.flush()
    }
}

impl<'a, C: Transport> Device for Lattice<'a, C> {
    fn program(&mut self, _offset: u32) -> Result<()> {
        if self.mode == ProgMode::None {
            return Ok(());
        }
        let jed = match self.jed.take() {
            Some(jed) => jed,
            None => return Ok(()),
        };

        self.idcode()?;
        self.enable_isc()?;

        let result = (|| -> Result<()> {
            self.erase()?;
            if let (Some(features), Some(feabits)) = (jed.features_row, jed.feabits) {
                self.write_features(features, feabits)?;
            }
            self.program_fuses(&jed)?;
            if let Some(usercode) = jed.usercode {
                self.wr_rd(ISC_PROGRAM_USERCODE, Some(&usercode.to_le_bytes()), None)?;
                self.poll_busy()?;
            }
            self.program_done()
        })();

        // Offline access must be released on failure paths too.
        self.disable_isc()?;
        self.jtag.go_test_logic_reset()?;
        result
    }

    fn idcode(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.jtag.go_test_logic_reset()?;
        self.wr_rd(READ_ID, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    /// Reload the device from its freshly-programmed flash.
    fn reset(&mut self) -> Result<()> {
        self.refresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::jed::tests::build_jed_file;
    use crate::sim::TapSim;

    #[test]
    fn flash_program_sequence() {
        let jed = crate::parser::jed::parse(&build_jed_file()).unwrap();
        let nrows: usize = jed.areas.iter().map(|a| a.rows.len()).sum();

        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut().set_dr_response(LSC_CHECK_BUSY as u64, &[0]);
        jtag.cable_mut()
            .set_dr_response(LSC_READ_STATUS as u64, &[STATUS_DONE]);
        {
            let mut lattice = Lattice::new(&mut jtag, Some(jed));
            lattice.program(0).unwrap();
        }

        let sim = jtag.cable_mut();
        let irs: Vec<u8> = sim.ir_updates.iter().map(|&v| v as u8).collect();
        assert_eq!(irs[0], READ_ID);
        assert!(irs.contains(&ISC_ENABLE));
        assert!(irs.contains(&ISC_ERASE));
        assert!(irs.contains(&LSC_PROG_FEATURE));
        assert!(irs.contains(&LSC_PROG_FEABITS));
        assert!(irs.contains(&LSC_INIT_ADDRESS));
        let prog_rows = irs.iter().filter(|&&i| i == LSC_PROG_INCR_RTI).count();
        assert_eq!(prog_rows, nrows);
        assert!(irs.contains(&ISC_PROGRAM_USERCODE));
        assert!(irs.contains(&ISC_PROGRAM_DONE));
        assert!(irs.contains(&ISC_DISABLE));
        // ISC released and TAP parked.
        assert_eq!(sim.state, TapState::TestLogicReset);
    }

    #[test]
    fn failed_status_aborts_but_releases_isc() {
        let jed = crate::parser::jed::parse(&build_jed_file()).unwrap();
        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut().set_dr_response(LSC_CHECK_BUSY as u64, &[0]);
        jtag.cable_mut()
            .set_dr_response(LSC_READ_STATUS as u64, &[STATUS_FAIL]);
        let err = {
            let mut lattice = Lattice::new(&mut jtag, Some(jed));
            lattice.program(0).unwrap_err()
        };
        assert!(err.to_string().contains("erase failed"));
        let sim = jtag.cable_mut();
        let irs: Vec<u8> = sim.ir_updates.iter().map(|&v| v as u8).collect();
        assert!(irs.contains(&ISC_DISABLE));
        assert_eq!(sim.state, TapState::TestLogicReset);
    }
}
