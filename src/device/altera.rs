//! Intel/Altera Cyclone driver.
//!
//! SRAM configuration replays a vendor `.svf` through the SVF player.
//! EPCQ flashing first replays the shipped serial-flash-loader SVF to
//! put the bridge design into SRAM, then drives the EPCQ directly
//! over the FTDI's second channel as plain SPI.

use log::debug;

use crate::cable::mpsse::MpsseSpi;
use crate::cable::Transport;
use crate::device::{Device, ProgMode, DATA_DIR};
use crate::flash::epcq::Epcq;
use crate::jtag::{Jtag, TapState};
use crate::parser::{self, FileFormat};
use crate::svf::SvfPlayer;
use crate::{ProgError, Result};

const IDCODE: u8 = 0x06;
const IRLEN: usize = 10;

/// The serial-flash-loader bridge shipped with the tool.
const SFL_SVF: &str = "test_sfl.svf";

pub struct Altera<'a, C: Transport> {
    jtag: &'a mut Jtag<C>,
    filename: String,
    mode: ProgMode,
    /// USB ids of the cable, needed to open the SPI channel for the
    /// EPCQ. Flash mode is MPSSE-only.
    usb: Option<(u16, u16)>,
}

impl<'a, C: Transport> Altera<'a, C> {
    pub fn new(jtag: &'a mut Jtag<C>, filename: &str, usb: Option<(u16, u16)>) -> Self {
        let mode = if filename.is_empty() {
            ProgMode::None
        } else if parser::format_for_path(filename) == FileFormat::Svf {
            ProgMode::SramWrite
        } else {
            ProgMode::FlashWrite
        };
        Self { jtag, filename: filename.to_string(), mode, usb }
    }

    /// Identify the attached EPCQ. Needs the serial-flash-loader
    /// bridge in SRAM first, so the device must be reset afterwards.
    pub fn display_eeprom(&mut self) -> Result<()> {
        let (vid, pid) = self.usb.ok_or_else(|| {
            ProgError::ConfigError(
                "EPCQ detection needs an FTDI cable with a free SPI channel".into(),
            )
        })?;
        let loader = format!("{}/{}", DATA_DIR, SFL_SVF);
        SvfPlayer::new(&mut *self.jtag).play_file(&loader)?;
        let spi = MpsseSpi::open(vid, pid, 2, 6_000_000)?;
        Epcq::new(spi).detect()?;
        Ok(())
    }

    fn program_flash(&mut self, offset: u32) -> Result<()> {
        let (vid, pid) = self.usb.ok_or_else(|| {
            ProgError::ConfigError(
                "EPCQ programming needs an FTDI cable with a free SPI channel".into(),
            )
        })?;

        // The bridge gives the EPCQ bus to the SPI pins.
        let loader = format!("{}/{}", DATA_DIR, SFL_SVF);
        debug!("loading serial flash loader {}", loader);
        SvfPlayer::new(&mut *self.jtag).play_file(&loader)?;

        let reverse = parser::format_for_path(&self.filename) == FileFormat::Rpd;
        let raw = parser::read_file(&self.filename)?;
        let image = parser::raw::parse(&raw, false)?;

        let spi = MpsseSpi::open(vid, pid, 2, 6_000_000)?;
        let mut epcq = Epcq::new(spi);
        epcq.detect()?;
        epcq.program(offset, &image.data, reverse)?;
        Ok(())
    }
}

impl<'a, C: Transport> Device for Altera<'a, C> {
    fn program(&mut self, offset: u32) -> Result<()> {
        match self.mode {
            ProgMode::None => Ok(()),
            ProgMode::SramWrite => {
                let filename = self.filename.clone();
                SvfPlayer::new(&mut *self.jtag).play_file(&filename)
            }
            ProgMode::FlashWrite => {
                self.program_flash(offset)?;
                // The FPGA must reload the new flash content.
                self.reset()
            }
        }
    }

    fn idcode(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.jtag.go_test_logic_reset()?;
        self.jtag
            .shift_ir(&[IDCODE, 0x00], None, IRLEN, TapState::RunTestIdle)?;
        self.jtag
            .shift_dr(None, Some(&mut rx), 32, TapState::RunTestIdle)?;
        Ok(u32::from_le_bytes(rx))
    }

    /// PULSE_NCONFIG: restart configuration from the attached memory.
    fn reset(&mut self) -> Result<()> {
        let tx = [0x01u8, 0x00];
        self.jtag.set_state(TapState::TestLogicReset)?;
        self.jtag
            .shift_ir(&tx, None, IRLEN, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)?;
        self.jtag.set_state(TapState::TestLogicReset)?;
        self.jtag.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TapSim;

    #[test]
    fn reset_pulses_nconfig() {
        let mut jtag = Jtag::new(TapSim::new());
        {
            let mut altera = Altera::new(&mut jtag, "", None);
            altera.reset().unwrap();
        }
        let sim = jtag.cable_mut();
        assert_eq!(sim.ir_updates, vec![0x001]);
        assert_eq!(sim.state, TapState::TestLogicReset);
    }

    #[test]
    fn idcode_shift_uses_ten_bit_ir() {
        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut()
            .set_dr_response(IDCODE as u64, &[0x020F30DD]);
        let idcode = {
            let mut altera = Altera::new(&mut jtag, "", None);
            altera.idcode().unwrap()
        };
        assert_eq!(idcode, 0x020F30DD);
    }

    #[test]
    fn mode_selection() {
        let mut jtag = Jtag::new(TapSim::new());
        assert_eq!(Altera::new(&mut jtag, "a.svf", None).mode, ProgMode::SramWrite);
        let mut jtag = Jtag::new(TapSim::new());
        assert_eq!(Altera::new(&mut jtag, "a.rpd", None).mode, ProgMode::FlashWrite);
    }
}
