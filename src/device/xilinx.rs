//! Xilinx 7-series driver.
//!
//! SRAM configuration follows the JTAG load sequence from the
//! configuration user guide: JSHUTDOWN/JPROGRAM, a BYPASS poll until
//! the device is ready for CFG_IN, the full bitstream through the DR,
//! then JSTART with at least 2000 startup clocks. SPI flash is reached
//! through the `spiOverJtag` bridge loaded into SRAM first.

use failure::ResultExt;
use log::debug;

use crate::cable::Transport;
use crate::device::{Device, ProgMode, DATA_DIR};
use crate::display::print_info;
use crate::flash::spi::SpiFlash;
use crate::jtag::{Jtag, TapState};
use crate::parser::{self, Bitstream, FileFormat};
use crate::parts::fpga_by_idcode;
use crate::{ProgError, Result};

const CFG_IN: u8 = 0x05;
const IDCODE: u8 = 0x09;
const JPROGRAM: u8 = 0x0B;
const JSTART: u8 = 0x0C;
const JSHUTDOWN: u8 = 0x0D;
const BYPASS: u8 = 0x3F;

const IRLEN: usize = 6;

pub struct Xilinx<'a, C: Transport> {
    jtag: &'a mut Jtag<C>,
    filename: String,
    mode: ProgMode,
}

impl<'a, C: Transport> Xilinx<'a, C> {
    pub fn new(jtag: &'a mut Jtag<C>, filename: &str) -> Self {
        let mode = if filename.is_empty() {
            ProgMode::None
        } else if parser::format_for_path(filename) == FileFormat::Bit {
            ProgMode::SramWrite
        } else {
            ProgMode::FlashWrite
        };
        Self { jtag, filename: filename.to_string(), mode }
    }

    /// Shift a bitstream into configuration SRAM.
    fn program_mem(&mut self, bitfile: &Bitstream) -> Result<()> {
        print_info("load program");

        // Ensure Test-Logic-Reset before reconfiguration.
        self.jtag.go_test_logic_reset()?;

        self.jtag.shift_ir_u8(JSHUTDOWN, IRLEN)?;
        self.jtag.shift_ir_u8(JPROGRAM, IRLEN)?;

        // Poll BYPASS until the configuration memory is cleared; the
        // captured LSB goes high when the device is ready.
        let mut tries = 1000;
        loop {
            let mut rx = [0u8; 1];
            self.jtag
                .shift_ir(&[BYPASS], Some(&mut rx), IRLEN, TapState::RunTestIdle)?;
            if rx[0] & 0x01 != 0 {
                break;
            }
            tries -= 1;
            if tries == 0 {
                self.jtag.go_test_logic_reset()?;
                return Err(ProgError::ProtocolError(
                    "device stuck in configuration reset".into(),
                )
                .into());
            }
        }

        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(10_000 * 12)?;

        self.jtag.shift_ir_u8(CFG_IN, IRLEN)?;
        self.jtag
            .shift_dr(Some(&bitfile.data), None, bitfile.bit_length, TapState::UpdateDr)?;
        self.jtag.set_state(TapState::RunTestIdle)?;

        self.jtag
            .shift_ir(&[JSTART], None, IRLEN, TapState::UpdateIr)?;
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(2000)?;

        self.jtag.go_test_logic_reset()?;
        self.jtag.flush()?;
        Ok(())
    }

    /// Load the SPI bridge, then erase and program the flash.
    fn program_spi(&mut self, offset: u32) -> Result<()> {
        let idcode = self.idcode()?;
        let model = fpga_by_idcode(idcode)
            .ok_or(ProgError::UnsupportedDevice(idcode))?;
        let bridge = model
            .spi_over_jtag
            .ok_or_else(|| {
                ProgError::ConfigError(format!(
                    "no SPI bridge shipped for {}", model.model
                ))
            })?;
        let bridge_path = format!("{}/{}", DATA_DIR, bridge);
        debug!("loading SPI bridge {}", bridge_path);

        let raw = parser::read_file(&bridge_path)
            .with_context(|_| format!("Error loading bridge {}", bridge_path))?;
        let bridge_bit = parser::bit::parse(&raw)?;
        self.program_mem(&bridge_bit)?;

        let raw = parser::read_file(&self.filename)?;
        let image = match parser::format_for_path(&self.filename) {
            FileFormat::Mcs => parser::mcs::parse(&raw)?,
            _ => parser::raw::parse(&raw, false)?,
        };

        let mut flash = SpiFlash::new(&mut *self.jtag);
        flash.read_id()?;
        flash.erase_and_prog(offset, &image.data)?;
        Ok(())
    }
}

impl<'a, C: Transport> Device for Xilinx<'a, C> {
    fn program(&mut self, offset: u32) -> Result<()> {
        match self.mode {
            ProgMode::None => Ok(()),
            ProgMode::SramWrite => {
                let raw = parser::read_file(&self.filename)?;
                let bitfile = parser::bit::parse(&raw)?;
                bitfile.display_header();
                self.program_mem(&bitfile)
            }
            ProgMode::FlashWrite => {
                self.program_spi(offset)?;
                self.reset()
            }
        }
    }

    fn idcode(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.jtag.go_test_logic_reset()?;
        self.jtag.shift_ir_u8(IDCODE, IRLEN)?;
        self.jtag
            .shift_dr(None, Some(&mut rx), 32, TapState::RunTestIdle)?;
        Ok(u32::from_le_bytes(rx))
    }

    /// Pulse reconfiguration: the device restarts from its attached
    /// configuration memory.
    fn reset(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(JSHUTDOWN, IRLEN)?;
        self.jtag.shift_ir_u8(JPROGRAM, IRLEN)?;
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(10_000 * 12)?;

        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(2000)?;

        self.jtag.shift_ir_u8(BYPASS, IRLEN)?;
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(2000)?;
        self.jtag.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::bit::tests::build_bit_file;
    use crate::sim::TapSim;

    #[test]
    fn sram_load_sequence() {
        // A 256-byte payload of 0x0F: the parser reverses it to 0xF0
        // on the wire.
        let raw = build_bit_file(&[0x0F; 256]);
        let bitfile = parser::bit::parse(&raw).unwrap();

        let mut jtag = Jtag::new(TapSim::new());
        {
            let mut xilinx = Xilinx::new(&mut jtag, "top.bit");
            xilinx.program_mem(&bitfile).unwrap();
        }
        let sim = jtag.cable_mut();

        // IR sequence: JSHUTDOWN, JPROGRAM, BYPASS poll (ready at
        // once), CFG_IN, JSTART.
        assert_eq!(
            sim.ir_updates,
            vec![
                JSHUTDOWN as u64,
                JPROGRAM as u64,
                BYPASS as u64,
                CFG_IN as u64,
                JSTART as u64,
            ]
        );

        // One DR update per program_mem call: 1 BYPASS capture shifts
        // no DR, so the only DR payload is the bitstream itself.
        assert_eq!(sim.dr_lengths, vec![2048]);
        let dr = &sim.dr_updates[0];
        assert_eq!(dr.len(), 256);
        assert!(dr.iter().all(|&b| b == 0xF0));

        // Startup clocking: 120000 clocks after JPROGRAM plus >= 2000
        // after JSTART.
        assert!(sim.idle_clocks >= 122_000);
        assert_eq!(sim.state, TapState::TestLogicReset);
    }

    #[test]
    fn reset_sequence() {
        let mut jtag = Jtag::new(TapSim::new());
        {
            let mut xilinx = Xilinx::new(&mut jtag, "");
            xilinx.reset().unwrap();
        }
        let sim = jtag.cable_mut();
        assert_eq!(
            sim.ir_updates,
            vec![JSHUTDOWN as u64, JPROGRAM as u64, BYPASS as u64]
        );
        assert!(sim.idle_clocks >= 124_000);
        assert_eq!(sim.state, TapState::RunTestIdle);
    }

    #[test]
    fn mode_from_extension() {
        let mut jtag = Jtag::new(TapSim::new());
        assert_eq!(Xilinx::new(&mut jtag, "a.bit").mode, ProgMode::SramWrite);
        let mut jtag = Jtag::new(TapSim::new());
        assert_eq!(Xilinx::new(&mut jtag, "a.mcs").mode, ProgMode::FlashWrite);
        let mut jtag = Jtag::new(TapSim::new());
        assert_eq!(Xilinx::new(&mut jtag, "").mode, ProgMode::None);
    }
}
