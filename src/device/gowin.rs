//! Gowin GW1N/GW2A driver.
//!
//! Configuration runs through 8-bit instructions with a short idle
//! after each IR or DR shift. SRAM load: CONFIG_ENABLE, ERASE_SRAM,
//! re-enable, XFER_WRITE with the whole bitstream streamed through
//! Shift-DR in 256-byte chunks, XFER_DONE, then a DONE_FINAL poll.
//! Verification reads USERCODE back and compares it against the
//! parser's 16-bit word sum.

use log::debug;

use crate::cable::Transport;
use crate::device::{Device, ProgMode};
use crate::display::{print_error, print_info, print_success};
use crate::jtag::{Jtag, TapState};
use crate::parser::Bitstream;
use crate::display::ProgressBar;
use crate::{ProgError, Result};

const NOOP: u8 = 0x02;
const ERASE_SRAM: u8 = 0x05;
const XFER_DONE: u8 = 0x09;
const READ_IDCODE: u8 = 0x11;
const READ_USERCODE: u8 = 0x13;
const CONFIG_ENABLE: u8 = 0x15;
const XFER_WRITE: u8 = 0x17;
const CONFIG_DISABLE: u8 = 0x3A;
const RELOAD: u8 = 0x3C;
const STATUS_REGISTER: u8 = 0x41;

const IRLEN: usize = 8;

// Status register bits.
pub const STATUS_CRC_ERROR: u32 = 1 << 0;
pub const STATUS_BAD_COMMAND: u32 = 1 << 1;
pub const STATUS_ID_VERIFY_FAILED: u32 = 1 << 2;
pub const STATUS_TIMEOUT: u32 = 1 << 3;
pub const STATUS_MEMORY_ERASE: u32 = 1 << 5;
pub const STATUS_PREAMBLE: u32 = 1 << 6;
pub const STATUS_SYSTEM_EDIT_MODE: u32 = 1 << 7;
pub const STATUS_PRG_SPIFLASH_DIRECT: u32 = 1 << 8;
pub const STATUS_NON_JTAG_CNF_ACTIVE: u32 = 1 << 10;
pub const STATUS_BYPASS: u32 = 1 << 11;
pub const STATUS_GOWIN_VLD: u32 = 1 << 12;
pub const STATUS_DONE_FINAL: u32 = 1 << 13;
pub const STATUS_SECURITY_FINAL: u32 = 1 << 14;
pub const STATUS_READY: u32 = 1 << 15;
pub const STATUS_POR: u32 = 1 << 16;
pub const STATUS_FLASH_LOCK: u32 = 1 << 17;

const POLL_LIMIT: u32 = 100_000;

pub struct Gowin<'a, C: Transport> {
    jtag: &'a mut Jtag<C>,
    bitstream: Option<Bitstream>,
    mode: ProgMode,
    verbose: bool,
}

impl<'a, C: Transport> Gowin<'a, C> {
    pub fn new(
        jtag: &'a mut Jtag<C>,
        bitstream: Option<Bitstream>,
        verbose: bool,
    ) -> Result<Self> {
        let mode = if bitstream.is_some() {
            ProgMode::SramWrite
        } else {
            ProgMode::None
        };
        // The configuration logic tops out well below the usual JTAG
        // rates.
        jtag.set_clk_freq(2_500_000)?;
        Ok(Self { jtag, bitstream, mode, verbose })
    }

    /// One instruction, optional DR payload, optional DR readback.
    /// Six idle clocks follow each shift.
    fn wr_rd(
        &mut self,
        cmd: u8,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
    ) -> Result<()> {
        self.jtag
            .shift_ir(&[cmd], None, IRLEN, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(6)?;
        if tx.is_some() || rx.is_some() {
            let nbits = 8 * tx.map(|t| t.len())
                .or_else(|| rx.as_deref().map(|r| r.len()))
                .unwrap_or(0);
            self.jtag.shift_dr(tx, rx, nbits, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(6)?;
        }
        self.jtag.flush()?;
        Ok(())
    }

    pub fn read_status_reg(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(STATUS_REGISTER, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    pub fn read_usercode(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(READ_USERCODE, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    fn display_status(&mut self) -> Result<()> {
        let status = self.read_status_reg()?;
        println!("status register 0x{:08x}", status);
        for (mask, name) in &[
            (STATUS_CRC_ERROR, "CRC Error"),
            (STATUS_BAD_COMMAND, "Bad Command"),
            (STATUS_ID_VERIFY_FAILED, "ID Verify Failed"),
            (STATUS_TIMEOUT, "Timeout"),
            (STATUS_MEMORY_ERASE, "Memory Erase"),
            (STATUS_PREAMBLE, "Preamble"),
            (STATUS_SYSTEM_EDIT_MODE, "System Edit Mode"),
            (STATUS_PRG_SPIFLASH_DIRECT, "Program spi flash directly"),
            (STATUS_NON_JTAG_CNF_ACTIVE, "Non-jtag is active"),
            (STATUS_BYPASS, "Bypass"),
            (STATUS_GOWIN_VLD, "Gowin VLD"),
            (STATUS_DONE_FINAL, "Done Final"),
            (STATUS_SECURITY_FINAL, "Security Final"),
            (STATUS_READY, "Ready"),
            (STATUS_POR, "POR"),
            (STATUS_FLASH_LOCK, "Flash Lock"),
        ] {
            if status & mask != 0 {
                println!("\t{}", name);
            }
        }
        Ok(())
    }

    /// Poll the status register until `(status & mask) == value`.
    fn poll_flag(&mut self, mask: u32, value: u32) -> Result<()> {
        for _ in 0..POLL_LIMIT {
            let status = self.read_status_reg()?;
            debug!("poll_flag: {:08x}", status);
            if status & mask == value {
                return Ok(());
            }
        }
        Err(ProgError::FlashTimeout.into())
    }

    fn enable_cfg(&mut self) -> Result<()> {
        self.wr_rd(CONFIG_ENABLE, None, None)?;
        self.poll_flag(STATUS_SYSTEM_EDIT_MODE, STATUS_SYSTEM_EDIT_MODE)
    }

    fn disable_cfg(&mut self) -> Result<()> {
        self.wr_rd(CONFIG_DISABLE, None, None)?;
        self.wr_rd(NOOP, None, None)?;
        self.poll_flag(STATUS_SYSTEM_EDIT_MODE, 0)
    }

    fn erase_sram(&mut self) -> Result<()> {
        print_info("erase SRAM");
        self.wr_rd(ERASE_SRAM, None, None)?;
        self.wr_rd(NOOP, None, None)?;
        // MEMORY_ERASE drops when the erase starts and rises on
        // completion; waiting on it replaces the 4ms figure from the
        // technote.
        self.poll_flag(STATUS_MEMORY_ERASE, STATUS_MEMORY_ERASE)?;
        print_success("Done");
        Ok(())
    }

    /// Stream the whole bitstream through Shift-DR, asserting Exit1
    /// only on the final 256-byte chunk.
    fn flash_sram(&mut self, data: &[u8], bit_length: usize) -> Result<()> {
        let byte_length = bit_length / 8;
        let progress = ProgressBar::new("Flash SRAM", byte_length as u64);

        self.wr_rd(XFER_WRITE, None, None)?;

        self.jtag.set_state(TapState::ShiftDr)?;
        let mut pos = 0;
        while pos < byte_length {
            let (tx_len, tx_end) = if pos + 256 > byte_length {
                ((byte_length - pos) * 8, true)
            } else {
                (256 * 8, false)
            };
            self.jtag
                .read_write(Some(&data[pos..]), None, tx_len, tx_end)?;
            self.jtag.flush()?;
            progress.display(pos as u64);
            pos += tx_len / 8;
        }
        self.jtag.set_state(TapState::RunTestIdle)?;

        self.wr_rd(XFER_DONE, None, None)?;
        match self.poll_flag(STATUS_DONE_FINAL, STATUS_DONE_FINAL) {
            Ok(()) => {
                progress.done();
                Ok(())
            }
            Err(e) => {
                progress.fail();
                Err(e)
            }
        }
    }

    pub fn reload(&mut self) -> Result<()> {
        self.wr_rd(RELOAD, None, None)?;
        self.wr_rd(NOOP, None, None)?;
        self.jtag.flush()
    }
}

impl<'a, C: Transport> Device for Gowin<'a, C> {
    fn program(&mut self, _offset: u32) -> Result<()> {
        if self.mode == ProgMode::None {
            return Ok(());
        }
        let bitstream = match self.bitstream.take() {
            Some(bs) => bs,
            None => return Ok(()),
        };

        if self.verbose {
            self.display_status()?;
        }

        self.wr_rd(READ_IDCODE, None, None)?;

        // Erase SRAM, then reopen configuration for the transfer.
        self.enable_cfg()?;
        self.erase_sram()?;
        self.disable_cfg()?;

        self.enable_cfg()?;
        self.flash_sram(&bitstream.data, bitstream.bit_length)?;
        self.disable_cfg()?;

        // The device accumulates the same 16-bit word sum the parser
        // computed; it is readable as USERCODE.
        let usercode = self.read_usercode()?;
        let expected = bitstream.checksum.unwrap_or(0) as u32;
        if usercode != expected {
            print_error("SRAM Flash: FAIL");
            return Err(ProgError::FlashVerifyMismatch(usercode).into());
        }
        print_success("SRAM Flash: Success");

        if self.verbose {
            self.display_status()?;
        }
        Ok(())
    }

    fn idcode(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(READ_IDCODE, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    fn reset(&mut self) -> Result<()> {
        self.reload()
    }
}
