//! Per-vendor device drivers.
//!
//! Drivers are constructed per operation, hold a non-owning reference
//! to the JTAG engine, and are gone before the transport closes. Every
//! driver leaves the TAP in Run-Test/Idle or Test-Logic-Reset on both
//! success and failure paths.

use crate::Result;

pub mod altera;
pub mod gowin;
pub mod lattice;
pub mod xilinx;

/// Where the shipped bridge bitstreams and SVF loaders live.
pub const DATA_DIR: &str = "/usr/local/share/jtagprog";

/// Programming mode, derived from the input file extension.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProgMode {
    None,
    /// Volatile load into configuration SRAM.
    SramWrite,
    /// Write through the FPGA into external flash.
    FlashWrite,
}

/// Common entry points shared by all drivers.
pub trait Device {
    fn program(&mut self, offset: u32) -> Result<()>;
    fn idcode(&mut self) -> Result<u32>;
    fn reset(&mut self) -> Result<()>;
}
