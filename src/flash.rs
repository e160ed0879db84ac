//! External flash engines reached through a bridge design loaded into
//! the FPGA first: SPI NOR over JTAG, BPI parallel NOR over JTAG, and
//! the Altera EPCQ over a dedicated MPSSE-SPI channel.

pub mod bpi;
pub mod epcq;
pub mod spi;
