use failure_derive::Fail;

pub mod bits;
pub mod board;
pub mod cable;
pub mod device;
pub mod display;
pub mod flash;
pub mod icev;
pub mod jtag;
pub mod parser;
pub mod parts;
#[cfg(test)]
pub mod sim;
pub mod svf;

pub use cable::{Cable, Transport};
pub use jtag::{Jtag, TapState};
pub use parser::Bitstream;

#[derive(Fail, Debug)]
pub enum ProgError {
    #[fail(display="USB error: {}", _0)]
    USBError(#[cause] rusb::Error),

    #[fail(display="Transport error: {}", _0)]
    TransportError(String),

    #[fail(display="Protocol error: {}", _0)]
    ProtocolError(String),

    #[fail(display="Parse error: {}", _0)]
    ParseError(String),

    #[fail(display="Flash operation timed out")]
    FlashTimeout,

    #[fail(display="Flash erase failed at address 0x{:08X}", _0)]
    FlashEraseFailed(u32),

    #[fail(display="Flash program failed at address 0x{:08X}", _0)]
    FlashProgramFailed(u32),

    #[fail(display="Flash verify mismatch at address 0x{:08X}", _0)]
    FlashVerifyMismatch(u32),

    #[fail(display="Device with IDCODE 0x{:08X} is not supported", _0)]
    UnsupportedDevice(u32),

    #[fail(display="Chains with {} devices are not supported", _0)]
    UnsupportedChain(usize),

    #[fail(display="Configuration error: {}", _0)]
    ConfigError(String),
}

impl From<rusb::Error> for ProgError {
    fn from(error: rusb::Error) -> Self {
        ProgError::USBError(error)
    }
}

pub type Result<T> = std::result::Result<T, failure::Error>;
