//! Cable transports: descriptor table and byte-level access to the
//! JTAG adapter.
//!
//! Every transport buffers TMS/TDI bits up to its own packet capacity;
//! smaller capacities must produce identical wire sequences as larger
//! ones, so the JTAG engine never needs to know which adapter it is
//! talking to.

use crate::Result;

pub mod bitbang;
pub mod bmd;
pub mod espusb;
pub mod fx2;
pub mod jlink;
pub mod mpsse;
pub mod xvc;

/// Capability set shared by all JTAG adapters.
///
/// `write_tms` holds TDI at its last value; `write_tdi` with
/// `end == true` raises TMS synchronously with the final TDI bit (the
/// Exit1 transition); `toggle_clk` holds both lines at the stated
/// levels and never captures TDO.
pub trait Transport {
    /// Negotiate the TCK frequency; returns the actual (clamped)
    /// frequency.
    fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32>;

    /// Feed `bits` TMS bits (LSB-first in `tms`). A call with
    /// `bits == 0` and `flush == true` is a pure flush.
    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()>;

    /// Shift `bits` TDI bits out, optionally capturing TDO into `rx`.
    /// With `tx == None` the TDI line idles high.
    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end: bool,
    ) -> Result<()>;

    /// Emit `cycles` idle clocks with TMS and TDI held at fixed levels.
    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()>;

    /// Push any pending bytes to the adapter.
    fn flush(&mut self) -> Result<()>;

    /// Internal buffer capacity in bits.
    fn buffer_capacity(&self) -> usize;
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CableKind {
    Mpsse,
    Jlink,
    EspUsbJtag,
    Xvc,
    RemoteBitbang,
    Bmd,
    Fx2,
    IcevWireless,
}

/// Immutable cable descriptor, selected by name at startup.
pub struct CableConfig {
    pub name: &'static str,
    pub kind: CableKind,
    pub vid: u16,
    pub pid: u16,
    /// FTDI channel (1 = A, 2 = B); interface index elsewhere.
    pub interface: u8,
    pub bit_low_val: u8,
    pub bit_low_dir: u8,
    pub bit_high_val: u8,
    pub bit_high_dir: u8,
    /// Default endpoint for network or serial transports.
    pub address: &'static str,
}

static CABLE_LIST: &[CableConfig] = &[
    CableConfig {
        name: "ft2232", kind: CableKind::Mpsse,
        vid: 0x0403, pid: 0x6010, interface: 1,
        bit_low_val: 0x08, bit_low_dir: 0x0B,
        bit_high_val: 0x00, bit_high_dir: 0x00,
        address: "",
    },
    CableConfig {
        name: "ft2232_b", kind: CableKind::Mpsse,
        vid: 0x0403, pid: 0x6010, interface: 2,
        bit_low_val: 0x08, bit_low_dir: 0x0B,
        bit_high_val: 0x00, bit_high_dir: 0x00,
        address: "",
    },
    CableConfig {
        name: "ft4232", kind: CableKind::Mpsse,
        vid: 0x0403, pid: 0x6011, interface: 1,
        bit_low_val: 0x08, bit_low_dir: 0x0B,
        bit_high_val: 0x00, bit_high_dir: 0x00,
        address: "",
    },
    CableConfig {
        name: "ft232", kind: CableKind::Mpsse,
        vid: 0x0403, pid: 0x6014, interface: 1,
        bit_low_val: 0x08, bit_low_dir: 0x0B,
        bit_high_val: 0x00, bit_high_dir: 0x00,
        address: "",
    },
    CableConfig {
        name: "digilent", kind: CableKind::Mpsse,
        vid: 0x0403, pid: 0x6010, interface: 1,
        bit_low_val: 0xE8, bit_low_dir: 0xEB,
        bit_high_val: 0x00, bit_high_dir: 0x60,
        address: "",
    },
    CableConfig {
        name: "jlink", kind: CableKind::Jlink,
        vid: 0x1366, pid: 0x0105, interface: 0,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "",
    },
    CableConfig {
        name: "esp_usb_jtag", kind: CableKind::EspUsbJtag,
        vid: 0x303A, pid: 0x1001, interface: 2,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "",
    },
    CableConfig {
        name: "xvc", kind: CableKind::Xvc,
        vid: 0, pid: 0, interface: 0,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "127.0.0.1:2542",
    },
    CableConfig {
        name: "remote_bitbang", kind: CableKind::RemoteBitbang,
        vid: 0, pid: 0, interface: 0,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "127.0.0.1:5555",
    },
    CableConfig {
        name: "bmd", kind: CableKind::Bmd,
        vid: 0x1D50, pid: 0x6018, interface: 0,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "/dev/ttyACM0",
    },
    CableConfig {
        name: "fx2", kind: CableKind::Fx2,
        vid: 0x04B4, pid: 0x8613, interface: 0,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "",
    },
    CableConfig {
        name: "icev_wireless", kind: CableKind::IcevWireless,
        vid: 0, pid: 0, interface: 0,
        bit_low_val: 0, bit_low_dir: 0, bit_high_val: 0, bit_high_dir: 0,
        address: "/dev/ttyUSB0",
    },
];

pub fn cable_by_name(name: &str) -> Option<&'static CableConfig> {
    CABLE_LIST.iter().find(|c| c.name == name)
}

/// One variant per supported adapter family. The JTAG engine only ever
/// sees the `Transport` surface.
pub enum Cable {
    Mpsse(mpsse::MpsseJtag),
    Jlink(jlink::Jlink),
    EspUsbJtag(espusb::EspUsbJtag),
    Xvc(xvc::XvcClient),
    RemoteBitbang(bitbang::RemoteBitbang),
    Bmd(bmd::Bmd),
    Fx2(fx2::Fx2Cable),
}

impl Cable {
    /// Open the transport described by `config` and negotiate
    /// `freq_hz`.
    pub fn open(config: &CableConfig, freq_hz: u32) -> Result<Cable> {
        let cable = match config.kind {
            CableKind::Mpsse => Cable::Mpsse(mpsse::MpsseJtag::open(config, freq_hz)?),
            CableKind::Jlink => Cable::Jlink(jlink::Jlink::open(freq_hz)?),
            CableKind::EspUsbJtag => {
                Cable::EspUsbJtag(espusb::EspUsbJtag::open(config, freq_hz)?)
            }
            CableKind::Xvc => Cable::Xvc(xvc::XvcClient::open(config.address, freq_hz)?),
            CableKind::RemoteBitbang => {
                Cable::RemoteBitbang(bitbang::RemoteBitbang::open(config.address)?)
            }
            CableKind::Bmd => Cable::Bmd(bmd::Bmd::open(config.address, freq_hz)?),
            CableKind::Fx2 => Cable::Fx2(fx2::Fx2Cable::open(config)?),
            CableKind::IcevWireless => {
                return Err(crate::ProgError::ConfigError(
                    "icev_wireless is not a JTAG cable; it is driven directly".into(),
                )
                .into())
            }
        };
        Ok(cable)
    }
}

impl Transport for Cable {
    fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        match self {
            Cable::Mpsse(c) => c.set_clk_freq(freq_hz),
            Cable::Jlink(c) => c.set_clk_freq(freq_hz),
            Cable::EspUsbJtag(c) => c.set_clk_freq(freq_hz),
            Cable::Xvc(c) => c.set_clk_freq(freq_hz),
            Cable::RemoteBitbang(c) => c.set_clk_freq(freq_hz),
            Cable::Bmd(c) => c.set_clk_freq(freq_hz),
            Cable::Fx2(c) => c.set_clk_freq(freq_hz),
        }
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        match self {
            Cable::Mpsse(c) => c.write_tms(tms, bits, flush),
            Cable::Jlink(c) => c.write_tms(tms, bits, flush),
            Cable::EspUsbJtag(c) => c.write_tms(tms, bits, flush),
            Cable::Xvc(c) => c.write_tms(tms, bits, flush),
            Cable::RemoteBitbang(c) => c.write_tms(tms, bits, flush),
            Cable::Bmd(c) => c.write_tms(tms, bits, flush),
            Cable::Fx2(c) => c.write_tms(tms, bits, flush),
        }
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end: bool,
    ) -> Result<()> {
        match self {
            Cable::Mpsse(c) => c.write_tdi(tx, rx, bits, end),
            Cable::Jlink(c) => c.write_tdi(tx, rx, bits, end),
            Cable::EspUsbJtag(c) => c.write_tdi(tx, rx, bits, end),
            Cable::Xvc(c) => c.write_tdi(tx, rx, bits, end),
            Cable::RemoteBitbang(c) => c.write_tdi(tx, rx, bits, end),
            Cable::Bmd(c) => c.write_tdi(tx, rx, bits, end),
            Cable::Fx2(c) => c.write_tdi(tx, rx, bits, end),
        }
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        match self {
            Cable::Mpsse(c) => c.toggle_clk(tms, tdi, cycles),
            Cable::Jlink(c) => c.toggle_clk(tms, tdi, cycles),
            Cable::EspUsbJtag(c) => c.toggle_clk(tms, tdi, cycles),
            Cable::Xvc(c) => c.toggle_clk(tms, tdi, cycles),
            Cable::RemoteBitbang(c) => c.toggle_clk(tms, tdi, cycles),
            Cable::Bmd(c) => c.toggle_clk(tms, tdi, cycles),
            Cable::Fx2(c) => c.toggle_clk(tms, tdi, cycles),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Cable::Mpsse(c) => c.flush(),
            Cable::Jlink(c) => c.flush(),
            Cable::EspUsbJtag(c) => c.flush(),
            Cable::Xvc(c) => c.flush(),
            Cable::RemoteBitbang(c) => c.flush(),
            Cable::Bmd(c) => c.flush(),
            Cable::Fx2(c) => c.flush(),
        }
    }

    fn buffer_capacity(&self) -> usize {
        match self {
            Cable::Mpsse(c) => c.buffer_capacity(),
            Cable::Jlink(c) => c.buffer_capacity(),
            Cable::EspUsbJtag(c) => c.buffer_capacity(),
            Cable::Xvc(c) => c.buffer_capacity(),
            Cable::RemoteBitbang(c) => c.buffer_capacity(),
            Cable::Bmd(c) => c.buffer_capacity(),
            Cable::Fx2(c) => c.buffer_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cable_lookup() {
        let ft = cable_by_name("ft2232").unwrap();
        assert_eq!(ft.vid, 0x0403);
        assert_eq!(ft.pid, 0x6010);
        assert_eq!(ft.interface, 1);
        assert!(cable_by_name("ft9999").is_none());
    }
}
