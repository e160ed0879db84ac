//! FTDI MPSSE transports (FT2232/FT4232/FT232H families).
//!
//! The FTDI chip is driven directly over USB bulk endpoints: vendor
//! control requests configure the chip, MPSSE opcodes clock the JTAG or
//! SPI lines. Read data arrives with two modem-status bytes prepended
//! to every USB packet, which are stripped here.

use std::time::Duration;

use failure::ResultExt;
use log::debug;
use rusb::{Context, DeviceHandle, UsbContext};

use crate::cable::CableConfig;
use crate::display::print_info;
use crate::{ProgError, Result};

// FTDI SIO vendor requests.
const SIO_RESET: u8 = 0x00;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

const BITMODE_RESET: u16 = 0x00;
const BITMODE_MPSSE: u16 = 0x02;

// MPSSE opcodes.
const MPSSE_WRITE_NEG: u8 = 0x01;
const MPSSE_BITMODE: u8 = 0x02;
const MPSSE_READ_NEG: u8 = 0x04;
const MPSSE_LSB: u8 = 0x08;
const MPSSE_DO_WRITE: u8 = 0x10;
const MPSSE_DO_READ: u8 = 0x20;
const MPSSE_WRITE_TMS: u8 = 0x40;

const SET_BITS_LOW: u8 = 0x80;
const SET_BITS_HIGH: u8 = 0x82;
const LOOPBACK_END: u8 = 0x85;
const TCK_DIVISOR: u8 = 0x86;
const SEND_IMMEDIATE: u8 = 0x87;
const DIS_DIV_5: u8 = 0x8A;
const EN_DIV_5: u8 = 0x8B;
const DIS_ADAPTIVE: u8 = 0x97;
const DIS_3_PHASE: u8 = 0x8D;

const USB_TIMEOUT: Duration = Duration::from_secs(1);

/// TCK prescaler for a requested frequency, rounding the output down:
/// real = base / ((1 + presc) * 2).
pub fn divisor_for(base_freq: u32, clk: u32) -> (u32, u32) {
    let mut presc = ((base_freq / clk) - 1) / 2;
    let mut real_freq = base_freq / ((1 + presc) * 2);
    if real_freq > clk {
        presc += 1;
        real_freq = base_freq / ((1 + presc) * 2);
    }
    (presc, real_freq)
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum ChipType {
    Ft2232c,
    Ft2232h,
    Ft4232h,
    Ft232h,
}

/// Low-level FTDI channel: one claimed interface plus its bulk
/// endpoint pair.
pub struct FtdiContext {
    handle: DeviceHandle<Context>,
    index: u16,
    in_ep: u8,
    out_ep: u8,
    max_packet: usize,
    chip: ChipType,
}

impl FtdiContext {
    /// Open `vid:pid` and claim the given FTDI channel (1 = A, 2 = B).
    pub fn open(vid: u16, pid: u16, channel: u8) -> Result<Self> {
        let context = Context::new().context("Error creating USB context")?;
        let handle = context
            .open_device_with_vid_pid(vid, pid)
            .ok_or_else(|| {
                ProgError::TransportError(format!(
                    "no FTDI device {:04x}:{:04x} found", vid, pid
                ))
            })?;
        handle.set_auto_detach_kernel_driver(true).ok();
        handle
            .claim_interface(channel - 1)
            .context("Error claiming FTDI interface")?;

        let desc = handle
            .device()
            .device_descriptor()
            .context("Error reading device descriptor")?;
        let chip = match desc.device_version() {
            rusb::Version(5, ..) => ChipType::Ft2232c,
            rusb::Version(8, ..) => ChipType::Ft4232h,
            rusb::Version(9, ..) => ChipType::Ft232h,
            _ => ChipType::Ft2232h,
        };
        let max_packet = match chip {
            ChipType::Ft2232c => 64,
            _ => 512,
        };

        Ok(Self {
            handle,
            index: channel as u16,
            in_ep: 0x81 + 2 * (channel - 1),
            out_ep: 0x02 + 2 * (channel - 1),
            max_packet,
            chip,
        })
    }

    fn control(&self, request: u8, value: u16) -> Result<()> {
        self.handle
            .write_control(0x40, request, value, self.index, &[], USB_TIMEOUT)
            .context("FTDI control request failed")?;
        Ok(())
    }

    fn usb_reset(&self) -> Result<()> {
        self.control(SIO_RESET, SIO_RESET_SIO)
    }

    fn purge_buffers(&self) -> Result<()> {
        self.control(SIO_RESET, SIO_RESET_PURGE_RX)?;
        self.control(SIO_RESET, SIO_RESET_PURGE_TX)
    }

    fn set_bitmode(&self, mask: u8, mode: u16) -> Result<()> {
        self.control(SIO_SET_BITMODE, (mode << 8) | mask as u16)
    }

    fn set_latency_timer(&self, ms: u8) -> Result<()> {
        self.control(SIO_SET_LATENCY_TIMER, ms as u16)
    }

    fn write_data(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self
                .handle
                .write_bulk(self.out_ep, &data[written..], USB_TIMEOUT)
                .context("FTDI bulk write failed")?;
            written += n;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` payload bytes, stripping the two
    /// modem-status bytes from every packet.
    fn read_data(&self, buf: &mut [u8]) -> Result<()> {
        let mut packet = vec![0u8; self.max_packet];
        let mut filled = 0;
        let mut tries = 50;
        while filled < buf.len() {
            let n = self
                .handle
                .read_bulk(self.in_ep, &mut packet, USB_TIMEOUT)
                .context("FTDI bulk read failed")?;
            if n > 2 {
                let payload = &packet[2..n];
                let take = payload.len().min(buf.len() - filled);
                buf[filled..filled + take].copy_from_slice(&payload[..take]);
                filled += take;
            } else {
                tries -= 1;
                if tries == 0 {
                    return Err(ProgError::TransportError(
                        "FTDI read returned no data".into(),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Shared MPSSE command buffering on top of an FTDI channel.
pub struct Mpsse {
    ftdi: FtdiContext,
    buffer: Vec<u8>,
    buffer_size: usize,
    clk_hz: u32,
}

impl Mpsse {
    pub fn new(ftdi: FtdiContext) -> Self {
        let buffer_size = ftdi.max_packet.max(512) * 4;
        Self {
            ftdi,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            clk_hz: 0,
        }
    }

    /// Reset the chip into MPSSE mode and program the idle pin state
    /// from the cable descriptor.
    fn init(&mut self, config: &CableConfig, freq_hz: u32) -> Result<()> {
        self.ftdi.usb_reset()?;
        self.ftdi.set_bitmode(0x00, BITMODE_RESET)?;
        self.ftdi.purge_buffers()?;
        self.ftdi.set_latency_timer(1)?;
        self.ftdi.set_bitmode(0x0B, BITMODE_MPSSE)?;

        self.set_clk_freq(freq_hz)?;

        self.store(&[SET_BITS_LOW, config.bit_low_val, config.bit_low_dir])?;
        // FT4232H has no high byte.
        if self.ftdi.chip != ChipType::Ft4232h {
            self.store(&[SET_BITS_HIGH, config.bit_high_val, config.bit_high_dir])?;
        }
        self.write()
    }

    pub fn store_byte(&mut self, byte: u8) -> Result<()> {
        self.store(&[byte])
    }

    pub fn store(&mut self, data: &[u8]) -> Result<()> {
        if self.buffer.len() + data.len() > self.buffer_size {
            self.write()?;
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn write(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        debug!("mpsse write {} bytes", self.buffer.len());
        self.ftdi.write_data(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Force pending commands out and read back `rx.len()` bytes.
    pub fn read(&mut self, rx: &mut [u8]) -> Result<()> {
        self.store_byte(SEND_IMMEDIATE)?;
        self.write()?;
        self.ftdi.read_data(rx)
    }

    /// Negotiate TCK. Requested Hz is rounded down to the nearest
    /// divisor: real = base / ((1 + presc) * 2).
    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        let mut clk = freq_hz;
        let base_freq;

        // FT2232C has no divide-by-5 opcode and a 12 MHz base clock.
        if self.ftdi.chip != ChipType::Ft2232c {
            if clk > 6_000_000 {
                base_freq = 60_000_000;
                self.store_byte(DIS_DIV_5)?;
            } else {
                base_freq = 12_000_000;
                self.store_byte(EN_DIV_5)?;
            }
        } else {
            base_freq = 12_000_000;
        }

        if clk > base_freq / 2 {
            clk = base_freq / 2;
        }

        let (presc, real_freq) = divisor_for(base_freq, clk);

        print_info(&format!(
            "Jtag frequency: requested {}Hz -> real {}Hz", freq_hz, real_freq
        ));
        debug!("mpsse presc {} base {} real {}", presc, base_freq, real_freq);

        self.store(&[TCK_DIVISOR, (presc & 0xFF) as u8, (presc >> 8) as u8])?;
        self.write()?;
        self.ftdi.purge_buffers()?;

        self.clk_hz = real_freq;
        Ok(real_freq)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// JTAG over MPSSE: TMS moves via 0x4B, TDI bytes via 0x19/0x39, TDI
/// bit remainders via 0x1B/0x3B.
pub struct MpsseJtag {
    mpsse: Mpsse,
    last_tdi: bool,
}

impl MpsseJtag {
    pub fn open(config: &CableConfig, freq_hz: u32) -> Result<Self> {
        let ftdi = FtdiContext::open(config.vid, config.pid, config.interface)?;
        let mut mpsse = Mpsse::new(ftdi);
        mpsse.init(config, freq_hz)?;
        Ok(Self { mpsse, last_tdi: false })
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        self.mpsse.set_clk_freq(freq_hz)
    }

    pub fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        if bits == 0 {
            if flush {
                self.mpsse.write()?;
            }
            return Ok(());
        }

        // Up to 6 TMS bits per command; TDI level rides in bit 7.
        let tdi_bit = if self.last_tdi { 0x80 } else { 0x00 };
        let mut pos = 0;
        while pos < bits {
            let chunk = (bits - pos).min(6);
            let mut val = 0u8;
            for i in 0..chunk {
                if crate::bits::get_bit(tms, pos + i) {
                    val |= 1 << i;
                }
            }
            let cmd = MPSSE_WRITE_TMS | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG;
            self.mpsse.store(&[cmd, (chunk - 1) as u8, val | tdi_bit])?;
            pos += chunk;
        }

        if flush {
            self.mpsse.write()?;
        }
        Ok(())
    }

    pub fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        mut rx: Option<&mut [u8]>,
        bits: usize,
        end: bool,
    ) -> Result<()> {
        if bits == 0 {
            return Ok(());
        }

        // The last bit rides on the TMS command when `end` is set.
        let shift_bits = if end { bits - 1 } else { bits };

        if let Some(buf) = rx.as_deref_mut() {
            for b in buf.iter_mut() {
                *b = 0;
            }
        }

        let read = rx.is_some();
        let full_bytes = shift_bits / 8;
        let rem_bits = shift_bits % 8;

        // Whole bytes, chunked so a read never overruns the chip FIFO.
        let chunk_max = if read { 2048 } else { self.mpsse.buffer_size() - 3 };
        let mut byte_pos = 0;
        while byte_pos < full_bytes {
            let chunk = (full_bytes - byte_pos).min(chunk_max);
            let cmd = if read {
                MPSSE_DO_WRITE | MPSSE_DO_READ | MPSSE_LSB | MPSSE_WRITE_NEG
            } else {
                MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_WRITE_NEG
            };
            let len = chunk - 1;
            self.mpsse.store(&[cmd, (len & 0xFF) as u8, (len >> 8) as u8])?;
            match tx {
                Some(data) => self.mpsse.store(&data[byte_pos..byte_pos + chunk])?,
                None => {
                    for _ in 0..chunk {
                        self.mpsse.store_byte(0xFF)?;
                    }
                }
            }
            if let Some(buf) = rx.as_deref_mut() {
                self.mpsse.read(&mut buf[byte_pos..byte_pos + chunk])?;
            }
            byte_pos += chunk;
        }

        // Partial trailing byte.
        if rem_bits > 0 {
            let cmd = if read {
                MPSSE_DO_WRITE | MPSSE_DO_READ | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG
            } else {
                MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG
            };
            let byte = match tx {
                Some(data) => data[full_bytes],
                None => 0xFF,
            };
            self.mpsse.store(&[cmd, (rem_bits - 1) as u8, byte])?;
            if let Some(buf) = rx.as_deref_mut() {
                let mut raw = [0u8; 1];
                self.mpsse.read(&mut raw)?;
                // Bits land MSB-justified in the response byte.
                buf[full_bytes] = raw[0] >> (8 - rem_bits);
            }
        }

        if end {
            let last = match tx {
                Some(data) => crate::bits::get_bit(data, bits - 1),
                None => true,
            };
            self.last_tdi = last;
            let tdi_bit = if last { 0x80 } else { 0x00 };
            let cmd = if read {
                MPSSE_WRITE_TMS | MPSSE_DO_READ | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG
            } else {
                MPSSE_WRITE_TMS | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG
            };
            self.mpsse.store(&[cmd, 0x00, 0x01 | tdi_bit])?;
            if let Some(buf) = rx.as_deref_mut() {
                let mut raw = [0u8; 1];
                self.mpsse.read(&mut raw)?;
                crate::bits::set_bit(buf, bits - 1, raw[0] & 0x80 != 0);
            }
        } else if let Some(data) = tx {
            self.last_tdi = crate::bits::get_bit(data, bits - 1);
        } else {
            self.last_tdi = true;
        }

        Ok(())
    }

    pub fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        // TMS commands with a constant value give exact level control.
        self.last_tdi = tdi;
        let tdi_bit = if tdi { 0x80 } else { 0x00 };
        let val = if tms { 0x3F } else { 0x00 };
        let cmd = MPSSE_WRITE_TMS | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG;
        let mut rest = cycles;
        while rest > 0 {
            let chunk = rest.min(6);
            let mask = ((1u32 << chunk) - 1) as u8;
            self.mpsse
                .store(&[cmd, (chunk - 1) as u8, (val & mask) | tdi_bit])?;
            rest -= chunk;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.mpsse.write()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.mpsse.buffer_size() * 8
    }
}

#[derive(Copy, Clone, PartialEq)]
pub enum CsMode {
    Auto,
    Manual,
}

/// SPI over MPSSE, used by the EPCQ engine on the FTDI's second
/// channel. Mode 0 clocking, CS on ADBUS3, MSB-first on the wire.
pub struct MpsseSpi {
    mpsse: Mpsse,
    cs_mode: CsMode,
}

const SPI_CS_BIT: u8 = 0x08;
const SPI_PIN_DIR: u8 = 0x0B;

impl MpsseSpi {
    pub fn open(vid: u16, pid: u16, channel: u8, freq_hz: u32) -> Result<Self> {
        let ftdi = FtdiContext::open(vid, pid, channel)?;
        let mut mpsse = Mpsse::new(ftdi);

        mpsse.ftdi.usb_reset()?;
        mpsse.ftdi.set_bitmode(0x00, BITMODE_RESET)?;
        mpsse.ftdi.purge_buffers()?;
        mpsse.ftdi.set_latency_timer(1)?;
        mpsse.ftdi.set_bitmode(0x00, BITMODE_MPSSE)?;
        mpsse.set_clk_freq(freq_hz)?;
        mpsse.store(&[DIS_ADAPTIVE, DIS_3_PHASE, LOOPBACK_END])?;
        mpsse.store(&[SET_BITS_LOW, SPI_CS_BIT, SPI_PIN_DIR])?;
        mpsse.write()?;

        Ok(Self { mpsse, cs_mode: CsMode::Auto })
    }

    pub fn set_cs_mode(&mut self, mode: CsMode) {
        self.cs_mode = mode;
    }

    pub fn set_cs(&mut self) -> Result<()> {
        self.mpsse.store(&[SET_BITS_LOW, SPI_CS_BIT, SPI_PIN_DIR])?;
        self.mpsse.write()
    }

    pub fn clear_cs(&mut self) -> Result<()> {
        self.mpsse.store(&[SET_BITS_LOW, 0x00, SPI_PIN_DIR])?;
        self.mpsse.write()
    }

    /// Full-duplex transfer: write `tx` (or idle 0x00) while optionally
    /// capturing MISO into `rx`.
    pub fn wr_and_rd(
        &mut self,
        len: usize,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let auto = self.cs_mode == CsMode::Auto;
        if auto {
            self.clear_cs()?;
        }

        let cmd = match (tx.is_some(), rx.is_some()) {
            (true, true) => MPSSE_DO_WRITE | MPSSE_DO_READ | MPSSE_WRITE_NEG,
            (true, false) => MPSSE_DO_WRITE | MPSSE_WRITE_NEG,
            (false, _) => MPSSE_DO_READ,
        };
        let n = len - 1;
        self.mpsse.store(&[cmd, (n & 0xFF) as u8, (n >> 8) as u8])?;
        if let Some(data) = tx {
            self.mpsse.store(&data[..len])?;
        }
        if let Some(buf) = rx {
            self.mpsse.read(&mut buf[..len])?;
        } else {
            self.mpsse.write()?;
        }

        if auto {
            self.set_cs()?;
        }
        Ok(())
    }

    /// Write `tx` then read `rx.len()` bytes within one CS assertion.
    pub fn wr_then_rd(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        self.set_cs_mode(CsMode::Manual);
        self.clear_cs()?;
        self.wr_and_rd(tx.len(), Some(tx), None)?;
        self.wr_and_rd(rx.len(), None, Some(rx))?;
        self.set_cs()?;
        self.set_cs_mode(CsMode::Auto);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::divisor_for;

    #[test]
    fn divisor_rounds_down_from_above() {
        // Exact hits.
        assert_eq!(divisor_for(60_000_000, 6_000_000), (4, 6_000_000));
        assert_eq!(divisor_for(60_000_000, 30_000_000), (0, 30_000_000));
        assert_eq!(divisor_for(12_000_000, 6_000_000), (0, 6_000_000));
        // Requests between divisors land on the next lower rate.
        assert_eq!(divisor_for(12_000_000, 5_000_000), (1, 3_000_000));
        assert_eq!(divisor_for(60_000_000, 7_000_000), (4, 6_000_000));
        // Never exceeds the request.
        for req in (100_000..30_000_000).step_by(999_983) {
            let (_, real) = divisor_for(60_000_000, req);
            assert!(real <= req);
        }
    }
}
