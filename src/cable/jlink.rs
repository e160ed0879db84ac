//! SEGGER J-Link probe over USB bulk transfers.
//!
//! A `HW_JTAG3` payload is `[cmd, 0, bits_lo, bits_hi, tms_bytes,
//! tdi_bytes]`; the response is the TDO bytes followed by one status
//! byte (0 = OK). Packets whose length is a multiple of 64 below
//! 0x8000 carry a spurious extra zero byte.

use std::time::Duration;

use failure::ResultExt;
use log::debug;
use rusb::{Context, DeviceHandle, UsbContext};

use crate::bits;
use crate::display::{print_info, print_warn};
use crate::{ProgError, Result};

const VID: u16 = 0x1366;
const PID: u16 = 0x0105;

const EMU_CMD_VERSION: u8 = 0x01;
const EMU_CMD_SET_SPEED: u8 = 0x05;
const EMU_CMD_SET_KS_POWER: u8 = 0x08;
const EMU_CMD_GET_SPEEDS: u8 = 0xC0;
const EMU_CMD_SELECT_IF: u8 = 0xC7;
const EMU_CMD_HW_JTAG3: u8 = 0xCF;
const EMU_CMD_GET_CAPS: u8 = 0xE8;
const EMU_CMD_GET_HW_VERSION: u8 = 0xF0;

const EMU_CAP_GET_HW_VERSION: u32 = 1 << 1;
const EMU_CAP_SPEED_INFO: u32 = 1 << 9;

// Internal TMS/TDI buffer capacity in bytes.
const BUF_SIZE: usize = 2048;

const USB_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Jlink {
    handle: DeviceHandle<Context>,
    interface: u8,
    read_ep: u8,
    write_ep: u8,
    caps: u32,
    base_freq: u32,
    min_div: u16,
    tms: Vec<u8>,
    tdi: Vec<u8>,
    num_bits: usize,
    last_tms: bool,
    last_tdi: bool,
}

impl Jlink {
    pub fn open(freq_hz: u32) -> Result<Self> {
        let context = Context::new().context("Error creating USB context")?;
        let handle = context.open_device_with_vid_pid(VID, PID).ok_or_else(|| {
            ProgError::TransportError("no J-Link probe found".into())
        })?;
        handle.set_auto_detach_kernel_driver(true).ok();

        // The JTAG function is the vendor-specific interface; find its
        // bulk endpoint pair.
        let device = handle.device();
        let config = device
            .active_config_descriptor()
            .context("Error reading configuration")?;
        let mut found = None;
        for iface in config.interfaces() {
            for desc in iface.descriptors() {
                if desc.class_code() == 0xFF && desc.sub_class_code() == 0xFF {
                    let mut read_ep = None;
                    let mut write_ep = None;
                    for ep in desc.endpoint_descriptors() {
                        if ep.direction() == rusb::Direction::In {
                            read_ep = Some(ep.address());
                        } else {
                            write_ep = Some(ep.address());
                        }
                    }
                    if let (Some(r), Some(w)) = (read_ep, write_ep) {
                        found = Some((desc.interface_number(), r, w));
                    }
                }
            }
        }
        let (interface, read_ep, write_ep) = found.ok_or_else(|| {
            ProgError::TransportError("no J-Link JTAG interface found".into())
        })?;
        handle
            .claim_interface(interface)
            .context("Error claiming J-Link interface")?;

        let mut probe = Self {
            handle,
            interface,
            read_ep,
            write_ep,
            caps: 0,
            base_freq: 0,
            min_div: 1,
            tms: vec![0; BUF_SIZE],
            tdi: vec![0; BUF_SIZE],
            num_bits: 0,
            last_tms: false,
            last_tdi: false,
        };

        probe.get_caps()?;
        probe.get_hw_version()?;
        probe.get_speeds()?;
        // Interface 0 selects JTAG.
        probe.select_interface(0)?;
        probe.set_clk_freq(freq_hz)?;
        probe.set_ks_power(true)?;

        Ok(probe)
    }

    fn write_device(&self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            let n = self
                .handle
                .write_bulk(self.write_ep, &data[sent..], USB_TIMEOUT)
                .context("J-Link bulk write failed")?;
            sent += n;
        }
        Ok(())
    }

    fn read_device(&self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        let mut tries = 3;
        while filled < buf.len() && tries > 0 {
            match self
                .handle
                .read_bulk(self.read_ep, &mut buf[filled..], USB_TIMEOUT)
            {
                Ok(n) => filled += n,
                Err(rusb::Error::Timeout) => tries -= 1,
                Err(e) => return Err(ProgError::USBError(e).into()),
            }
        }
        Ok(filled)
    }

    fn cmd_read(&self, cmd: u8, buf: &mut [u8]) -> Result<()> {
        self.write_device(&[cmd])?;
        let n = self.read_device(buf)?;
        if n != buf.len() {
            return Err(ProgError::ProtocolError(format!(
                "J-Link short answer to command 0x{:02x}: {} of {} bytes",
                cmd, n, buf.len()
            ))
            .into());
        }
        Ok(())
    }

    fn get_caps(&mut self) -> Result<()> {
        let mut raw = [0u8; 4];
        self.cmd_read(EMU_CMD_GET_CAPS, &mut raw)?;
        self.caps = u32::from_le_bytes(raw);
        Ok(())
    }

    fn get_hw_version(&mut self) -> Result<()> {
        if self.caps & EMU_CAP_GET_HW_VERSION == 0 {
            return Ok(());
        }
        let mut raw = [0u8; 4];
        self.cmd_read(EMU_CMD_GET_HW_VERSION, &mut raw)?;
        let version = u32::from_le_bytes(raw);
        print_info(&format!(
            "J-Link hw type {} v{}.{}.{}",
            (version / 1_000_000) % 100,
            (version / 10_000) % 100,
            (version / 100) % 100,
            version % 100
        ));
        Ok(())
    }

    fn get_speeds(&mut self) -> Result<()> {
        if self.caps & EMU_CAP_SPEED_INFO == 0 {
            self.base_freq = 12_000_000;
            self.min_div = 1;
            return Ok(());
        }
        let mut raw = [0u8; 6];
        self.cmd_read(EMU_CMD_GET_SPEEDS, &mut raw)?;
        self.base_freq = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        self.min_div = u16::from_le_bytes([raw[4], raw[5]]);
        debug!("jlink base freq {} min div {}", self.base_freq, self.min_div);
        Ok(())
    }

    fn select_interface(&self, interface: u8) -> Result<()> {
        self.write_device(&[EMU_CMD_SELECT_IF, interface])?;
        let mut prev = [0u8; 4];
        self.read_device(&mut prev)?;
        Ok(())
    }

    fn set_ks_power(&self, on: bool) -> Result<()> {
        self.write_device(&[EMU_CMD_SET_KS_POWER, if on { 1 } else { 0 }])
    }

    pub fn firmware_version(&self) -> Result<String> {
        let mut raw = [0u8; 2];
        self.cmd_read(EMU_CMD_VERSION, &mut raw)?;
        let len = u16::from_le_bytes(raw) as usize;
        let mut version = vec![0u8; len];
        self.read_device(&mut version)?;
        let end = version.iter().position(|&b| b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&version[..end]).into_owned())
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        let max_freq = self.base_freq / self.min_div as u32;
        let mut clk = freq_hz;
        if clk > max_freq {
            print_warn(&format!("J-Link probe limited to {}kHz", max_freq / 1000));
            clk = max_freq;
        }
        let khz = (clk / 1000) as u16;
        self.write_device(&[
            EMU_CMD_SET_SPEED,
            (khz & 0xFF) as u8,
            (khz >> 8) as u8,
        ])?;
        print_info(&format!(
            "Jtag frequency: requested {}Hz -> real {}Hz", freq_hz, khz as u32 * 1000
        ));
        Ok(khz as u32 * 1000)
    }

    /// Send the buffered TMS/TDI bits as one HW_JTAG3 command and read
    /// back TDO plus the status byte.
    fn ll_write(&mut self, tdo: Option<&mut [u8]>) -> Result<()> {
        if self.num_bits == 0 {
            return Ok(());
        }
        let numbytes = bits::bytes_for_bits(self.num_bits);

        let mut xfer = Vec::with_capacity(4 + 2 * numbytes);
        xfer.push(EMU_CMD_HW_JTAG3);
        xfer.push(0);
        xfer.push((self.num_bits & 0xFF) as u8);
        xfer.push((self.num_bits >> 8) as u8);
        xfer.extend_from_slice(&self.tms[..numbytes]);
        xfer.extend_from_slice(&self.tdi[..numbytes]);
        self.write_device(&xfer)?;

        // TDO bytes then one status byte; a 64-byte-multiple response
        // below 0x8000 is padded with a zero byte read separately.
        let mut rx = vec![0u8; numbytes + 1];
        let got = self.read_device(&mut rx)?;
        let status = if got == numbytes {
            let mut st = [0u8; 1];
            self.read_device(&mut st)?;
            st[0]
        } else {
            rx[numbytes]
        };

        if let Some(buf) = tdo {
            buf[..numbytes].copy_from_slice(&rx[..numbytes]);
        }
        self.num_bits = 0;

        if status != 0 {
            return Err(ProgError::ProtocolError(format!(
                "J-Link HW_JTAG3 returned status {}", status
            ))
            .into());
        }
        Ok(())
    }

    pub fn write_tms(&mut self, tms: &[u8], nbits: usize, flush: bool) -> Result<()> {
        if nbits == 0 {
            if flush {
                return self.flush();
            }
            return Ok(());
        }

        for pos in 0..nbits {
            if self.num_bits == BUF_SIZE * 8 {
                self.ll_write(None)?;
            }
            self.last_tms = bits::get_bit(tms, pos);
            bits::set_bit(&mut self.tms, self.num_bits, self.last_tms);
            bits::set_bit(&mut self.tdi, self.num_bits, self.last_tdi);
            self.num_bits += 1;
        }

        if flush || self.num_bits == BUF_SIZE * 8 {
            return self.flush();
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
        if nbits == 0 {
            return Ok(());
        }
        if self.num_bits != 0 {
            self.flush()?;
        }

        let tms_fill = if self.last_tms { 0xFF } else { 0x00 };
        let mut pos = 0;
        while pos < nbits {
            let xfer_bits = (nbits - pos).min(BUF_SIZE * 8);
            let nbytes = bits::bytes_for_bits(xfer_bits);
            for b in self.tms[..nbytes].iter_mut() {
                *b = tms_fill;
            }
            match tx {
                Some(data) => {
                    let start = pos / 8;
                    self.tdi[..nbytes].copy_from_slice(&data[start..start + nbytes]);
                }
                None => {
                    for b in self.tdi[..nbytes].iter_mut() {
                        *b = 0xFF;
                    }
                }
            }
            self.num_bits = xfer_bits;
            if end && pos + xfer_bits == nbits {
                self.last_tms = true;
                bits::set_bit(&mut self.tms, xfer_bits - 1, true);
            }
            match rx.as_deref_mut() {
                Some(buf) => {
                    let start = pos / 8;
                    self.ll_write(Some(&mut buf[start..start + nbytes]))?;
                }
                None => self.ll_write(None)?,
            }
            pos += xfer_bits;
        }

        if let Some(data) = tx {
            self.last_tdi = bits::get_bit(data, nbits - 1);
        } else {
            self.last_tdi = true;
        }
        Ok(())
    }

    pub fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        if cycles == 0 {
            return Ok(());
        }
        if self.num_bits != 0 {
            self.flush()?;
        }

        self.last_tms = tms;
        self.last_tdi = tdi;
        for b in self.tms.iter_mut() {
            *b = if tms { 0xFF } else { 0x00 };
        }
        for b in self.tdi.iter_mut() {
            *b = if tdi { 0xFF } else { 0x00 };
        }

        let mut rest = cycles as usize;
        while rest > 0 {
            self.num_bits = rest.min(BUF_SIZE * 8);
            rest -= self.num_bits;
            self.ll_write(None)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ll_write(None)
    }

    pub fn buffer_capacity(&self) -> usize {
        BUF_SIZE * 8
    }
}

impl Drop for Jlink {
    /// Restore the target power line and release the interface.
    fn drop(&mut self) {
        if self.num_bits != 0 {
            self.flush().ok();
        }
        self.set_ks_power(false).ok();
        self.handle.release_interface(self.interface).ok();
    }
}
