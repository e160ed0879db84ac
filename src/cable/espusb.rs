//! Espressif USB-JTAG bridge (builtin ESP32-Cx/Sx peripheral).
//!
//! Commands are nibbles, packed two per byte and executed high nibble
//! first: `CLK(cap, tms, tdi)`, `RST(srst)`, `FLUSH`, `REP(r1, r0)`.
//! Odd-length runs lead with a FLUSH nibble so data always ends on a
//! byte boundary.

use std::time::Duration;

use failure::ResultExt;
use log::debug;
use rusb::{Context, DeviceHandle, UsbContext};

use crate::bits;
use crate::cable::CableConfig;
use crate::display::{print_info, print_warn};
use crate::{ProgError, Result};

const WRITE_EP: u8 = 0x02;
const READ_EP: u8 = 0x83;

const USB_TIMEOUT: Duration = Duration::from_secs(1);

// One bulk packet worth of commands; two commands per byte.
const OUT_EP_SZ: usize = 64;

const CMD_FLUSH: u8 = 0x0A;

const VEND_JTAG_SETDIV: u8 = 0;

fn cmd_clk(cap: bool, tdi: bool, tms: bool) -> u8 {
    ((cap as u8) << 2) | ((tms as u8) << 1) | (tdi as u8)
}

pub struct EspUsbJtag {
    handle: DeviceHandle<Context>,
    interface: u8,
    base_speed_khz: u32,
    div_min: u16,
    div_max: u16,
    last_tms: bool,
    last_tdi: bool,
}

impl EspUsbJtag {
    pub fn open(config: &CableConfig, freq_hz: u32) -> Result<Self> {
        let context = Context::new().context("Error creating USB context")?;
        let handle = context
            .open_device_with_vid_pid(config.vid, config.pid)
            .ok_or_else(|| {
                ProgError::TransportError(format!(
                    "no esp_usb_jtag device {:04x}:{:04x} found",
                    config.vid, config.pid
                ))
            })?;
        handle.set_auto_detach_kernel_driver(true).ok();
        handle
            .claim_interface(config.interface)
            .context("Error claiming esp_usb_jtag interface")?;

        let mut probe = Self {
            handle,
            interface: config.interface,
            base_speed_khz: 1000,
            div_min: 1,
            div_max: 1,
            last_tms: false,
            last_tdi: false,
        };
        probe.read_caps()?;
        probe.set_clk_freq(freq_hz)?;
        Ok(probe)
    }

    /// Fetch the vendor JTAG capabilities descriptor (0x2000): base
    /// speed in 10 kHz units (half the APB clock) and divisor range.
    fn read_caps(&mut self) -> Result<()> {
        let mut desc = [0u8; 255];
        let n = self
            .handle
            .read_control(0x80, 0x06, 0x2000, 0, &mut desc, USB_TIMEOUT)
            .context("esp_usb_jtag: cannot read capabilities descriptor")?;
        if n < 2 || desc[0] != 1 {
            return Err(ProgError::ProtocolError(
                "esp_usb_jtag: unknown capabilities descriptor".into(),
            )
            .into());
        }
        let total = (desc[1] as usize).min(n);
        let mut p = 2;
        while p + 2 <= total {
            let typ = desc[p];
            let len = desc[p + 1] as usize;
            if typ == 1 && p + 8 <= total {
                let apb_10khz = u16::from_le_bytes([desc[p + 2], desc[p + 3]]) as u32;
                self.base_speed_khz = apb_10khz * 10 / 2;
                self.div_min = u16::from_le_bytes([desc[p + 4], desc[p + 5]]);
                self.div_max = u16::from_le_bytes([desc[p + 6], desc[p + 7]]);
            }
            if len == 0 {
                break;
            }
            p += len;
        }
        print_info(&format!(
            "esp_usb_jtag: base speed {}kHz, div {} to {}",
            self.base_speed_khz, self.div_min, self.div_max
        ));
        Ok(())
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        let base_hz = self.base_speed_khz * 1000;
        let mut clk = freq_hz;
        if clk > base_hz {
            print_warn(&format!("esp_usb_jtag probe limited to {}kHz", self.base_speed_khz));
            clk = base_hz;
        }
        let mut divisor = (base_hz / clk) as u16;
        divisor = divisor.max(self.div_min).min(self.div_max.max(self.div_min));
        let real = base_hz / divisor as u32;

        self.handle
            .write_control(0x40, VEND_JTAG_SETDIV, divisor, self.interface as u16,
                &[], USB_TIMEOUT)
            .context("esp_usb_jtag: set divisor failed")?;

        print_info(&format!(
            "Jtag frequency: requested {}Hz -> real {}Hz", freq_hz, real
        ));
        Ok(real)
    }

    fn xfer_out(&self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            let n = self
                .handle
                .write_bulk(WRITE_EP, &data[sent..], USB_TIMEOUT)
                .context("esp_usb_jtag bulk write failed")?;
            sent += n;
        }
        Ok(())
    }

    fn xfer_in(&self, buf: &mut [u8]) -> Result<usize> {
        match self.handle.read_bulk(READ_EP, buf, USB_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(ProgError::USBError(e).into()),
        }
    }

    /// Pack a run of CLK commands into bytes. For odd counts the first
    /// high nibble is a FLUSH no-op so the run ends byte-aligned.
    fn pack_run<F: FnMut(usize) -> u8>(len: usize, mut cmd_at: F) -> Vec<u8> {
        let mut buf = Vec::with_capacity((len + 1) / 2);
        let mut high = len % 2 == 0;
        let mut byte = if len % 2 == 1 { CMD_FLUSH << 4 } else { 0 };
        for i in 0..len {
            let cmd = cmd_at(i);
            if high {
                byte = cmd << 4;
            } else {
                buf.push(byte | cmd);
            }
            high = !high;
        }
        buf
    }

    pub fn write_tms(&mut self, tms: &[u8], nbits: usize, flush: bool) -> Result<()> {
        if flush {
            self.flush()?;
        }
        if nbits == 0 {
            return Ok(());
        }

        let tdi = self.last_tdi;
        let mut last_tms = self.last_tms;
        let mut pos = 0;
        while pos < nbits {
            let run = (nbits - pos).min(OUT_EP_SZ * 2);
            let buf = Self::pack_run(run, |i| {
                last_tms = bits::get_bit(tms, pos + i);
                cmd_clk(false, tdi, last_tms)
            });
            self.xfer_out(&buf)?;
            pos += run;
        }
        self.last_tms = last_tms;
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
        let capture = rx.is_some();

        if let Some(buf) = rx.as_deref_mut() {
            for b in buf.iter_mut() {
                *b = 0;
            }
        }

        let mut pos = 0;
        while pos < nbits {
            let run = (nbits - pos).min(OUT_EP_SZ * 2);
            let tms_state = &mut self.last_tms;
            let tdi_state = &mut self.last_tdi;
            let buf = Self::pack_run(run, |i| {
                let idx = pos + i;
                *tdi_state = match tx {
                    Some(data) => bits::get_bit(data, idx),
                    None => true,
                };
                if end && idx == nbits - 1 {
                    *tms_state = true;
                }
                cmd_clk(capture, *tdi_state, *tms_state)
            });
            self.xfer_out(&buf)?;

            if let Some(out) = rx.as_deref_mut() {
                self.flush()?;
                // Captured bits come back LSB-first, one bit per clock.
                let nbytes = bits::bytes_for_bits(run);
                let mut raw = vec![0u8; nbytes];
                let mut got = 0;
                let mut tries = 3;
                while got < nbytes && tries > 0 {
                    let n = self.xfer_in(&mut raw[got..])?;
                    if n == 0 {
                        tries -= 1;
                    }
                    got += n;
                }
                if got != nbytes {
                    return Err(ProgError::ProtocolError(format!(
                        "esp_usb_jtag: expected {} TDO bytes, got {}", nbytes, got
                    ))
                    .into());
                }
                for i in 0..run {
                    bits::set_bit(out, pos + i, bits::get_bit(&raw, i));
                }
            }
            pos += run;
        }
        Ok(())
    }

    pub fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        if cycles == 0 {
            return Ok(());
        }
        self.last_tms = tms;
        self.last_tdi = tdi;
        let cmd = cmd_clk(false, tdi, tms);
        let mut rest = cycles as usize;
        while rest > 0 {
            let run = rest.min(OUT_EP_SZ * 2);
            let buf = Self::pack_run(run, |_| cmd);
            self.xfer_out(&buf)?;
            rest -= run;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.xfer_out(&[(CMD_FLUSH << 4) | CMD_FLUSH])
    }

    pub fn buffer_capacity(&self) -> usize {
        OUT_EP_SZ * 2
    }
}

impl Drop for EspUsbJtag {
    fn drop(&mut self) {
        // Drain any TDO bits still queued on the IN endpoint.
        let mut junk = [0u8; 64];
        while let Ok(n) = self.xfer_in(&mut junk) {
            if n == 0 {
                break;
            }
        }
        debug!("esp_usb_jtag closed");
    }
}
