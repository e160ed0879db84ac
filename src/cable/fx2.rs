//! Cypress FX2 running the FPGALink "NeroProg" firmware.
//!
//! A blank FX2 enumerates as 04b4:8613; the firmware image shipped on
//! disk is loaded into its RAM through the standard `0xA0` vendor
//! request, after which the device renumerates as 1d50:602b and
//! accepts JTAG vendor requests: state-machine transitions and clock
//! runs on EP0, shift data over the bulk endpoints.

use std::thread::sleep;
use std::time::Duration;

use failure::ResultExt;
use log::debug;
use rusb::{Context, DeviceHandle, UsbContext};

use crate::bits;
use crate::cable::CableConfig;
use crate::display::{print_info, print_warn};
use crate::{ProgError, Result};

const FW_VID: u16 = 0x1D50;
const FW_PID: u16 = 0x602B;

/// Default location of the shipped firmware image.
const FIRMWARE_PATH: &str = "/usr/local/share/jtagprog/fx2_jtag.hex";

// FX2 CPU control register; write 1 to hold the 8051 in reset.
const FX2_CPUCS: u16 = 0xE600;
const REQ_FIRMWARE_LOAD: u8 = 0xA0;

// NeroProg vendor requests.
const CMD_JTAG_CLOCK_DATA: u8 = 0x81;
const CMD_JTAG_CLOCK_FSM: u8 = 0x82;
const CMD_JTAG_CLOCK: u8 = 0x83;

const OUT_EP: u8 = 0x02;
const IN_EP: u8 = 0x86;

const USB_TIMEOUT: Duration = Duration::from_secs(1);

// Shift flags.
const FLAG_IS_RESPONSE_NEEDED: u16 = 0x01;
const FLAG_LAST_BIT_TMS: u16 = 0x02;

pub struct Fx2Cable {
    handle: DeviceHandle<Context>,
}

impl Fx2Cable {
    pub fn open(config: &CableConfig) -> Result<Self> {
        let context = Context::new().context("Error creating USB context")?;

        // Prefer an already-renumerated device.
        let handle = match context.open_device_with_vid_pid(FW_VID, FW_PID) {
            Some(handle) => handle,
            None => {
                let blank = context
                    .open_device_with_vid_pid(config.vid, config.pid)
                    .ok_or_else(|| {
                        ProgError::TransportError(format!(
                            "no FX2 device {:04x}:{:04x} or {:04x}:{:04x} found",
                            config.vid, config.pid, FW_VID, FW_PID
                        ))
                    })?;
                print_info(&format!(
                    "Loading firmware into {:04x}:{:04x}", config.vid, config.pid
                ));
                Self::load_firmware(&blank, FIRMWARE_PATH)?;
                drop(blank);

                // Await renumeration.
                let mut count = 60;
                loop {
                    sleep(Duration::from_millis(250));
                    if let Some(handle) = context.open_device_with_vid_pid(FW_VID, FW_PID) {
                        break handle;
                    }
                    count -= 1;
                    if count == 0 {
                        return Err(ProgError::TransportError(
                            "FX2 did not renumerate after firmware load".into(),
                        )
                        .into());
                    }
                }
            }
        };
        handle.set_auto_detach_kernel_driver(true).ok();
        handle
            .claim_interface(0)
            .context("Error claiming FX2 interface")?;
        Ok(Self { handle })
    }

    /// Push an Intel-HEX firmware image into FX2 RAM with the CPU held
    /// in reset.
    fn load_firmware(handle: &DeviceHandle<Context>, path: &str) -> Result<()> {
        let image = std::fs::read(path)
            .with_context(|_| format!("Error reading FX2 firmware {}", path))?;

        let cpu_reset = |hold: u8| {
            handle.write_control(
                0x40, REQ_FIRMWARE_LOAD, FX2_CPUCS, 0, &[hold], USB_TIMEOUT,
            )
        };
        cpu_reset(1).context("Error holding FX2 CPU in reset")?;

        for line in image.split(|&b| b == b'\n') {
            let line = match line.strip_prefix(b":") {
                Some(l) => l,
                None => continue,
            };
            let line: Vec<u8> = line
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            if line.len() < 10 {
                continue;
            }
            let field = |pos: usize, n: usize| -> Result<u32> {
                let s = std::str::from_utf8(&line[pos..pos + n]).map_err(|_| {
                    ProgError::ParseError("bad FX2 firmware hex".into())
                })?;
                u32::from_str_radix(s, 16)
                    .map_err(|_| ProgError::ParseError("bad FX2 firmware hex".into()).into())
            };
            let count = field(0, 2)? as usize;
            let addr = field(2, 4)? as u16;
            let rtype = field(6, 2)?;
            if rtype == 1 {
                break;
            }
            if rtype != 0 {
                continue;
            }
            let mut data = Vec::with_capacity(count);
            for i in 0..count {
                data.push(field(8 + 2 * i, 2)? as u8);
            }
            handle
                .write_control(0x40, REQ_FIRMWARE_LOAD, addr, 0, &data, USB_TIMEOUT)
                .context("Error writing FX2 firmware block")?;
        }

        cpu_reset(0).context("Error releasing FX2 CPU reset")?;
        Ok(())
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        // The firmware clocks TCK at a fixed rate.
        print_warn("FX2: clock speed is fixed by the firmware");
        Ok(freq_hz)
    }

    /// Clock up to 32 TMS transitions from a bit pattern.
    fn clock_fsm(&self, pattern: u32, nbits: u8) -> Result<()> {
        let le = pattern.to_le_bytes();
        self.handle
            .write_control(
                0x40,
                CMD_JTAG_CLOCK_FSM,
                u16::from_le_bytes([le[0], le[1]]),
                u16::from_le_bytes([le[2], le[3]]),
                &[nbits],
                USB_TIMEOUT,
            )
            .context("FX2 clock-FSM request failed")?;
        Ok(())
    }

    pub fn write_tms(&mut self, tms: &[u8], nbits: usize, _flush: bool) -> Result<()> {
        let mut rest = nbits;
        let mut idx = 0;
        while rest > 0 {
            let chunk = rest.min(32);
            let mut pattern = 0u32;
            for i in 0..chunk {
                if bits::get_bit(tms, idx + i) {
                    pattern |= 1 << i;
                }
            }
            self.clock_fsm(pattern, chunk as u8)?;
            idx += chunk;
            rest -= chunk;
        }
        Ok(())
    }

    pub fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        nbits: usize,
        end: bool,
    ) -> Result<()> {
        if nbits == 0 {
            return Ok(());
        }
        let nbytes = bits::bytes_for_bits(nbits);
        let mut flags = 0u16;
        if rx.is_some() {
            flags |= FLAG_IS_RESPONSE_NEEDED;
        }
        if end {
            flags |= FLAG_LAST_BIT_TMS;
        }

        let len = (nbits as u32).to_le_bytes();
        self.handle
            .write_control(
                0x40,
                CMD_JTAG_CLOCK_DATA,
                u16::from_le_bytes([len[0], len[1]]),
                u16::from_le_bytes([len[2], len[3]]),
                &flags.to_le_bytes(),
                USB_TIMEOUT,
            )
            .context("FX2 shift request failed")?;

        let ones;
        let data = match tx {
            Some(data) => &data[..nbytes],
            None => {
                ones = vec![0xFFu8; nbytes];
                &ones[..]
            }
        };
        let mut sent = 0;
        while sent < data.len() {
            let n = self
                .handle
                .write_bulk(OUT_EP, &data[sent..], USB_TIMEOUT)
                .context("FX2 bulk write failed")?;
            sent += n;
        }

        if let Some(buf) = rx {
            let mut filled = 0;
            while filled < nbytes {
                let n = self
                    .handle
                    .read_bulk(IN_EP, &mut buf[filled..nbytes], USB_TIMEOUT)
                    .context("FX2 bulk read failed")?;
                if n == 0 {
                    return Err(ProgError::TransportError(
                        "FX2 short TDO read".into(),
                    )
                    .into());
                }
                filled += n;
            }
        }
        debug!("fx2 shifted {} bits", nbits);
        Ok(())
    }

    pub fn toggle_clk(&mut self, _tms: bool, _tdi: bool, cycles: u32) -> Result<()> {
        let le = cycles.to_le_bytes();
        self.handle
            .write_control(
                0x40,
                CMD_JTAG_CLOCK,
                u16::from_le_bytes([le[0], le[1]]),
                u16::from_le_bytes([le[2], le[3]]),
                &[],
                USB_TIMEOUT,
            )
            .context("FX2 clock request failed")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn buffer_capacity(&self) -> usize {
        // One 512-byte bulk packet.
        512 * 8
    }
}
