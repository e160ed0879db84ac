//! OpenOCD remote-bitbang client (TCP).
//!
//! Single ASCII characters: `0`..`7` encode (TCK, TMS, TDI) levels,
//! `R` samples TDO (answer `0` or `1`), `B`/`b` drive the status LED
//! and `Q` closes the server side. There is no bulk mode; the same bit
//! sequence is produced one clock edge at a time.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use failure::ResultExt;

use crate::bits;
use crate::display::print_warn;
use crate::{ProgError, Result};

const TCK_BIT: u8 = 1 << 2;

const BUFFER_SIZE: usize = 2048;

pub struct RemoteBitbang {
    stream: TcpStream,
    buf: Vec<u8>,
    last_tms: bool,
    last_tdi: bool,
}

impl RemoteBitbang {
    pub fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .context("Error connecting to remote_bitbang server")?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .context("Error configuring socket")?;

        let mut probe = Self {
            stream,
            buf: Vec::with_capacity(BUFFER_SIZE),
            last_tms: true,
            last_tdi: false,
        };
        // LED on while the probe is in use.
        probe.stream.write_all(b"b").context("remote_bitbang write failed")?;
        Ok(probe)
    }

    fn push_clock(&mut self, tms: bool, tdi: bool) -> Result<()> {
        if self.buf.len() + 2 > BUFFER_SIZE {
            self.ll_write()?;
        }
        let val = ((tms as u8) << 1) | (tdi as u8);
        self.buf.push(b'0' + val);
        self.buf.push(b'0' + val + TCK_BIT);
        self.last_tms = tms;
        self.last_tdi = tdi;
        Ok(())
    }

    fn ll_write(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.stream
            .write_all(&self.buf)
            .context("remote_bitbang write failed")?;
        self.buf.clear();
        Ok(())
    }

    /// Request one TDO sample; the server answers a single ASCII digit.
    fn read_tdo(&mut self) -> Result<bool> {
        self.ll_write()?;
        self.stream
            .write_all(b"R")
            .context("remote_bitbang write failed")?;
        let mut answer = [0u8; 1];
        self.stream
            .read_exact(&mut answer)
            .context("remote_bitbang read failed")?;
        match answer[0] {
            b'0' => Ok(false),
            b'1' => Ok(true),
            other => Err(ProgError::ProtocolError(format!(
                "remote_bitbang: unexpected TDO answer 0x{:02x}", other
            ))
            .into()),
        }
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        print_warn("remote_bitbang: clock speed is not configurable");
        Ok(freq_hz)
    }

    pub fn write_tms(&mut self, tms: &[u8], nbits: usize, flush: bool) -> Result<()> {
        if nbits == 0 {
            if flush {
                return self.flush();
            }
            return Ok(());
        }
        let tdi = self.last_tdi;
        for pos in 0..nbits {
            self.push_clock(bits::get_bit(tms, pos), tdi)?;
        }
        if flush {
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
        for pos in 0..nbits {
            let tdi = match tx {
                Some(data) => bits::get_bit(data, pos),
                None => true,
            };
            let tms = if end && pos == nbits - 1 { true } else { self.last_tms };
            self.push_clock(tms, tdi)?;
            if let Some(buf) = rx.as_deref_mut() {
                let tdo = self.read_tdo()?;
                bits::set_bit(buf, pos, tdo);
            }
        }
        Ok(())
    }

    pub fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        for _ in 0..cycles {
            self.push_clock(tms, tdi)?;
        }
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ll_write()
    }

    pub fn buffer_capacity(&self) -> usize {
        // Two characters per clock.
        BUFFER_SIZE / 2
    }
}

impl Drop for RemoteBitbang {
    fn drop(&mut self) {
        self.ll_write().ok();
        // LED off, then ask the server to close.
        self.stream.write_all(b"B").ok();
        self.stream.write_all(b"Q").ok();
    }
}
