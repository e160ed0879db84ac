//! Xilinx Virtual Cable client (TCP).
//!
//! Text commands `getinfo:`, `settck:<u32 ns LE>` and
//! `shift:<u32 bits LE><tms bytes><tdi bytes>`; the shift reply is the
//! TDO bytes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use failure::ResultExt;
use log::debug;

use crate::bits;
use crate::display::print_info;
use crate::{ProgError, Result};

pub struct XvcClient {
    stream: TcpStream,
    server_name: String,
    server_version: String,
    /// TMS+TDI capacity reported by the server, halved per vector.
    buffer_size: usize,
    tms: Vec<u8>,
    tdi: Vec<u8>,
    num_bits: usize,
    last_tms: bool,
    last_tdi: bool,
}

impl XvcClient {
    pub fn open(addr: &str, freq_hz: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .context("Error connecting to XVC server")?;
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .context("Error configuring socket")?;

        let mut client = Self {
            stream,
            server_name: String::new(),
            server_version: String::new(),
            buffer_size: 0,
            tms: Vec::new(),
            tdi: Vec::new(),
            num_bits: 0,
            last_tms: false,
            last_tdi: false,
        };

        client.get_info()?;
        client.set_clk_freq(freq_hz)?;
        Ok(client)
    }

    /// `getinfo:` answers `xvcServer_v1.0:<size>\n`.
    fn get_info(&mut self) -> Result<()> {
        self.stream
            .write_all(b"getinfo:")
            .context("XVC send failed")?;
        let mut raw = [0u8; 256];
        let n = self.stream.read(&mut raw).context("XVC receive failed")?;
        let answer = String::from_utf8_lossy(&raw[..n]);
        let answer = answer.trim_end_matches(['\n', '\0']);
        let mut fields = answer.split(|c| c == '_' || c == ':');
        let (name, version, size) = match (fields.next(), fields.next(), fields.next()) {
            (Some(n), Some(v), Some(s)) => (n, v, s),
            _ => {
                return Err(ProgError::ProtocolError(format!(
                    "unexpected getinfo answer: {}", answer
                ))
                .into())
            }
        };
        self.server_name = name.to_string();
        self.server_version = version.to_string();
        // The reported size covers the TMS and TDI vectors together.
        self.buffer_size = size
            .trim()
            .parse::<usize>()
            .map_err(|_| {
                ProgError::ProtocolError(format!("bad vector size: {}", size))
            })? / 2;
        self.tms = vec![0; self.buffer_size];
        self.tdi = vec![0; self.buffer_size];

        print_info(&format!(
            "detected {} version {} packet size {}",
            self.server_name, self.server_version, self.buffer_size
        ));
        Ok(())
    }

    pub fn set_clk_freq(&mut self, freq_hz: u32) -> Result<u32> {
        let period_ns = (1_000_000_000u64 / freq_hz as u64) as u32;
        let mut pkt = b"settck:".to_vec();
        pkt.extend_from_slice(&period_ns.to_le_bytes());
        self.stream.write_all(&pkt).context("XVC send failed")?;
        let mut answer = [0u8; 4];
        self.stream
            .read_exact(&mut answer)
            .context("XVC receive failed")?;
        let real_ns = u32::from_le_bytes(answer).max(1);
        let real_hz = (1_000_000_000u64 / real_ns as u64) as u32;
        print_info(&format!(
            "Jtag frequency: requested {}Hz -> real {}Hz", freq_hz, real_hz
        ));
        Ok(real_hz)
    }

    /// Send the buffered vectors as one `shift:` transaction.
    fn ll_write(&mut self, tdo: Option<&mut [u8]>) -> Result<()> {
        if self.num_bits == 0 {
            return Ok(());
        }
        let numbytes = bits::bytes_for_bits(self.num_bits);
        debug!("xvc shift {} bits", self.num_bits);

        let mut pkt = b"shift:".to_vec();
        pkt.extend_from_slice(&(self.num_bits as u32).to_le_bytes());
        pkt.extend_from_slice(&self.tms[..numbytes]);
        pkt.extend_from_slice(&self.tdi[..numbytes]);
        self.stream.write_all(&pkt).context("XVC send failed")?;

        let mut answer = vec![0u8; numbytes];
        self.stream
            .read_exact(&mut answer)
            .context("XVC receive failed")?;
        if let Some(buf) = tdo {
            buf[..numbytes].copy_from_slice(&answer);
        }
        self.num_bits = 0;
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
            if self.num_bits == self.buffer_size * 8 {
                self.ll_write(None)?;
            }
            self.last_tms = bits::get_bit(tms, pos);
            bits::set_bit(&mut self.tms, self.num_bits, self.last_tms);
            bits::set_bit(&mut self.tdi, self.num_bits, self.last_tdi);
            self.num_bits += 1;
        }

        if flush || self.num_bits == self.buffer_size * 8 {
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
            let xfer_bits = (nbits - pos).min(self.buffer_size * 8);
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
            self.num_bits = rest.min(self.buffer_size * 8);
            rest -= self.num_bits;
            self.ll_write(None)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ll_write(None)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_size * 8
    }
}
