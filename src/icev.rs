//! ICE-V Wireless board support.
//!
//! Not a JTAG cable: the on-board ESP32-C3 accepts whole bitstreams
//! over its USB serial port, either straight into the iCE40 (RAM) or
//! into its SPIFFS filesystem for load-on-boot. Packets carry a magic
//! prefix `[0xE0 + cmd, 0xBE, 0xFE, 0xCA]`, a little-endian length,
//! then the payload; replies are text lines containing
//! `RX <err> <data...>`.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use failure::ResultExt;
use log::debug;

use crate::display::{print_info, print_success};
use crate::parser;
use crate::{ProgError, Result};

// Command nibbles. The protocol is only partially documented
// upstream; these cover the operations the board firmware serves.
const CMD_PRG_RAM: u8 = 0x0;
const CMD_PRG_SPIFFS: u8 = 0x1;
const CMD_READ_REG: u8 = 0x2;
const CMD_WRITE_REG: u8 = 0x3;
const CMD_READ_VBAT: u8 = 0x4;
const CMD_READ_INFO: u8 = 0x5;
const CMD_SEND_CRED: u8 = 0x6;
const CMD_LOAD_CFG: u8 = 0x8;

const MAGIC: [u8; 3] = [0xBE, 0xFE, 0xCA];

pub struct IceVWireless {
    port: BufReader<Box<dyn serialport::SerialPort>>,
}

impl IceVWireless {
    pub fn open(dev: &str) -> Result<Self> {
        let port = serialport::new(dev, 9600)
            .timeout(Duration::from_millis(500))
            .open()
            .context("Error opening ICE-V serial port")?;
        let mut board = Self { port: BufReader::new(port) };
        board.read_vbat()?;
        board.read_info()?;
        Ok(board)
    }

    fn write_cmd(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        let mut pkt = Vec::with_capacity(8 + payload.len());
        pkt.push(0xE0 + (cmd & 0x0F));
        pkt.extend_from_slice(&MAGIC);
        pkt.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        pkt.extend_from_slice(payload);
        self.port
            .get_mut()
            .write_all(&pkt)
            .context("ICE-V write failed")?;
        Ok(())
    }

    /// Read one reply line and split out the fields after `RX <err>`.
    fn read_tokens(&mut self) -> Result<Vec<String>> {
        let mut line = String::new();
        self.port
            .read_line(&mut line)
            .context("ICE-V read failed")?;
        debug!("icev < {}", line.trim_end());

        let words: Vec<&str> = line.split_whitespace().collect();
        let rx_pos = words
            .iter()
            .position(|&w| w == "RX")
            .ok_or_else(|| ProgError::ProtocolError("ICE-V: no RX marker".into()))?;
        let err = words
            .get(rx_pos + 1)
            .and_then(|w| u16::from_str_radix(w, 16).ok())
            .ok_or_else(|| ProgError::ProtocolError("ICE-V: bad error code".into()))?;
        if err != 0 {
            return Err(ProgError::ProtocolError(format!(
                "ICE-V error code 0x{:x}", err
            ))
            .into());
        }
        Ok(words[rx_pos + 2..].iter().map(|w| w.to_string()).collect())
    }

    fn wr_rd(&mut self, cmd: u8, reg: u32, regsize: u32) -> Result<Vec<String>> {
        let mut payload = reg.to_le_bytes().to_vec();
        payload.truncate(regsize as usize);
        self.write_cmd(cmd, &payload)?;
        self.read_tokens()
    }

    pub fn read_vbat(&mut self) -> Result<u32> {
        let tokens = self.wr_rd(CMD_READ_VBAT, 0, 4)?;
        let mv = tokens
            .first()
            .and_then(|t| u32::from_str_radix(t, 16).ok())
            .ok_or_else(|| ProgError::ProtocolError("ICE-V: bad vbat answer".into()))?;
        print_info(&format!("Vbat = {} mV", mv));
        Ok(mv)
    }

    pub fn read_info(&mut self) -> Result<()> {
        let tokens = self.wr_rd(CMD_READ_INFO, 0, 4)?;
        if tokens.len() >= 2 {
            print_info(&format!("info: version {} ipaddr {}", tokens[0], tokens[1]));
        }
        Ok(())
    }

    pub fn read_reg(&mut self, reg: u32) -> Result<u32> {
        let tokens = self.wr_rd(CMD_READ_REG, reg, 4)?;
        tokens
            .first()
            .and_then(|t| u32::from_str_radix(t, 16).ok())
            .ok_or_else(|| {
                ProgError::ProtocolError("ICE-V: bad register answer".into()).into()
            })
    }

    pub fn write_reg(&mut self, reg: u32, data: u32) -> Result<()> {
        let mut payload = reg.to_le_bytes().to_vec();
        payload.extend_from_slice(&data.to_le_bytes());
        self.write_cmd(CMD_WRITE_REG, &payload)?;
        self.read_tokens()?;
        Ok(())
    }

    /// Send a bitstream for a direct FPGA load (`ram == true`) or a
    /// SPIFFS write for load-on-boot.
    pub fn send_file(&mut self, ram: bool, path: &str) -> Result<()> {
        print_info(&format!("Open file {}", path));
        let raw = parser::read_file(path)?;
        let image = parser::raw::parse(&raw, false)?;

        let cmd = if ram { CMD_PRG_RAM } else { CMD_PRG_SPIFFS };
        self.write_cmd(cmd, &image.data)?;
        self.read_tokens()?;
        print_success("DONE");
        Ok(())
    }

    /// Store WiFi credentials (0 = SSID, 1 = password).
    pub fn send_cred(&mut self, cred_type: u8, value: &str) -> Result<()> {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        self.write_cmd(CMD_SEND_CRED + (cred_type & 0x01), &payload)?;
        self.read_tokens()?;
        Ok(())
    }

    /// Load a configuration stored in SPIFFS (0 default, 1 SPI pass).
    pub fn load_cfg(&mut self, cfg: u32) -> Result<()> {
        self.wr_rd(CMD_LOAD_CFG, cfg, 4)?;
        Ok(())
    }
}
