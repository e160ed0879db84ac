//! Xilinx `.bit` parser.
//!
//! Big-endian TLV container: a skipped header field, then one-byte
//! keys `a`..`e`. Keys `a`..`d` carry a u16 length prefix; `e` carries
//! the 4-byte payload length, after which the rest of the file is the
//! configuration stream. The FPGA wants it MSB-first while the wire is
//! LSB-first, so every payload byte is bit-reversed.

use crate::bits::reverse_byte;
use crate::parser::{parse_err, Bitstream};
use crate::Result;

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .raw
            .get(self.pos)
            .ok_or_else(|| parse_err("bit file truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16_be(&mut self) -> Result<u16> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }

    fn u32_be(&mut self) -> Result<u32> {
        Ok(((self.u16_be()? as u32) << 16) | self.u16_be()? as u32)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.raw.len() {
            return Err(parse_err("bit file truncated"));
        }
        let slice = &self.raw[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn field_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

pub fn parse(raw: &[u8]) -> Result<Bitstream> {
    let mut rd = Reader { raw, pos: 0 };

    // Field 1: opaque header, skipped. A second u16 field follows it.
    let hdr_len = rd.u16_be()? as usize;
    rd.bytes(hdr_len)?;
    rd.u16_be()?;

    let mut header = Vec::new();
    let file_length;
    loop {
        let key = rd.u8()?;
        match key {
            b'a' => {
                let len = rd.u16_be()? as usize;
                let field = field_string(rd.bytes(len)?);
                // design name ; user id ; tool version
                let mut parts = field.split(';');
                if let Some(name) = parts.next() {
                    header.push(("design_name".into(), name.to_string()));
                }
                if let Some(userid) = parts.next() {
                    header.push(("userID".into(), userid.to_string()));
                }
                if let Some(tool) = parts.next() {
                    header.push(("toolVersion".into(), tool.to_string()));
                }
            }
            b'b' => {
                let len = rd.u16_be()? as usize;
                header.push(("part_name".into(), field_string(rd.bytes(len)?)));
            }
            b'c' => {
                let len = rd.u16_be()? as usize;
                header.push(("date".into(), field_string(rd.bytes(len)?)));
            }
            b'd' => {
                let len = rd.u16_be()? as usize;
                header.push(("hour".into(), field_string(rd.bytes(len)?)));
            }
            b'e' => {
                file_length = rd.u32_be()? as usize;
                break;
            }
            other => {
                return Err(parse_err(&format!(
                    "bit file: unknown field key 0x{:02x}", other
                )))
            }
        }
    }

    let payload = rd.bytes(file_length)?;
    let data: Vec<u8> = payload.iter().map(|&b| reverse_byte(b)).collect();

    let mut bitstream = Bitstream::new(data);
    bitstream.header = header;
    Ok(bitstream)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Build a minimal `.bit` container around `payload`.
    pub fn build_bit_file(payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        // Field 1: 9 magic bytes, then the constant 0x0001 field.
        raw.extend_from_slice(&[0x00, 0x09]);
        raw.extend_from_slice(&[0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x00]);
        raw.extend_from_slice(&[0x00, 0x01]);
        for (key, val) in &[
            (b'a', &b"top;UserID=0XFFFFFFFF;Vivado 2021.2"[..]),
            (b'b', &b"7a35tcsg324"[..]),
            (b'c', &b"2026/07/14"[..]),
            (b'd', &b"12:00:00"[..]),
        ] {
            raw.push(*key);
            raw.extend_from_slice(&(val.len() as u16).to_be_bytes());
            raw.extend_from_slice(val);
        }
        raw.push(b'e');
        raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn payload_is_bit_reversed() {
        let raw = build_bit_file(&[0x0F; 256]);
        let bs = parse(&raw).unwrap();
        assert_eq!(bs.data.len(), 256);
        assert_eq!(bs.bit_length, 2048);
        assert!(bs.data.iter().all(|&b| b == 0xF0));
    }

    #[test]
    fn header_fields_decoded() {
        let raw = build_bit_file(&[0xA5; 16]);
        let bs = parse(&raw).unwrap();
        let get = |k: &str| {
            bs.header
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("design_name"), Some("top"));
        assert_eq!(get("part_name"), Some("7a35tcsg324"));
        assert_eq!(get("date"), Some("2026/07/14"));
        assert_eq!(get("hour"), Some("12:00:00"));
    }

    #[test]
    fn reparse_is_stable() {
        let raw = build_bit_file(&[0x0F, 0xA5, 0x00, 0xFF]);
        let first = parse(&raw).unwrap();
        let second = parse(&raw).unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(first.bit_length, second.bit_length);
    }

    #[test]
    fn truncated_file_rejected() {
        let mut raw = build_bit_file(&[0xA5; 64]);
        raw.truncate(raw.len() - 8);
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn unknown_key_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[0x00, 0x01, 0xAA, 0x00, 0x01]);
        raw.push(b'z');
        raw.extend_from_slice(&[0x00, 0x00]);
        assert!(parse(&raw).is_err());
    }
}
