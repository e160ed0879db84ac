//! Xilinx `.mcs` parser: Intel-HEX with the 32-bit extended linear
//! address record.

use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

use crate::parser::{parse_err, Bitstream};
use crate::Result;

#[derive(Copy, Clone, Debug, TryFromPrimitive)]
#[repr(u8)]
enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedLinearAddress = 0x04,
}

fn hex_field(line: &[u8], pos: usize, n: usize) -> Result<u32> {
    let chunk = line
        .get(pos..pos + n)
        .ok_or_else(|| parse_err("mcs: truncated record"))?;
    let s = std::str::from_utf8(chunk).map_err(|_| parse_err("mcs: bad hex digit"))?;
    u32::from_str_radix(s, 16).map_err(|_| parse_err("mcs: bad hex digit").into())
}

pub fn parse(raw: &[u8]) -> Result<Bitstream> {
    let mut data = Vec::new();
    let mut base_addr = 0u32;
    let mut next_addr = 0u32;
    let mut started = false;
    let mut ended = false;

    for line in raw.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            continue;
        }
        if ended {
            return Err(parse_err("mcs: record after end-of-file"));
        }
        if line[0] != b':' {
            return Err(parse_err("mcs: record does not start with ':'"));
        }
        let line = &line[1..];

        let count = hex_field(line, 0, 2)? as usize;
        let offset = hex_field(line, 2, 4)?;
        let rtype = RecordType::try_from(hex_field(line, 6, 2)? as u8)
            .map_err(|e| parse_err(&format!(
                "mcs: unsupported record type {:02x}", e.number
            )))?;
        if line.len() != 8 + 2 * count + 2 {
            return Err(parse_err("mcs: record length mismatch"));
        }

        // Running checksum: all bytes including the trailing one must
        // sum to zero.
        let mut sum = 0u8;
        for i in (0..line.len()).step_by(2) {
            sum = sum.wrapping_add(hex_field(line, i, 2)? as u8);
        }
        if sum != 0 {
            return Err(parse_err("mcs: record checksum mismatch"));
        }

        match rtype {
            RecordType::Data => {
                let addr = base_addr + offset;
                if !started {
                    started = true;
                    next_addr = addr;
                } else if addr != next_addr {
                    return Err(parse_err("mcs: non-contiguous data record"));
                }
                for i in 0..count {
                    data.push(hex_field(line, 8 + 2 * i, 2)? as u8);
                }
                next_addr = addr + count as u32;
            }
            RecordType::EndOfFile => {
                ended = true;
            }
            RecordType::ExtendedLinearAddress => {
                if count != 2 {
                    return Err(parse_err("mcs: bad extended address record"));
                }
                base_addr = hex_field(line, 8, 4)? << 16;
            }
        }
    }

    if !ended {
        return Err(parse_err("mcs: end-of-file record missing"));
    }
    Ok(Bitstream::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u16, rtype: u8, payload: &[u8]) -> String {
        let mut line = format!(":{:02X}{:04X}{:02X}", payload.len(), offset, rtype);
        let mut sum = payload.len() as u8;
        sum = sum
            .wrapping_add((offset >> 8) as u8)
            .wrapping_add(offset as u8)
            .wrapping_add(rtype);
        for &b in payload {
            line.push_str(&format!("{:02X}", b));
            sum = sum.wrapping_add(b);
        }
        line.push_str(&format!("{:02X}", (!sum).wrapping_add(1)));
        line.push('\n');
        line
    }

    #[test]
    fn flat_image_assembled() {
        let mut mcs = String::new();
        mcs.push_str(&record(0, 0x04, &[0x00, 0x00]));
        mcs.push_str(&record(0x0000, 0x00, &[0xDE, 0xAD]));
        mcs.push_str(&record(0x0002, 0x00, &[0xBE, 0xEF]));
        mcs.push_str(&record(0, 0x01, &[]));
        let bs = parse(mcs.as_bytes()).unwrap();
        assert_eq!(bs.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bs.bit_length, 32);
    }

    #[test]
    fn extended_address_keeps_contiguity() {
        let mut mcs = String::new();
        // Fill 0x0000..0x0002, then jump via ELA to 0x1_0000 - not
        // contiguous, must be rejected.
        mcs.push_str(&record(0x0000, 0x00, &[0x11, 0x22]));
        mcs.push_str(&record(0, 0x04, &[0x00, 0x01]));
        mcs.push_str(&record(0x0000, 0x00, &[0x33]));
        mcs.push_str(&record(0, 0x01, &[]));
        assert!(parse(mcs.as_bytes()).is_err());
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let mut line = record(0x0000, 0x00, &[0x11, 0x22]);
        // Corrupt one payload nibble.
        line = line.replace("1122", "1123");
        let mut mcs = line;
        mcs.push_str(&record(0, 0x01, &[]));
        assert!(parse(mcs.as_bytes()).is_err());
    }

    #[test]
    fn missing_eof_rejected() {
        let mcs = record(0x0000, 0x00, &[0x11]);
        assert!(parse(mcs.as_bytes()).is_err());
    }

    #[test]
    fn unsupported_record_type_rejected() {
        let mut mcs = record(0x0000, 0x05, &[0x11, 0x22]);
        mcs.push_str(&record(0, 0x01, &[]));
        let err = parse(mcs.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unsupported record type"));
    }
}
