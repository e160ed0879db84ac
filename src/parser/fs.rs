//! Gowin `.fs` parser.
//!
//! The file is ASCII `0`/`1`, one configuration frame per line, with a
//! leading `//key: value` comment block and binary header lines whose
//! first byte is a key. The payload is sent to the device as-is (the
//! device inflates compressed streams itself), but the 16-bit word sum
//! used for post-program verification is computed over the inflated
//! frames minus framing, CRC and per-line address padding.

use crate::bits::reverse_byte;
use crate::parser::{parse_err, Bitstream};
use crate::Result;

/// Frame counts per IDCODE, from the configuration user guide.
fn lines_for_idcode(idcode: u32) -> Option<u32> {
    let nb_line = match idcode {
        0x0900281B | 0x0900381B | 0x0100681B => 274,
        0x0100181B | 0x1100181B | 0x0300081B | 0x0300181B
        | 0x0100981B | 0x0100381B | 0x1100381B => 494,
        0x0100481B | 0x1100481B | 0x0100581B | 0x1100581B => 712,
        0x0000081B => 1342,
        0x0000281B => 2038,
        _ => return None,
    };
    Some(nb_line)
}

fn bit_to_val(chars: &[u8]) -> u64 {
    let mut val = 0u64;
    for &c in chars {
        val = (val << 1) | (c == b'1') as u64;
    }
    val
}

pub fn parse(raw: &[u8], reverse: bool) -> Result<Bitstream> {
    let mut header = Vec::new();
    let mut lines: Vec<&[u8]> = Vec::new();

    let mut idcode = 0u32;
    let mut file_checksum: Option<u16> = None;
    let mut compressed = false;
    let mut crc_check = false;
    let mut conf_data_length = 0u32;
    let mut z8 = 0xFFu8;
    let mut z4 = 0xFFu8;
    let mut z2 = 0xFFu8;
    let mut end_header = None;

    let mut in_header = true;
    for line in raw.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            break;
        }
        if line[0] == b'/' {
            continue;
        }

        lines.push(line);

        if !in_header {
            continue;
        }
        if line.len() < 8 {
            return Err(parse_err("fs: short header line"));
        }
        let key = (bit_to_val(&line[..8]) as u8) & 0x7F;
        let val = bit_to_val(line);

        match key {
            0x06 => {
                idcode = (val & 0xFFFF_FFFF) as u32;
                header.push(("idcode".into(), format!("{:08x}", idcode)));
            }
            0x0A => {
                let sum = (val & 0xFFFF) as u16;
                file_checksum = Some(sum);
                header.push(("CheckSum".into(), format!("{:04x}", sum)));
            }
            0x0B => {
                header.push(("SecurityBit".into(), "ON".into()));
            }
            0x10 => {
                compressed = val >> 13 & 1 == 1;
                header.push(("loading_rate".into(), (val >> 16 & 0xFF).to_string()));
                header.push(("Compress".into(),
                    if compressed { "ON" } else { "OFF" }.into()));
                header.push(("ProgramDoneBypass".into(),
                    if val >> 12 & 1 == 1 { "ON" } else { "OFF" }.into()));
            }
            0x12 => {
                // Undocumented; skipped.
            }
            0x51 => {
                z8 = (val >> 16 & 0xFF) as u8;
                z4 = (val >> 8 & 0xFF) as u8;
                z2 = (val & 0xFF) as u8;
            }
            0x52 => {
                header.push(("SPIAddr".into(),
                    format!("{:08x}", (val & 0xFFFF_FFFF) as u32)));
            }
            0x3B => {
                crc_check = val >> 23 & 1 == 1;
                conf_data_length = (val & 0xFFFF) as u32;
                header.push(("CRCCheck".into(),
                    if crc_check { "ON" } else { "OFF" }.into()));
                header.push(("ConfDataLength".into(), conf_data_length.to_string()));
                end_header = Some(lines.len() - 1);
                in_header = false;
            }
            _ => {}
        }
    }

    let end_header = match end_header {
        Some(idx) => idx,
        None => return Err(parse_err("fs: header terminator not found")),
    };

    // The device receives every line verbatim, byte-packed; the
    // compressed form stays compressed on the wire.
    let mut data = Vec::new();
    for line in &lines {
        for chunk in line.chunks(8) {
            if chunk.len() != 8 {
                return Err(parse_err("fs: line length not byte aligned"));
            }
            let byte = bit_to_val(chunk) as u8;
            data.push(if reverse { reverse_byte(byte) } else { byte });
        }
    }

    if idcode == 0 {
        return Err(parse_err("fs: IDCODE not found"));
    }
    let mut nb_line = lines_for_idcode(idcode)
        .ok_or_else(|| parse_err(&format!("fs: unknown IDCODE {:08x}", idcode)))?;

    // GW1N-6/9 frames carry a 4-bit address field, 40 more bits when
    // the stream is compressed.
    let mut padding = 0usize;
    if let 0x0100481B | 0x1100481B | 0x0100581B | 0x1100581B = idcode {
        padding = 4;
        if compressed {
            padding += 5 * 8;
        }
    }

    // The guide gives an upper bound; the header may say fewer.
    if conf_data_length != 0 && conf_data_length < nb_line {
        nb_line = conf_data_length;
    }

    let frames: Vec<&[u8]> = lines
        .iter()
        .skip(end_header + 1)
        .take(nb_line as usize)
        .copied()
        .collect();

    // Trailing framing: 6 bytes, plus the CRC when present.
    let drop = 6 * 8 + if crc_check { 2 * 8 } else { 0 };

    let mut summed = Vec::new();
    for frame in &frames {
        if frame.len() < drop {
            return Err(parse_err("fs: frame shorter than framing"));
        }
        let body = &frame[..frame.len() - drop];
        let inflated: Vec<u8>;
        let body = if compressed {
            let mut out = Vec::with_capacity(body.len() * 8);
            for chunk in body.chunks(8) {
                if chunk.len() != 8 {
                    return Err(parse_err("fs: frame length not byte aligned"));
                }
                let byte = bit_to_val(chunk) as u8;
                if byte == z8 {
                    out.extend(std::iter::repeat(b'0').take(8 * 8));
                } else if byte == z4 {
                    out.extend(std::iter::repeat(b'0').take(4 * 8));
                } else if byte == z2 {
                    out.extend(std::iter::repeat(b'0').take(2 * 8));
                } else {
                    out.extend_from_slice(chunk);
                }
            }
            inflated = out;
            &inflated[..]
        } else {
            body
        };
        if body.len() < padding {
            return Err(parse_err("fs: frame shorter than padding"));
        }
        summed.extend_from_slice(&body[padding..]);
    }

    let mut checksum = 0u16;
    for word in summed.chunks(16) {
        checksum = checksum.wrapping_add(bit_to_val(word) as u16);
    }

    if let Some(expected) = file_checksum {
        if expected != checksum {
            return Err(parse_err(&format!(
                "checksum: expected {:04x} computed {:04x}", expected, checksum
            )));
        }
    }

    let mut bitstream = Bitstream::new(data);
    bitstream.idcode = Some(idcode);
    bitstream.checksum = Some(checksum);
    bitstream.header = header;
    Ok(bitstream)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn bits_of(val: u64, len: usize) -> String {
        (0..len)
            .rev()
            .map(|i| if val >> i & 1 == 1 { '1' } else { '0' })
            .collect()
    }

    /// Header line: 8-bit key then the value in the line's low bits.
    fn header_line(key: u8, val: u64) -> String {
        let mut line = bits_of(key as u64, 8);
        line.push_str(&bits_of(val, 56));
        line
    }

    /// Assemble an uncompressed GW1N-1 image with two frames whose
    /// word-sum is known.
    pub fn build_fs_file(checksum: u16, with_crc: bool) -> (Vec<u8>, u16) {
        let mut fs = String::new();
        fs.push_str("//generated for test\n");
        fs.push_str(&header_line(0x06, 0x0900281B));
        fs.push('\n');
        fs.push_str(&header_line(0x0A, checksum as u64));
        fs.push('\n');
        fs.push_str(&header_line(0x10, 0));
        fs.push('\n');
        let crc_bit = if with_crc { 1u64 << 23 } else { 0 };
        fs.push_str(&header_line(0x3B, crc_bit | 2));
        fs.push('\n');

        // Two frames: payload words then 6 framing bytes (0xFF), plus
        // a dummy CRC when requested.
        let words: [[u16; 2]; 2] = [[0x1111, 0x0203], [0x2222, 0x0102]];
        let mut sum = 0u16;
        for frame in &words {
            for &w in frame {
                sum = sum.wrapping_add(w);
                fs.push_str(&bits_of(w as u64, 16));
            }
            if with_crc {
                fs.push_str(&bits_of(0xBEEF, 16));
            }
            fs.push_str(&bits_of(0xFFFF_FFFF_FFFF, 48));
            fs.push('\n');
        }
        (fs.into_bytes(), sum)
    }

    #[test]
    fn checksum_and_idcode_extracted() {
        let (raw, sum) = build_fs_file(0x4638, false);
        let bs = parse(&raw, true).unwrap();
        assert_eq!(bs.idcode, Some(0x0900281B));
        assert_eq!(bs.checksum, Some(sum));
        assert_eq!(sum, 0x4638);
        assert!(bs.bit_length > 0);
    }

    #[test]
    fn crc_bytes_excluded_from_sum() {
        let (raw, sum) = build_fs_file(0x4638, true);
        let bs = parse(&raw, true).unwrap();
        assert_eq!(bs.checksum, Some(sum));
    }

    #[test]
    fn checksum_mismatch_is_parse_error() {
        let (raw, _) = build_fs_file(0x1234, false);
        let err = parse(&raw, true).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn compressed_frames_inflate_for_sum() {
        // GW1N-9: padding 4 bits, + 40 when compressed. One frame,
        // ConfDataLength = 1.
        let mut fs = String::new();
        fs.push_str(&header_line(0x06, 0x1100581B));
        fs.push('\n');
        // Compress flag lives in bit 13 of key 0x10.
        fs.push_str(&header_line(0x10, 1 << 13));
        fs.push('\n');
        // Z8 = 0x3B, Z4 = 0x17, Z2 = 0x0D.
        fs.push_str(&header_line(0x51, 0x3B170D));
        fs.push('\n');
        fs.push_str(&header_line(0x3B, 1));
        fs.push('\n');

        // Frame: a Z8 marker byte (inflates to 64 zero bits) then
        // 0xABCD, then 6 framing bytes. The 44-bit address padding is
        // dropped from the inflated stream.
        let mut frame = String::new();
        frame.push_str(&bits_of(0x3B, 8));
        frame.push_str(&bits_of(0xABCD, 16));
        frame.push_str(&bits_of(0xFFFF_FFFF_FFFF, 48));
        fs.push_str(&frame);
        fs.push('\n');

        let bs = parse(fs.as_bytes(), true).unwrap();
        // Inflated body: 64 zeros + ABCD; minus 44 padding bits that
        // leaves 20 zeros then ABCD, summed in 16-bit words:
        // 0x0000 + 0x0ABC + 0xD (4-bit tail).
        let checksum = bs.checksum.unwrap();
        assert_eq!(checksum, 0x0ABCu16.wrapping_add(0xD));
    }

    #[test]
    fn unknown_idcode_rejected() {
        let mut fs = String::new();
        fs.push_str(&header_line(0x06, 0x11223344));
        fs.push('\n');
        fs.push_str(&header_line(0x3B, 1));
        fs.push('\n');
        assert!(parse(fs.as_bytes(), true).is_err());
    }
}
