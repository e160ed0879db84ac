//! Raw binary image, with optional per-byte bit reversal.

use crate::bits::reverse_byte;
use crate::parser::Bitstream;
use crate::Result;

pub fn parse(raw: &[u8], reverse: bool) -> Result<Bitstream> {
    let data = if reverse {
        raw.iter().map(|&b| reverse_byte(b)).collect()
    } else {
        raw.to_vec()
    };
    Ok(Bitstream::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_reversed() {
        let raw = [0x0F, 0x80, 0xA5];
        let direct = parse(&raw, false).unwrap();
        assert_eq!(direct.data, raw.to_vec());
        assert_eq!(direct.bit_length, 24);

        let reversed = parse(&raw, true).unwrap();
        assert_eq!(reversed.data, vec![0xF0, 0x01, 0xA5]);
    }
}
