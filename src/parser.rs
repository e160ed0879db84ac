//! Bitstream loading: format detection by extension, transparent
//! gunzip, and the per-format parsers.

use std::io::Read;

use failure::ResultExt;

use crate::display::{print_info, print_success};
use crate::{ProgError, Result};

pub mod bit;
pub mod fs;
pub mod jed;
pub mod mcs;
pub mod raw;

/// A parsed configuration bitstream. Immutable after parse: consumers
/// pick a byte view (reversed or not) but never modify the payload.
#[derive(Debug)]
pub struct Bitstream {
    pub data: Vec<u8>,
    /// Length in bits.
    pub bit_length: usize,
    pub idcode: Option<u32>,
    pub checksum: Option<u16>,
    /// Header fields for `--display`, in file order.
    pub header: Vec<(String, String)>,
}

impl Bitstream {
    pub fn new(data: Vec<u8>) -> Self {
        let bit_length = data.len() * 8;
        Self {
            data,
            bit_length,
            idcode: None,
            checksum: None,
            header: Vec::new(),
        }
    }

    pub fn display_header(&self) {
        if self.header.is_empty() {
            return;
        }
        println!("bitstream header infos");
        for (key, val) in &self.header {
            print_info(&format!("{}: ", key));
            print_success(val);
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FileFormat {
    Bit,
    Svf,
    Fs,
    Jed,
    Rpd,
    Mcs,
    Raw,
}

/// Detect the format from the file extension, looking through a
/// trailing `.gz`/`.gzip`.
pub fn format_for_path(path: &str) -> FileFormat {
    let mut name = path;
    for gz in &[".gz", ".gzip"] {
        if let Some(stripped) = name.strip_suffix(gz) {
            name = stripped;
        }
    }
    match name.rsplit('.').next() {
        Some("bit") => FileFormat::Bit,
        Some("svf") => FileFormat::Svf,
        Some("fs") => FileFormat::Fs,
        Some("jed") => FileFormat::Jed,
        Some("rpd") => FileFormat::Rpd,
        Some("mcs") => FileFormat::Mcs,
        _ => FileFormat::Raw,
    }
}

/// Read the raw file (or stdin for `-`), inflating gzip input.
pub fn read_file(path: &str) -> Result<Vec<u8>> {
    let raw = if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Error reading stdin")?;
        buf
    } else {
        std::fs::read(path).with_context(|_| format!("Error opening {}", path))?
    };

    if path.ends_with(".gz") || path.ends_with(".gzip") {
        let mut inflated = Vec::with_capacity(raw.len() * 4);
        flate2::read::GzDecoder::new(&raw[..])
            .read_to_end(&mut inflated)
            .context("Error decompressing input")?;
        return Ok(inflated);
    }
    Ok(raw)
}

/// Parse error helper shared by the format modules.
pub(crate) fn parse_err(msg: &str) -> failure::Error {
    ProgError::ParseError(msg.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection() {
        assert_eq!(format_for_path("top.bit"), FileFormat::Bit);
        assert_eq!(format_for_path("top.bit.gz"), FileFormat::Bit);
        assert_eq!(format_for_path("image.rpd.gzip"), FileFormat::Rpd);
        assert_eq!(format_for_path("design.fs"), FileFormat::Fs);
        assert_eq!(format_for_path("fuses.jed"), FileFormat::Jed);
        assert_eq!(format_for_path("flash.mcs"), FileFormat::Mcs);
        assert_eq!(format_for_path("loader.svf"), FileFormat::Svf);
        assert_eq!(format_for_path("blob.bin"), FileFormat::Raw);
        assert_eq!(format_for_path("noextension"), FileFormat::Raw);
    }
}
