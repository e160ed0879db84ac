//! Static IDCODE -> FPGA descriptor table.

/// Everything the orchestrator needs to know about a supported part.
pub struct FpgaModel {
    pub vendor: &'static str,
    pub family: &'static str,
    pub model: &'static str,
    pub irlength: usize,
    /// Basename of the SPI bridge bitstream, for parts supporting
    /// indirect flash programming.
    pub spi_over_jtag: Option<&'static str>,
}

/// Look up a part by IDCODE. Lookup is total for supported parts;
/// everything else is an unsupported-device error at the call site.
pub fn fpga_by_idcode(idcode: u32) -> Option<&'static FpgaModel> {
    FPGA_LIST
        .iter()
        .find(|(id, _)| *id == idcode)
        .map(|(_, model)| model)
}

static FPGA_LIST: &[(u32, FpgaModel)] = &[
    (0x0362D093, FpgaModel {
        vendor: "xilinx", family: "artix_a7", model: "xc7a35",
        irlength: 6, spi_over_jtag: Some("spiOverJtag_xc7a35.bit"),
    }),
    (0x0362C093, FpgaModel {
        vendor: "xilinx", family: "artix_a7", model: "xc7a25",
        irlength: 6, spi_over_jtag: Some("spiOverJtag_xc7a25.bit"),
    }),
    (0x13631093, FpgaModel {
        vendor: "xilinx", family: "artix_a7", model: "xc7a100",
        irlength: 6, spi_over_jtag: Some("spiOverJtag_xc7a100.bit"),
    }),
    (0x020F30DD, FpgaModel {
        vendor: "altera", family: "cyclone10_lp", model: "10CL025",
        irlength: 10, spi_over_jtag: None,
    }),
    (0x020F10DD, FpgaModel {
        vendor: "altera", family: "cyclone_e", model: "EP4CE6",
        irlength: 10, spi_over_jtag: None,
    }),
    (0x612BD043, FpgaModel {
        vendor: "lattice", family: "machxo3", model: "LCMXO3LF-6900C",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x612B3043, FpgaModel {
        vendor: "lattice", family: "machxo3", model: "LCMXO3LF-1300E",
        irlength: 8, spi_over_jtag: None,
    }),
    // Gowin GW1N/GW2A families; line counts live in the fs parser.
    (0x0900281B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-1",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0900381B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-1S",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0100681B, FpgaModel {
        vendor: "gowin", family: "gw1nz", model: "GW1NZ-1",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0100181B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-2",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x1100181B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-2B",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0300081B, FpgaModel {
        vendor: "gowin", family: "gw1ns", model: "GW1NS-2",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0300181B, FpgaModel {
        vendor: "gowin", family: "gw1ns", model: "GW1NSx-2C",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0100981B, FpgaModel {
        vendor: "gowin", family: "gw1nsr", model: "GW1NSR-4C",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0100381B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-4",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x1100381B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-4B",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0100481B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-6",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x1100481B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-9C",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0100581B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-9 (ES)",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x1100581B, FpgaModel {
        vendor: "gowin", family: "gw1n", model: "GW1N-9",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0000081B, FpgaModel {
        vendor: "gowin", family: "gw2a", model: "GW2A-18",
        irlength: 8, spi_over_jtag: None,
    }),
    (0x0000281B, FpgaModel {
        vendor: "gowin", family: "gw2a", model: "GW2A-55",
        irlength: 8, spi_over_jtag: None,
    }),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_parts_resolve() {
        let xc7a35 = fpga_by_idcode(0x0362D093).unwrap();
        assert_eq!(xc7a35.vendor, "xilinx");
        assert_eq!(xc7a35.irlength, 6);
        assert!(xc7a35.spi_over_jtag.is_some());

        let gw1n9 = fpga_by_idcode(0x1100581B).unwrap();
        assert_eq!(gw1n9.vendor, "gowin");
        assert_eq!(gw1n9.model, "GW1N-9");
    }

    #[test]
    fn unknown_part_is_none() {
        assert!(fpga_by_idcode(0xDEADBEEF).is_none());
    }
}
