//! Static board name -> cable table, plus the flash bus each board
//! wires to its FPGA.

/// Which external configuration memory the board carries.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FlashKind {
    /// SPI NOR reached through the `spiOverJtag` bridge.
    Spi,
    /// x16 parallel NOR reached through the BPI bridge.
    Bpi,
}

pub struct Board {
    pub name: &'static str,
    pub cable: &'static str,
    pub flash: FlashKind,
}

static BOARD_LIST: &[Board] = &[
    Board { name: "arty", cable: "digilent", flash: FlashKind::Spi },
    Board { name: "cyc1000", cable: "ft2232", flash: FlashKind::Spi },
    Board { name: "tangnano", cable: "ft2232_b", flash: FlashKind::Spi },
    // Virtex-class boards boot from x16 parallel NOR.
    Board { name: "ml605", cable: "ft2232", flash: FlashKind::Bpi },
    Board { name: "icev_wireless", cable: "icev_wireless", flash: FlashKind::Spi },
];

pub fn board_by_name(name: &str) -> Option<&'static Board> {
    BOARD_LIST.iter().find(|b| b.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_lookup() {
        let arty = board_by_name("arty").unwrap();
        assert_eq!(arty.cable, "digilent");
        assert_eq!(arty.flash, FlashKind::Spi);
        assert_eq!(board_by_name("ml605").unwrap().flash, FlashKind::Bpi);
        assert!(board_by_name("nope").is_none());
    }
}
