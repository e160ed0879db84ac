//! Intel/Altera EPCQ configuration flash over MPSSE-SPI.
//!
//! The EPCQ hangs off the FTDI's second channel as a plain SPI slave.
//! It expects LSB-first bytes on the wire, so `.rpd` images (already
//! LSB-oriented) go out reversed per byte when `reverse` is set.
//! Sector size 64 KiB, page size 256 bytes.

use log::debug;

use crate::bits::reverse_byte;
use crate::cable::mpsse::{CsMode, MpsseSpi};
use crate::display::{print_info, ProgressBar};
use crate::{ProgError, Result};

const RD_STATUS_REG: u8 = 0x05;
const RD_DEV_ID_REG: u8 = 0x9F;
const RD_SILICON_ID_REG: u8 = 0xAB;
const RD_FAST_READ_REG: u8 = 0x0B;
const WR_ENABLE_REG: u8 = 0x06;
const WR_BYTES_REG: u8 = 0x02;
const ERASE_SECTOR_REG: u8 = 0xD8;

const STATUS_REG_WIP: u8 = 1 << 0;
const STATUS_REG_WEL: u8 = 1 << 1;

const SECTOR_SIZE: u32 = 65536;
const PAGE_SIZE: usize = 256;

const POLL_LIMIT: u32 = 100_000;

/// The SPI surface the EPCQ engine drives. Implemented by the MPSSE
/// SPI channel; tests substitute a software flash model.
pub trait SpiPort {
    fn set_cs_manual(&mut self, manual: bool);
    fn set_cs(&mut self) -> Result<()>;
    fn clear_cs(&mut self) -> Result<()>;
    fn wr_and_rd(&mut self, len: usize, tx: Option<&[u8]>, rx: Option<&mut [u8]>)
        -> Result<()>;
    fn wr_then_rd(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;
}

impl SpiPort for MpsseSpi {
    fn set_cs_manual(&mut self, manual: bool) {
        self.set_cs_mode(if manual { CsMode::Manual } else { CsMode::Auto });
    }

    fn set_cs(&mut self) -> Result<()> {
        MpsseSpi::set_cs(self)
    }

    fn clear_cs(&mut self) -> Result<()> {
        MpsseSpi::clear_cs(self)
    }

    fn wr_and_rd(&mut self, len: usize, tx: Option<&[u8]>, rx: Option<&mut [u8]>)
        -> Result<()>
    {
        MpsseSpi::wr_and_rd(self, len, tx, rx)
    }

    fn wr_then_rd(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        MpsseSpi::wr_then_rd(self, tx, rx)
    }
}

pub struct Epcq<S: SpiPort> {
    spi: S,
}

impl<S: SpiPort> Epcq<S> {
    pub fn new(spi: S) -> Self {
        Self { spi }
    }

    /// Read device and silicon IDs.
    pub fn detect(&mut self) -> Result<u16> {
        let mut device_id = [0u8; 1];
        // 1 command byte + 2 dummy bytes before the answer.
        self.spi
            .wr_then_rd(&[RD_DEV_ID_REG, 0, 0], &mut device_id)?;
        let mut silicon_id = [0u8; 1];
        self.spi
            .wr_then_rd(&[RD_SILICON_ID_REG, 0, 0, 0], &mut silicon_id)?;
        print_info(&format!(
            "EPCQ device id 0x{:02x} silicon id 0x{:02x}",
            device_id[0], silicon_id[0]
        ));
        Ok(((device_id[0] as u16) << 8) | silicon_id[0] as u16)
    }

    /// Hold CS while polling the status register until
    /// `(status & mask) == cond`.
    fn wait_status(&mut self, mask: u8, cond: u8) -> Result<()> {
        self.spi.set_cs_manual(true);
        self.spi.clear_cs()?;
        self.spi.wr_and_rd(1, Some(&[RD_STATUS_REG]), None)?;
        let mut result: Result<()> = Err(ProgError::FlashTimeout.into());
        for _ in 0..POLL_LIMIT {
            let mut status = [0u8; 1];
            self.spi.wr_and_rd(1, None, Some(&mut status))?;
            if status[0] & mask == cond {
                result = Ok(());
                break;
            }
        }
        self.spi.set_cs()?;
        self.spi.set_cs_manual(false);
        result
    }

    fn write_enable(&mut self) -> Result<()> {
        self.spi.wr_and_rd(1, Some(&[WR_ENABLE_REG]), None)?;
        self.wait_status(STATUS_REG_WEL, STATUS_REG_WEL)
    }

    fn wait_wip(&mut self) -> Result<()> {
        self.wait_status(STATUS_REG_WIP, 0)
    }

    /// Erase exactly the sectors covering `nb_sectors` starting at
    /// `start_sector`.
    pub fn erase_sectors(&mut self, start_sector: u32, nb_sectors: u32) -> Result<()> {
        print_info(&format!("erase {} sectors", nb_sectors));
        for i in 0..nb_sectors {
            let base_addr = (start_sector + i) * SECTOR_SIZE;
            self.write_enable()?;
            let cmd = [
                ERASE_SECTOR_REG,
                (base_addr >> 16) as u8,
                (base_addr >> 8) as u8,
                base_addr as u8,
            ];
            self.spi.wr_and_rd(4, Some(&cmd), None)?;
            self.wait_wip()
                .map_err(|_| ProgError::FlashEraseFailed(base_addr))?;
            debug!("sector at 0x{:06x} erased", base_addr);
        }
        Ok(())
    }

    /// Erase the covered sectors, then program in 256-byte pages with
    /// a write-enable before each page and a WIP poll after it.
    pub fn program(&mut self, start_offset: u32, data: &[u8], reverse: bool) -> Result<()> {
        let nb_sect = (data.len() as u32 + SECTOR_SIZE - 1) / SECTOR_SIZE;
        let start_sector = start_offset / SECTOR_SIZE;
        self.erase_sectors(start_sector, nb_sect)?;

        print_info(&format!(
            "program in {} mode", if reverse { "reverse" } else { "direct" }
        ));
        let progress = ProgressBar::new("Writing", data.len() as u64);

        let mut offset = start_offset;
        for page in data.chunks(PAGE_SIZE) {
            self.write_enable()?;
            let mut buffer = Vec::with_capacity(4 + page.len());
            buffer.push(WR_BYTES_REG);
            buffer.push((offset >> 16) as u8);
            buffer.push((offset >> 8) as u8);
            buffer.push(offset as u8);
            for &b in page {
                buffer.push(if reverse { reverse_byte(b) } else { b });
            }
            self.spi.wr_and_rd(buffer.len(), Some(&buffer), None)?;
            self.wait_wip()
                .map_err(|_| ProgError::FlashProgramFailed(offset))?;
            offset += page.len() as u32;
            progress.display((offset - start_offset) as u64);
        }
        progress.done();
        Ok(())
    }

    /// Fast-read `len` bytes into a heap buffer.
    pub fn dump(&mut self, addr: u32, len: usize, reverse: bool) -> Result<Vec<u8>> {
        // 1 command + 3 address bytes + 8 dummy clocks.
        let cmd = [
            RD_FAST_READ_REG,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
            0,
        ];
        let mut data = vec![0u8; len];
        self.spi.wr_then_rd(&cmd, &mut data)?;
        if reverse {
            for b in data.iter_mut() {
                *b = reverse_byte(*b);
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records whole CS-framed transactions and answers status reads
    /// with an idle WEL-set register.
    struct MockSpi {
        cs_low: bool,
        manual: bool,
        current: Vec<u8>,
        pub transactions: Vec<Vec<u8>>,
    }

    impl MockSpi {
        fn new() -> Self {
            Self {
                cs_low: false,
                manual: false,
                current: Vec::new(),
                transactions: Vec::new(),
            }
        }
    }

    impl SpiPort for MockSpi {
        fn set_cs_manual(&mut self, manual: bool) {
            self.manual = manual;
        }

        fn set_cs(&mut self) -> Result<()> {
            if self.cs_low && !self.current.is_empty() {
                self.transactions.push(std::mem::take(&mut self.current));
            }
            self.cs_low = false;
            Ok(())
        }

        fn clear_cs(&mut self) -> Result<()> {
            self.cs_low = true;
            Ok(())
        }

        fn wr_and_rd(
            &mut self,
            len: usize,
            tx: Option<&[u8]>,
            rx: Option<&mut [u8]>,
        ) -> Result<()> {
            if !self.manual {
                self.clear_cs()?;
            }
            if let Some(data) = tx {
                self.current.extend_from_slice(&data[..len]);
            }
            if let Some(buf) = rx {
                // Status answers: write-enabled, not busy.
                for b in buf.iter_mut() {
                    *b = STATUS_REG_WEL;
                }
            }
            if !self.manual {
                self.set_cs()?;
            }
            Ok(())
        }

        fn wr_then_rd(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
            self.current.extend_from_slice(tx);
            for b in rx.iter_mut() {
                *b = 0x15;
            }
            self.transactions.push(std::mem::take(&mut self.current));
            Ok(())
        }
    }

    #[test]
    fn three_sector_image_erases_three_sectors() {
        let data = vec![0x80u8; 3 * 65536];
        let mut epcq = Epcq::new(MockSpi::new());
        epcq.program(0, &data, true).unwrap();

        let erases: Vec<&Vec<u8>> = epcq
            .spi
            .transactions
            .iter()
            .filter(|t| t[0] == ERASE_SECTOR_REG)
            .collect();
        assert_eq!(erases.len(), 3);
        let addr_of = |t: &Vec<u8>| {
            ((t[1] as u32) << 16) | ((t[2] as u32) << 8) | t[3] as u32
        };
        assert_eq!(addr_of(erases[0]), 0x00000);
        assert_eq!(addr_of(erases[1]), 0x10000);
        assert_eq!(addr_of(erases[2]), 0x20000);

        // 768 page programs of 256 bytes each, write-enable before
        // every page.
        let pages: Vec<&Vec<u8>> = epcq
            .spi
            .transactions
            .iter()
            .filter(|t| t[0] == WR_BYTES_REG)
            .collect();
        assert_eq!(pages.len(), 768);
        assert!(pages.iter().all(|p| p.len() == 4 + 256));
        let enables = epcq
            .spi
            .transactions
            .iter()
            .filter(|t| t[0] == WR_ENABLE_REG)
            .count();
        assert_eq!(enables, 3 + 768);

        // Reverse mode: 0x80 goes out as 0x01.
        assert!(pages[0][4..].iter().all(|&b| b == 0x01));
        // Second page lands at offset 0x100.
        assert_eq!(addr_of(pages[1]), 0x100);
    }

    #[test]
    fn direct_mode_keeps_bytes() {
        let data = vec![0x80u8; 256];
        let mut epcq = Epcq::new(MockSpi::new());
        epcq.program(0x10000, &data, false).unwrap();
        let page = epcq
            .spi
            .transactions
            .iter()
            .find(|t| t[0] == WR_BYTES_REG)
            .unwrap();
        assert!(page[4..].iter().all(|&b| b == 0x80));
        // Offset honoured in the page address.
        assert_eq!(page[1], 0x01);
    }

    #[test]
    fn detect_reads_both_ids() {
        let mut epcq = Epcq::new(MockSpi::new());
        let id = epcq.detect().unwrap();
        assert_eq!(id, 0x1515);
        assert_eq!(epcq.spi.transactions[0][0], RD_DEV_ID_REG);
        assert_eq!(epcq.spi.transactions[1][0], RD_SILICON_ID_REG);
    }
}
