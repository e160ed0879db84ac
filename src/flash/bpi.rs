//! BPI parallel NOR flash (Intel/Micron MT28-class) behind a JTAG
//! bridge exposing a USER1-register protocol.
//!
//! One DR shift frames one bus transaction:
//! start(1) + cmd(4) + addr(25) + payload + >=20 pipeline cycles.
//! Reads need one extra transition bit, so read data appears at bit
//! 51 of the response. Words written to the flash are transformed the
//! way `write_cfgmem -interface BPIx16` does it: bit-reverse each
//! byte, then swap the bytes.

use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::bits::{bytes_for_bits, get_bit, reverse_byte, set_bit};
use crate::cable::Transport;
use crate::display::{print_error, print_info, print_warn, ProgressBar};
use crate::jtag::{Jtag, TapState};
use crate::{ProgError, Result};

// Bridge commands (4 bits).
const CMD_WRITE: u8 = 0x1;
const CMD_READ: u8 = 0x2;
const CMD_BURST_WRITE: u8 = 0x4;

// USER1 instruction.
const USER1: u8 = 0x02;
const IRLEN: usize = 6;

// Commands sent to the flash chip itself.
const FLASH_CMD_READ_ARRAY: u16 = 0x00FF;
const FLASH_CMD_READ_ID: u16 = 0x0090;
const FLASH_CMD_READ_STATUS: u16 = 0x0070;
const FLASH_CMD_CLEAR_STATUS: u16 = 0x0050;
const FLASH_CMD_BUFFERED_PRG: u16 = 0x00E9;
const FLASH_CMD_CONFIRM: u16 = 0x00D0;
const FLASH_CMD_BLOCK_ERASE: u16 = 0x0020;
const FLASH_CMD_UNLOCK_BLOCK: u16 = 0x0060;
const FLASH_CMD_UNLOCK_CONF: u16 = 0x00D0;

// Status register bits.
const SR_READY: u8 = 0x80;
const SR_ERASE_ERR: u8 = 0x20;
const SR_PROG_ERR: u8 = 0x10;
const SR_VPP_ERR: u8 = 0x08;

/// 512 words = 1 KiB = one programming region; whole regions avoid
/// object-mode hazards on MT28 parts.
const BUFFER_WORDS: u32 = 512;
const BUFFER_BYTES: u32 = BUFFER_WORDS * 2;

/// The on-wire word for a source byte pair.
pub fn flash_word(b0: u8, b1: u8) -> u16 {
    ((reverse_byte(b0) as u16) << 8) | reverse_byte(b1) as u16
}

/// Largest chunk that stays inside both the buffer and the current
/// block.
pub fn buffer_span(byte_addr: u32, remaining: u32, block_size: u32) -> u32 {
    let chunk = remaining.min(BUFFER_BYTES);
    let to_block_end = block_size - (byte_addr % block_size);
    chunk.min(to_block_end)
}

/// Single-word packet: start + cmd + addr + data(16) + 20 exec pad.
fn pack_word(cmd: u8, word_addr: u32, data: u16) -> (Vec<u8>, usize) {
    let total_bits = 1 + 4 + 25 + 16 + 20;
    let mut tx = vec![0u8; bytes_for_bits(total_bits)];
    let packet: u64 = 1
        | ((cmd as u64 & 0xF) << 1)
        | ((word_addr as u64 & 0x1FF_FFFF) << 5)
        | ((data as u64) << 30);
    for (i, b) in tx.iter_mut().enumerate().take(8) {
        *b = (packet >> (i * 8)) as u8;
    }
    (tx, total_bits)
}

/// Read packet: like a write but with an extra transition bit so the
/// answer lands at bit 51.
fn pack_read(word_addr: u32) -> (Vec<u8>, usize) {
    let total_bits = 1 + 4 + 25 + 20 + 16 + 1;
    let mut tx = vec![0u8; bytes_for_bits(total_bits)];
    let packet: u64 =
        1 | ((CMD_READ as u64) << 1) | ((word_addr as u64 & 0x1FF_FFFF) << 5);
    for (i, b) in tx.iter_mut().enumerate().take(5) {
        *b = (packet >> (i * 8)) as u8;
    }
    (tx, total_bits)
}

/// Burst packet: start + cmd + addr + count(16) + per word
/// data(16) + 21 pad (20 exec + 1 transition).
pub fn pack_burst(word_addr: u32, words: &[u16]) -> (Vec<u8>, usize) {
    let header_bits = 1 + 4 + 25 + 16;
    let per_word_bits = 16 + 21;
    let total_bits = header_bits + words.len() * per_word_bits;
    let mut tx = vec![0u8; bytes_for_bits(total_bits)];

    let mut pos = 0;
    set_bit(&mut tx, pos, true);
    pos += 1;
    for i in 0..4 {
        set_bit(&mut tx, pos, CMD_BURST_WRITE & (1 << i) != 0);
        pos += 1;
    }
    for i in 0..25 {
        set_bit(&mut tx, pos, word_addr & (1 << i) != 0);
        pos += 1;
    }
    let count = words.len() as u32;
    for i in 0..16 {
        set_bit(&mut tx, pos, count & (1 << i) != 0);
        pos += 1;
    }
    for &word in words {
        for i in 0..16 {
            set_bit(&mut tx, pos, word & (1 << i) != 0);
            pos += 1;
        }
        pos += 21;
    }
    (tx, total_bits)
}

pub struct BpiFlash<'a, C: Transport> {
    jtag: &'a mut Jtag<C>,
    capacity: u32,
    block_size: u32,
    manufacturer_id: u16,
    device_id: u16,
    has_burst: bool,
}

impl<'a, C: Transport> BpiFlash<'a, C> {
    pub fn new(jtag: &'a mut Jtag<C>) -> Self {
        Self {
            jtag,
            // MT28GU512AAA: 512 Mbit, 256 KiB blocks.
            capacity: 64 * 1024 * 1024,
            block_size: 256 * 1024,
            manufacturer_id: 0,
            device_id: 0,
            has_burst: true,
        }
    }

    fn select_user1(&mut self) -> Result<()> {
        self.jtag
            .shift_ir(&[USER1], None, IRLEN, TapState::RunTestIdle)
    }

    fn bpi_write(&mut self, word_addr: u32, data: u16) -> Result<()> {
        let (tx, nbits) = pack_word(CMD_WRITE, word_addr, data);
        self.select_user1()?;
        self.jtag
            .shift_dr(Some(&tx), None, nbits, TapState::RunTestIdle)?;
        self.jtag.flush()
    }

    /// Same packet without the IR shift or flush; the caller sets IR
    /// once before a word loop and flushes once after.
    fn bpi_write_queued(&mut self, word_addr: u32, data: u16) -> Result<()> {
        let (tx, nbits) = pack_word(CMD_WRITE, word_addr, data);
        self.jtag
            .shift_dr(Some(&tx), None, nbits, TapState::RunTestIdle)
    }

    fn bpi_read(&mut self, word_addr: u32) -> Result<u16> {
        let (tx, nbits) = pack_read(word_addr);
        let mut rx = vec![0u8; bytes_for_bits(nbits)];
        self.select_user1()?;
        self.jtag
            .shift_dr(Some(&tx), Some(&mut rx), nbits, TapState::RunTestIdle)?;
        self.jtag.flush()?;

        let mut data = 0u16;
        for i in 0..16 {
            if get_bit(&rx, 51 + i) {
                data |= 1 << i;
            }
        }
        Ok(data)
    }

    fn burst_write(&mut self, word_addr: u32, words: &[u16]) -> Result<()> {
        if words.is_empty() {
            return Ok(());
        }
        let (tx, nbits) = pack_burst(word_addr, words);
        self.select_user1()?;
        self.jtag
            .shift_dr(Some(&tx), None, nbits, TapState::RunTestIdle)?;
        self.jtag.flush()
    }

    /// Identify the flash. Unknown manufacturers are reported but not
    /// fatal; absent flash is.
    pub fn detect(&mut self) -> Result<()> {
        print_info("Detecting BPI flash...");
        self.bpi_write(0, FLASH_CMD_READ_ID)?;
        sleep(Duration::from_millis(1));
        self.manufacturer_id = self.bpi_read(0x00)?;
        self.device_id = self.bpi_read(0x01)?;
        self.bpi_write(0, FLASH_CMD_READ_ARRAY)?;
        sleep(Duration::from_millis(1));

        match self.manufacturer_id {
            0x0089 | 0x8900 => print_info("Intel/Micron flash detected"),
            0x0020 | 0x2000 => print_info("Micron flash detected"),
            0xFFFF | 0x0000 => {
                return Err(ProgError::ProtocolError(format!(
                    "no BPI flash detected (ID 0x{:04x})", self.manufacturer_id
                ))
                .into())
            }
            other => print_warn(&format!("Unknown manufacturer: 0x{:04x}", other)),
        }
        print_info(&format!(
            "Manufacturer ID: 0x{:04x} Device ID: 0x{:04x}",
            self.manufacturer_id, self.device_id
        ));
        print_info(&format!("Flash capacity: {} MB", self.capacity >> 20));
        Ok(())
    }

    /// Poll the status register until READY, then return to read
    /// array mode. Error bits abort after a status clear.
    fn wait_ready(&mut self, max_polls: u32) -> Result<()> {
        self.bpi_write(0, FLASH_CMD_READ_STATUS)?;
        for _ in 0..max_polls {
            let status = (self.bpi_read(0)? & 0xFF) as u8;
            if status & SR_READY != 0 {
                if status & (SR_ERASE_ERR | SR_PROG_ERR | SR_VPP_ERR) != 0 {
                    print_error(&format!("BPI flash error: status 0x{:02x}", status));
                    self.bpi_write(0, FLASH_CMD_CLEAR_STATUS)?;
                    return Err(ProgError::ProtocolError(format!(
                        "flash status 0x{:02x}", status
                    ))
                    .into());
                }
                self.bpi_write(0, FLASH_CMD_READ_ARRAY)?;
                return Ok(());
            }
        }
        Err(ProgError::FlashTimeout.into())
    }

    /// Unlock on first entry into a block; callers re-unlock only
    /// when the block changes.
    fn unlock_block(&mut self, block_word_addr: u32) -> Result<()> {
        self.bpi_write(block_word_addr, FLASH_CMD_UNLOCK_BLOCK)?;
        self.bpi_write(block_word_addr, FLASH_CMD_UNLOCK_CONF)?;
        Ok(())
    }

    fn erase_block(&mut self, addr: u32) -> Result<()> {
        let word_addr = addr >> 1;
        debug!("erasing block at 0x{:06x}", addr);
        self.unlock_block(word_addr)?;
        self.bpi_write(word_addr, FLASH_CMD_BLOCK_ERASE)?;
        self.bpi_write(word_addr, FLASH_CMD_CONFIRM)?;
        self.wait_ready(3000)
            .map_err(|_| ProgError::FlashEraseFailed(addr))?;
        Ok(())
    }

    pub fn bulk_erase(&mut self) -> Result<()> {
        let num_blocks = self.capacity / self.block_size;
        let progress = ProgressBar::new("Erasing", num_blocks as u64);
        for i in 0..num_blocks {
            if let Err(e) = self.erase_block(i * self.block_size) {
                progress.fail();
                return Err(e);
            }
            progress.display(i as u64 + 1);
        }
        progress.done();
        Ok(())
    }

    /// Read `len` bytes, undoing the write transformation.
    pub fn read(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        self.bpi_write(0, FLASH_CMD_READ_ARRAY)?;
        let mut data = Vec::with_capacity(len as usize);
        let progress = ProgressBar::new("Reading", len as u64);
        let mut i = 0;
        while i < len {
            let word = self.bpi_read((addr + i) >> 1)?;
            data.push(reverse_byte((word >> 8) as u8));
            if i + 1 < len {
                data.push(reverse_byte(word as u8));
            }
            if i & 0xFFF == 0 {
                progress.display(i as u64);
            }
            i += 2;
        }
        progress.done();
        Ok(data)
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        print_info(&format!(
            "Writing {} bytes to BPI flash at 0x{:06x}", data.len(), addr
        ));
        let len = data.len() as u32;

        let start_block = addr / self.block_size;
        let end_block = (addr + len - 1) / self.block_size;
        print_info(&format!(
            "Erasing {} blocks...", end_block - start_block + 1
        ));
        for block in start_block..=end_block {
            self.erase_block(block * self.block_size)?;
        }

        print_info("Programming (buffered mode)...");
        let progress = ProgressBar::new("Writing", len as u64);

        let mut last_block = u32::MAX;
        let mut offset = 0u32;
        while offset < len {
            let byte_addr = addr + offset;
            let word_addr = byte_addr >> 1;
            let block_word_addr = (byte_addr / self.block_size) * (self.block_size >> 1);

            let current_block = byte_addr / self.block_size;
            if current_block != last_block {
                self.unlock_block(block_word_addr)?;
                last_block = current_block;
            }

            let chunk_bytes = buffer_span(byte_addr, len - offset, self.block_size);
            let chunk_words = (chunk_bytes + 1) / 2;

            let mut words = Vec::with_capacity(chunk_words as usize);
            for w in 0..chunk_words {
                let idx = (offset + w * 2) as usize;
                let b0 = data[idx];
                // Odd tails pad with erased bytes.
                let b1 = if idx + 1 < data.len() { data[idx + 1] } else { 0xFF };
                words.push(flash_word(b0, b1));
            }

            self.bpi_write(0, FLASH_CMD_CLEAR_STATUS)?;
            self.bpi_write(block_word_addr, FLASH_CMD_BUFFERED_PRG)?;
            self.bpi_write(block_word_addr, (chunk_words - 1) as u16)?;

            if self.has_burst {
                self.burst_write(word_addr, &words)?;
            } else {
                self.select_user1()?;
                for (w, &word) in words.iter().enumerate() {
                    self.bpi_write_queued(word_addr + w as u32, word)?;
                }
                self.jtag.flush()?;
            }

            self.bpi_write(block_word_addr, FLASH_CMD_CONFIRM)?;
            if self.wait_ready(500).is_err() {
                progress.fail();
                return Err(ProgError::FlashProgramFailed(byte_addr).into());
            }

            offset += chunk_words * 2;
            progress.display(offset.min(len) as u64);
        }
        self.bpi_write(0, FLASH_CMD_READ_ARRAY)?;
        progress.done();

        // Verify the first 32 words; a mismatch is reported but does
        // not abort the run.
        print_info("Verifying first 32 words...");
        self.bpi_write(0, FLASH_CMD_READ_ARRAY)?;
        let mut verify_ok = true;
        let mut i = 0usize;
        while i < 64 && i < data.len() {
            let b0 = data[i];
            let b1 = if i + 1 < data.len() { data[i + 1] } else { 0xFF };
            let expected = flash_word(b0, b1);
            let actual = self.bpi_read((addr as usize + i) as u32 >> 1)?;
            if actual != expected {
                print_error(&format!(
                    "Verify FAIL at 0x{:04x}: expected 0x{:04x}, got 0x{:04x}",
                    i, expected, actual
                ));
                verify_ok = false;
            }
            i += 2;
        }
        if verify_ok {
            print_info("Verification passed for first 32 words");
        } else {
            print_error("Verification FAILED");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TapSim;

    #[test]
    fn word_transform() {
        // Bit-reverse inside each byte, then byte swap.
        assert_eq!(flash_word(0x0F, 0x01), 0xF080);
        assert_eq!(flash_word(0xA5, 0xA5), 0xA5A5);
        assert_eq!(flash_word(0x80, 0x00), 0x0100);
        assert_eq!(flash_word(0xFF, 0xFF), 0xFFFF);
    }

    #[test]
    fn buffers_never_cross_blocks() {
        let block = 256 * 1024;
        // Mid-block: full buffer.
        assert_eq!(buffer_span(0, 1 << 20, block), BUFFER_BYTES);
        // 100 bytes before a block boundary: clamp.
        assert_eq!(buffer_span(block - 100, 1 << 20, block), 100);
        // Short remainder.
        assert_eq!(buffer_span(0, 10, block), 10);
        // Walking a whole image never produces a crossing chunk.
        let mut addr = 300u32;
        let mut rest = 3 * block;
        while rest > 0 {
            let chunk = buffer_span(addr, rest, block);
            assert!(chunk > 0);
            assert_eq!((addr / block), (addr + chunk - 1) / block);
            addr += chunk;
            rest -= chunk;
        }
    }

    #[test]
    fn word_packet_layout() {
        let (tx, nbits) = pack_word(CMD_WRITE, 0x0000_0003, 0x8001);
        assert_eq!(nbits, 66);
        // start bit.
        assert!(get_bit(&tx, 0));
        // cmd = 1 at bits [4:1].
        assert!(get_bit(&tx, 1));
        assert!(!get_bit(&tx, 2));
        // addr LSBs at bit 5.
        assert!(get_bit(&tx, 5));
        assert!(get_bit(&tx, 6));
        assert!(!get_bit(&tx, 7));
        // data at bits [45:30].
        assert!(get_bit(&tx, 30));
        assert!(get_bit(&tx, 45));
    }

    #[test]
    fn burst_packet_layout() {
        let words = [0xFFFF, 0x0000, 0x8001];
        let (tx, nbits) = pack_burst(0, &words);
        assert_eq!(nbits, 46 + 3 * 37);
        // cmd = 4.
        assert!(!get_bit(&tx, 1));
        assert!(!get_bit(&tx, 2));
        assert!(get_bit(&tx, 3));
        // count = 3 at bits [45:30].
        assert!(get_bit(&tx, 30));
        assert!(get_bit(&tx, 31));
        assert!(!get_bit(&tx, 32));
        // First word starts at bit 46.
        for i in 0..16 {
            assert!(get_bit(&tx, 46 + i));
        }
        // 21 pad bits, then the second word (all zero).
        for i in 0..16 {
            assert!(!get_bit(&tx, 46 + 37 + i));
        }
        // Third word LSB and MSB.
        assert!(get_bit(&tx, 46 + 2 * 37));
        assert!(get_bit(&tx, 46 + 2 * 37 + 15));
    }

    /// READY status presented at bit 51 of every read response.
    fn ready_pattern() -> Vec<bool> {
        let mut pattern = vec![false; 67];
        for i in 0..8 {
            pattern[51 + i] = SR_READY & (1 << i) != 0;
        }
        pattern
    }

    #[test]
    fn buffered_write_command_walk() {
        let mut jtag = Jtag::new(TapSim::new());
        jtag.cable_mut().set_dr_pattern(ready_pattern());
        let data = vec![0x0Fu8; 2048];
        {
            let mut bpi = BpiFlash::new(&mut jtag);
            bpi.write(0, &data).unwrap();
        }
        let sim = jtag.cable_mut();

        // Every transaction went through USER1.
        assert!(sim.ir_updates.iter().all(|&ir| ir == USER1 as u64));

        // Word writes carry their flash command at bits [45:30].
        let word_of = |d: &Vec<u8>| {
            let mut w = 0u16;
            for i in 0..16 {
                if get_bit(d, 30 + i) {
                    w |= 1 << i;
                }
            }
            w
        };
        let word_writes: Vec<u16> = sim
            .dr_updates
            .iter()
            .filter(|d| d.len() == bytes_for_bits(66))
            .map(word_of)
            .collect();

        // One block erase: unlock + erase + confirm.
        assert_eq!(
            word_writes
                .iter()
                .filter(|&&w| w == FLASH_CMD_BLOCK_ERASE)
                .count(),
            1
        );
        // 2048 bytes = 1024 words = 2 buffered-program cycles.
        assert_eq!(
            word_writes
                .iter()
                .filter(|&&w| w == FLASH_CMD_BUFFERED_PRG)
                .count(),
            2
        );
        assert_eq!(
            word_writes
                .iter()
                .filter(|&&w| w == FLASH_CMD_CLEAR_STATUS)
                .count(),
            2
        );
        // Word count operand (512 - 1) once per cycle.
        assert_eq!(
            word_writes.iter().filter(|&&w| w == 511).count(),
            2
        );

        // Two burst payloads; the first data word is the transformed
        // source pair (0x0F, 0x0F).
        let bursts: Vec<&Vec<u8>> = sim
            .dr_updates
            .iter()
            .filter(|d| d.len() == bytes_for_bits(46 + 512 * 37))
            .collect();
        assert_eq!(bursts.len(), 2);
        let mut first_word = 0u16;
        for i in 0..16 {
            if get_bit(bursts[0], 46 + i) {
                first_word |= 1 << i;
            }
        }
        assert_eq!(first_word, flash_word(0x0F, 0x0F));
    }
}
