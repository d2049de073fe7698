//! Word-addressable NOR flash handling.
//!
//! The NOR driver works in 16-bit words, so this module packs and unpacks
//! bytes little-endian, skips the erase of sectors that are already blank,
//! and splits blank checks into word-by-word scans for partial sectors and
//! the device's hardware blank check for whole sectors.
//!
//! Callers guarantee even byte addresses and even byte counts; the checks
//! live in [`super::FlashHal`].

use alloc::vec::Vec;

use super::{DeviceFault, PhysicalArrangement, WordDevice};

pub(super) fn read(
    device: &dyn WordDevice,
    byte_addr: u32,
    out: &mut [u8],
) -> Result<(), DeviceFault> {
    let mut word_addr = byte_addr / 2;
    for pair in out.chunks_exact_mut(2) {
        let word = device.read_word(word_addr)?;
        pair[0] = (word & 0x00FF) as u8;
        pair[1] = (word >> 8) as u8;
        word_addr += 1;
    }
    Ok(())
}

pub(super) fn write(
    device: &dyn WordDevice,
    byte_addr: u32,
    data: &[u8],
) -> Result<(), DeviceFault> {
    let words: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    device.program_words(byte_addr / 2, &words)
}

/// Erase whole sectors, skipping any that are already blank.
pub(super) fn erase(
    device: &dyn WordDevice,
    row: &PhysicalArrangement,
    byte_addr: u32,
    bytes: u32,
) -> Result<(), DeviceFault> {
    let sector_words = row.block_size_bytes / 2;
    let mut word_addr = byte_addr / 2;
    let mut sectors = bytes / row.block_size_bytes;

    while sectors != 0 {
        if !device.sector_blank_check(word_addr) {
            device.erase_sector(word_addr)?;
        }
        word_addr += sector_words;
        sectors -= 1;
    }
    Ok(())
}

/// Blank check an arbitrary even-sized range: words up to the first sector
/// boundary, then hardware sector checks, then the trailing words.
pub(super) fn blank_check(
    device: &dyn WordDevice,
    row: &PhysicalArrangement,
    byte_addr: u32,
    bytes: u32,
) -> bool {
    let sector_words = row.block_size_bytes / 2;
    let device_start_words = row.start_address / 2;

    let mut word_addr = byte_addr / 2;
    let mut words_to_check = bytes / 2;

    let sector_offset = (word_addr - device_start_words) % sector_words;
    let mut leading_words = 0;
    if sector_offset != 0 {
        let to_sector_end = sector_words - sector_offset;
        leading_words = words_to_check.min(to_sector_end);
    }

    words_to_check -= leading_words;
    let whole_sectors = words_to_check / sector_words;
    let trailing_words = words_to_check - whole_sectors * sector_words;

    for _ in 0..leading_words {
        if !word_is_blank(device, word_addr) {
            return false;
        }
        word_addr += 1;
    }
    for _ in 0..whole_sectors {
        if !device.sector_blank_check(word_addr) {
            return false;
        }
        word_addr += sector_words;
    }
    for _ in 0..trailing_words {
        if !word_is_blank(device, word_addr) {
            return false;
        }
        word_addr += 1;
    }
    true
}

fn word_is_blank(device: &dyn WordDevice, word_addr: u32) -> bool {
    matches!(device.read_word(word_addr), Ok(0xFFFF))
}

#[cfg(test)]
mod tests {
    use super::super::mem::MemWordDevice;
    use super::super::Device;
    use super::*;

    fn row() -> PhysicalArrangement {
        PhysicalArrangement {
            device: Device::MainFlash,
            start_address: 0,
            end_address: 0x7FFF,
            block_size_bytes: 0x1000,
        }
    }

    #[test]
    fn test_write_then_read_preserves_bytes() {
        let dev = MemWordDevice::new(row());
        write(&dev, 0x20, &[1, 2, 3, 4, 5, 6]).expect("write");
        let mut back = [0u8; 6];
        read(&dev, 0x20, &mut back).expect("read");
        assert_eq!(back, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_erase_skips_blank_sectors() {
        let dev = MemWordDevice::new(row());
        write(&dev, 0x1000, &[0, 0]).expect("dirty sector 1");

        erase(&dev, &row(), 0, 0x3000).expect("erase three sectors");
        assert_eq!(dev.erased_sectors(), 1, "only the dirty sector is erased");
        assert!(blank_check(&dev, &row(), 0, 0x3000));
    }

    #[test]
    fn test_blank_check_partial_sector_boundaries() {
        let dev = MemWordDevice::new(row());
        // Dirty one word just before a sector boundary.
        write(&dev, 0x0FFE, &[0xAA, 0xBB]).expect("write");

        assert!(!blank_check(&dev, &row(), 0x0FF0, 0x20), "straddling range");
        assert!(blank_check(&dev, &row(), 0x1000, 0x1000), "next sector");
        assert!(blank_check(&dev, &row(), 0x0F00, 0xFE), "range short of it");
    }
}
