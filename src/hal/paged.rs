//! Byte-addressable serial devices (SPI flash, I2C EEPROM).
//!
//! Neither part has an erase command, so erase is emulated by writing the
//! blank value over the range: align up to the device's write-page first,
//! then stride whole pages, then flush the tail. Blank checking reads in
//! page-sized chunks for the same reason single-byte reads are avoided on
//! these parts: the bus overhead per transfer dominates.

use alloc::vec;

use crate::config::BLANK_LOCATION_CONTAINS;

use super::{buffer_is_blank, ByteDevice, DeviceFault};

pub(super) fn erase(
    device: &dyn ByteDevice,
    page_size: u32,
    byte_addr: u32,
    bytes: u32,
) -> Result<(), DeviceFault> {
    let blank = vec![BLANK_LOCATION_CONTAINS; page_size as usize];

    let mut remaining = bytes;
    let mut addr = byte_addr;

    // Head: bring the address up to a page boundary.
    let offset_in_page = addr % page_size;
    if offset_in_page != 0 {
        let head = remaining.min(page_size - offset_in_page);
        device.block_write(addr, &blank[..head as usize])?;
        remaining -= head;
        addr += head;
    }

    // Whole pages.
    while remaining >= page_size {
        device.block_write(addr, &blank)?;
        remaining -= page_size;
        addr += page_size;
    }

    // Tail.
    if remaining != 0 {
        device.block_write(addr, &blank[..remaining as usize])?;
    }
    Ok(())
}

pub(super) fn blank_check(
    device: &dyn ByteDevice,
    page_size: u32,
    byte_addr: u32,
    bytes: u32,
) -> bool {
    let mut buffer = vec![0u8; page_size as usize];

    let mut remaining = bytes;
    let mut addr = byte_addr;
    while remaining >= page_size {
        if device.block_read(addr, &mut buffer).is_err() || !buffer_is_blank(&buffer) {
            return false;
        }
        remaining -= page_size;
        addr += page_size;
    }
    if remaining != 0 {
        let tail = &mut buffer[..remaining as usize];
        if device.block_read(addr, tail).is_err() || !buffer_is_blank(tail) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::super::mem::MemByteDevice;
    use super::super::{Device, PhysicalArrangement};
    use super::*;

    fn device() -> MemByteDevice {
        MemByteDevice::new(PhysicalArrangement {
            device: Device::SerialFlash,
            start_address: 0,
            end_address: 0x0FFF,
            block_size_bytes: 1,
        })
    }

    #[test]
    fn test_erase_unaligned_head_and_tail() {
        let dev = device();
        let dirty = [0u8; 300];
        dev.block_write(100, &dirty).expect("dirty");

        // 100..400 is neither page-aligned nor a whole number of pages.
        erase(&dev, 128, 100, 300).expect("erase");
        assert!(blank_check(&dev, 128, 100, 300));
    }

    #[test]
    fn test_erase_only_touches_requested_range() {
        let dev = device();
        dev.block_write(0, &[0x11; 512]).expect("dirty");

        erase(&dev, 128, 128, 128).expect("erase one page");
        assert_eq!(dev.peek(127, 1), [0x11], "byte before survives");
        assert_eq!(dev.peek(256, 1), [0x11], "byte after survives");
        assert!(blank_check(&dev, 128, 128, 128));
    }

    #[test]
    fn test_blank_check_finds_single_dirty_byte() {
        let dev = device();
        assert!(blank_check(&dev, 128, 0, 0x1000));
        dev.poke(0x0803, 0x00);
        assert!(!blank_check(&dev, 128, 0, 0x1000));
        assert!(blank_check(&dev, 128, 0, 0x800), "range before the byte");
    }
}
