//! Logical to physical address translation.
//!
//! The recording system works in a single contiguous logical byte address
//! space; each partition's logical range maps onto a contiguous physical
//! range in exactly one device. The map is built once at initialisation by
//! walking the partitions in declaration order and handing each one the
//! next free physical span in its device; the per-row `adjustment` is the
//! constant subtracted from a logical address to reach the physical one.

use alloc::vec::Vec;

use super::{Device, FlashHalError, HalInitError, PhysicalArrangement, DEVICE_COUNT};

/// One partition's slice of the logical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalRegion {
    pub device: Device,
    pub start_address: u32,
    pub end_address: u32,
}

/// One row of the translation table (diagnostic view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTranslation {
    pub device: Device,
    pub logical_start: u32,
    pub logical_end: u32,
    pub physical_start: u32,
    pub physical_end: u32,
    /// Subtract this from a logical address to get the physical address.
    pub adjustment: u32,
}

#[derive(Debug)]
pub(super) struct AddressMap {
    rows: Vec<AddressTranslation>,
}

impl AddressMap {
    /// Build the map, allocating physical space per device in declaration
    /// order. Fails if a device runs out of physical address space.
    pub(super) fn build(
        regions: &[LogicalRegion],
        physical: &[PhysicalArrangement; DEVICE_COUNT],
    ) -> Result<AddressMap, HalInitError> {
        let mut next_address_in_device = [
            physical[0].start_address,
            physical[1].start_address,
            physical[2].start_address,
        ];
        let mut rows = Vec::with_capacity(regions.len());

        for region in regions {
            let device = region.device;
            let adjustment = region
                .start_address
                .wrapping_sub(next_address_in_device[device.index()]);

            let row = AddressTranslation {
                device,
                logical_start: region.start_address,
                logical_end: region.end_address,
                physical_start: region.start_address.wrapping_sub(adjustment),
                physical_end: region.end_address.wrapping_sub(adjustment),
                adjustment,
            };

            if row.physical_end > physical[device.index()].end_address {
                return Err(HalInitError::DeviceExhausted(device));
            }

            next_address_in_device[device.index()] = row.physical_end + 1;
            rows.push(row);
        }

        Ok(AddressMap { rows })
    }

    /// Map a logical address to `(device, physical address)`, checking that
    /// the whole `bytes`-long operation stays inside the device.
    pub(super) fn translate(
        &self,
        logical: u32,
        bytes: u32,
        physical: &[PhysicalArrangement; DEVICE_COUNT],
    ) -> Result<(Device, u32), FlashHalError> {
        let row = self
            .rows
            .iter()
            .find(|row| logical >= row.logical_start && logical <= row.logical_end)
            .ok_or(FlashHalError::InvalidAddress)?;

        // The adjustment is a modular offset; it may wrap when a device's
        // physical base sits above the logical range.
        let physical_start = logical.wrapping_sub(row.adjustment);
        let physical_end = if bytes == 0 {
            physical_start
        } else {
            physical_start
                .checked_add(bytes - 1)
                .ok_or(FlashHalError::InvalidAddress)?
        };

        if physical_end > physical[row.device.index()].end_address {
            return Err(FlashHalError::InvalidAddress);
        }

        Ok((row.device, physical_start))
    }

    pub(super) fn row(&self, index: usize) -> Option<AddressTranslation> {
        self.rows.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical() -> [PhysicalArrangement; DEVICE_COUNT] {
        [
            PhysicalArrangement {
                device: Device::MainFlash,
                start_address: 0x1000,
                end_address: 0x1FFF,
                block_size_bytes: 0x800,
            },
            PhysicalArrangement {
                device: Device::SerialFlash,
                start_address: 0,
                end_address: 0x7FF,
                block_size_bytes: 1,
            },
            PhysicalArrangement {
                device: Device::I2cEeprom,
                start_address: 0,
                end_address: 0x3FF,
                block_size_bytes: 1,
            },
        ]
    }

    // Two NOR partitions back to back, then one on the serial flash.
    fn regions() -> [LogicalRegion; 3] {
        [
            LogicalRegion {
                device: Device::MainFlash,
                start_address: 0,
                end_address: 0x7FF,
            },
            LogicalRegion {
                device: Device::MainFlash,
                start_address: 0x800,
                end_address: 0xFFF,
            },
            LogicalRegion {
                device: Device::SerialFlash,
                start_address: 0x1000,
                end_address: 0x13FF,
            },
        ]
    }

    #[test]
    fn test_build_packs_devices_in_order() {
        let map = AddressMap::build(&regions(), &physical()).expect("map builds");

        let first = map.row(0).unwrap();
        assert_eq!(first.physical_start, 0x1000, "device physical base applies");
        assert_eq!(first.physical_end, 0x17FF);

        let second = map.row(1).unwrap();
        assert_eq!(
            second.physical_start, 0x1800,
            "second region continues where the first ended"
        );

        let third = map.row(2).unwrap();
        assert_eq!(third.device, Device::SerialFlash);
        assert_eq!(third.physical_start, 0);
        assert_eq!(third.adjustment, 0x1000);
    }

    #[test]
    fn test_build_detects_exhausted_device() {
        let oversized = [LogicalRegion {
            device: Device::I2cEeprom,
            start_address: 0,
            end_address: 0x400, // one byte past the 0x3FF device end
        }];
        assert_eq!(
            AddressMap::build(&oversized, &physical()),
            Err(HalInitError::DeviceExhausted(Device::I2cEeprom))
        );
    }

    #[test]
    fn test_translate_applies_adjustment() {
        let map = AddressMap::build(&regions(), &physical()).expect("map builds");
        let phys = physical();

        assert_eq!(
            map.translate(0x812, 4, &phys),
            Ok((Device::MainFlash, 0x1812))
        );
        assert_eq!(
            map.translate(0x1001, 1, &phys),
            Ok((Device::SerialFlash, 0x001))
        );
    }

    #[test]
    fn test_translate_rejects_unmapped_and_overrun() {
        let map = AddressMap::build(&regions(), &physical()).expect("map builds");
        let phys = physical();

        assert_eq!(
            map.translate(0x1400, 1, &phys),
            Err(FlashHalError::InvalidAddress),
            "address beyond all regions"
        );
        assert_eq!(
            map.translate(0x13FF, 2, &phys),
            Err(FlashHalError::InvalidAddress),
            "operation runs past the device end"
        );
        // Zero-length operations at a valid address are allowed.
        assert!(map.translate(0x13FF, 0, &phys).is_ok());
    }

    impl PartialEq for AddressMap {
        fn eq(&self, other: &Self) -> bool {
            self.rows == other.rows
        }
    }
}
