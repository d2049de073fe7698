//! Storage device hardware abstraction layer.
//!
//! Provides uniform read / program / erase / blank-check access over the
//! three storage parts on the memory board through a common logical byte
//! address space, hiding each device's access granularity:
//!
//! - the parallel NOR flash is word-addressable (16-bit), so the HAL packs
//!   and unpacks bytes little-endian and rejects odd addresses or lengths;
//! - the SPI serial flash and the I2C EEPROM are byte-addressable but have
//!   no erase command, so erase is emulated by writing `0xFF` in
//!   write-page-aligned chunks.
//!
//! Concrete drivers are supplied by the integrating firmware through the
//! [`WordDevice`] and [`ByteDevice`] traits and registered once in a
//! [`DeviceRegistry`]; there is no global driver state, so tests construct
//! isolated instances around RAM-backed devices (see [`mem`]).

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use conquer_once::spin::OnceCell;

use crate::config::BLANK_LOCATION_CONTAINS;

pub mod mem;
mod nor;
mod paged;
mod translate;

pub use translate::{AddressTranslation, LogicalRegion};
use translate::AddressMap;

/// Number of storage devices on the memory board.
pub const DEVICE_COUNT: usize = 3;

/// Identifies one of the storage devices on the memory board.
///
/// The discriminants are indices into the physical arrangement table, and
/// the table rows must appear in this order (checked at initialisation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Device {
    /// Word-addressable parallel NOR flash (the main recording memory).
    MainFlash = 0,
    /// Byte-addressable SPI serial flash.
    SerialFlash = 1,
    /// Byte-addressable I2C EEPROM.
    I2cEeprom = 2,
}

impl Device {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Device> {
        match index {
            0 => Some(Device::MainFlash),
            1 => Some(Device::SerialFlash),
            2 => Some(Device::I2cEeprom),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::MainFlash => write!(f, "main flash"),
            Device::SerialFlash => write!(f, "serial flash"),
            Device::I2cEeprom => write!(f, "I2C EEPROM"),
        }
    }
}

/// Errors reported by the device drivers themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// The device reported a program / erase failure or poll timeout.
    WriteFail,
    /// The operation fell outside the device's address range.
    OutOfRange,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::WriteFail => write!(f, "device write failed"),
            DeviceFault::OutOfRange => write!(f, "address outside device"),
        }
    }
}

/// Errors reported by the HAL's logical-address operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashHalError {
    /// The logical address could not be mapped: the HAL is not initialised,
    /// the address lies in no partition, the operation runs past the end of
    /// the device, or the access granularity rules were violated.
    InvalidAddress,
    /// The underlying device reported a failure.
    WriteFail,
}

impl fmt::Display for FlashHalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashHalError::InvalidAddress => write!(f, "invalid logical address"),
            FlashHalError::WriteFail => write!(f, "flash write failed"),
        }
    }
}

impl From<DeviceFault> for FlashHalError {
    fn from(fault: DeviceFault) -> Self {
        match fault {
            DeviceFault::WriteFail => FlashHalError::WriteFail,
            DeviceFault::OutOfRange => FlashHalError::InvalidAddress,
        }
    }
}

/// Errors from [`FlashHal::initialise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalInitError {
    /// The physical arrangement rows are not in device-enum order, which
    /// indicates a mis-ordered build-time configuration.
    MisorderedArrangement,
    /// The logical regions do not fit in the named device.
    DeviceExhausted(Device),
    /// `initialise` was called twice.
    AlreadyInitialised,
}

impl fmt::Display for HalInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalInitError::MisorderedArrangement => {
                write!(f, "physical arrangement rows out of order")
            }
            HalInitError::DeviceExhausted(device) => {
                write!(f, "logical map exceeds the end of the {}", device)
            }
            HalInitError::AlreadyInitialised => write!(f, "flash HAL already initialised"),
        }
    }
}

/// Driver capability for the word-addressable parallel NOR flash.
///
/// All addresses are 16-bit word addresses into the device's own space.
pub trait WordDevice: Send + Sync {
    /// Read a single 16-bit word.
    fn read_word(&self, word_addr: u32) -> Result<u16, DeviceFault>;

    /// Program consecutive words starting at `word_addr`. NOR programming
    /// can only clear bits; the caller erases first.
    fn program_words(&self, word_addr: u32, words: &[u16]) -> Result<(), DeviceFault>;

    /// Erase the sector containing `word_addr` (which must be the first
    /// word of the sector).
    fn erase_sector(&self, word_addr: u32) -> Result<(), DeviceFault>;

    /// Hardware blank check of the sector starting at `word_addr`.
    fn sector_blank_check(&self, word_addr: u32) -> bool;

    /// Break a stuck program/erase poll. Called from a timer tick.
    fn force_timeout(&self);
}

/// Driver capability for the byte-addressable serial parts (SPI flash and
/// I2C EEPROM). Addresses are byte addresses into the device's own space.
pub trait ByteDevice: Send + Sync {
    fn block_read(&self, addr: u32, out: &mut [u8]) -> Result<(), DeviceFault>;

    fn block_write(&self, addr: u32, data: &[u8]) -> Result<(), DeviceFault>;

    /// Break a stuck write poll. Called from a timer tick.
    fn force_timeout(&self);
}

/// One row of the physical arrangement table: where a device sits in its
/// own physical address space and the smallest unit it can erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalArrangement {
    pub device: Device,
    /// First physical byte address on the device.
    pub start_address: u32,
    /// Last physical byte address on the device.
    pub end_address: u32,
    /// Minimum erasable unit in bytes (the sector size on the NOR flash;
    /// 1 for the serial parts, whose erase is emulated).
    pub block_size_bytes: u32,
}

/// The set of drivers for the board, indexed by [`Device`].
///
/// Built once by the integrating firmware and handed to
/// [`crate::system::RecordingSystem::new`].
pub struct DeviceRegistry {
    main_flash: Box<dyn WordDevice>,
    serial_flash: Box<dyn ByteDevice>,
    /// Write-page size of the serial flash (chunk unit for emulated erase).
    serial_flash_page: u32,
    eeprom: Box<dyn ByteDevice>,
    /// Write-page size of the EEPROM.
    eeprom_page: u32,
    physical: [PhysicalArrangement; DEVICE_COUNT],
}

impl DeviceRegistry {
    pub fn new(
        main_flash: Box<dyn WordDevice>,
        serial_flash: Box<dyn ByteDevice>,
        serial_flash_page: u32,
        eeprom: Box<dyn ByteDevice>,
        eeprom_page: u32,
        physical: [PhysicalArrangement; DEVICE_COUNT],
    ) -> Self {
        DeviceRegistry {
            main_flash,
            serial_flash,
            serial_flash_page,
            eeprom,
            eeprom_page,
            physical,
        }
    }
}

/// Sentinel for "no write in progress" in the current-device tag.
const NO_WRITE_DEVICE: u8 = 0xFF;

/// Uniform logical-byte-address access to the three storage devices.
///
/// The logical address space is assembled from the partition layout at
/// initialisation; every partition occupies a contiguous logical range
/// backed by a contiguous physical range in exactly one device. Until
/// [`initialise`](FlashHal::initialise) succeeds, every operation other
/// than [`block_size_bytes`](FlashHal::block_size_bytes) fails with
/// [`FlashHalError::InvalidAddress`].
pub struct FlashHal {
    registry: DeviceRegistry,
    map: OnceCell<AddressMap>,
    /// Device currently being programmed, consulted by the write-timeout
    /// tick so it can unstick the right driver.
    writing_device: AtomicU8,
}

impl FlashHal {
    pub fn new(registry: DeviceRegistry) -> Self {
        FlashHal {
            registry,
            map: OnceCell::uninit(),
            writing_device: AtomicU8::new(NO_WRITE_DEVICE),
        }
    }

    /// Block (minimum erase) size of a device, in bytes.
    ///
    /// This is the only operation valid before [`initialise`]: the
    /// partition layout needs the block sizes to compute the logical
    /// regions which initialisation then consumes.
    ///
    /// [`initialise`]: FlashHal::initialise
    pub fn block_size_bytes(&self, device: Device) -> u32 {
        self.registry.physical[device.index()].block_size_bytes
    }

    /// Build the logical-to-physical address map.
    ///
    /// `regions` holds one row per partition, in partition order. Fails if
    /// the physical arrangement table is mis-ordered or a device runs out
    /// of physical space; in both cases the HAL stays uninitialised.
    pub fn initialise(&self, regions: &[LogicalRegion]) -> Result<(), HalInitError> {
        for (index, row) in self.registry.physical.iter().enumerate() {
            if row.device.index() != index {
                return Err(HalInitError::MisorderedArrangement);
            }
        }

        let map = AddressMap::build(regions, &self.registry.physical)?;
        self.map
            .try_init_once(|| map)
            .map_err(|_| HalInitError::AlreadyInitialised)?;

        log::info!("flash HAL initialised: {} regions mapped", regions.len());
        Ok(())
    }

    fn translate(&self, logical: u32, bytes: u32) -> Result<(Device, u32), FlashHalError> {
        let map = self
            .map
            .try_get()
            .map_err(|_| FlashHalError::InvalidAddress)?;
        map.translate(logical, bytes, &self.registry.physical)
    }

    /// Read `out.len()` bytes starting at a logical byte address.
    pub fn read(&self, logical: u32, out: &mut [u8]) -> Result<(), FlashHalError> {
        let len = out.len() as u32;
        let (device, physical) = self.translate(logical, len)?;
        match device {
            Device::MainFlash => {
                // Word device: whole words at even addresses only.
                if logical & 1 != 0 || len & 1 != 0 {
                    return Err(FlashHalError::InvalidAddress);
                }
                nor::read(self.registry.main_flash.as_ref(), physical, out)?;
            }
            Device::SerialFlash => {
                self.registry.serial_flash.block_read(physical, out)?;
            }
            Device::I2cEeprom => {
                self.registry.eeprom.block_read(physical, out)?;
            }
        }
        Ok(())
    }

    /// Program `data` starting at a logical byte address.
    pub fn write(&self, logical: u32, data: &[u8]) -> Result<(), FlashHalError> {
        let len = data.len() as u32;
        let (device, physical) = self.translate(logical, len)?;
        if device == Device::MainFlash && (logical & 1 != 0 || len & 1 != 0) {
            return Err(FlashHalError::InvalidAddress);
        }
        self.writing_device
            .store(device as u8, Ordering::SeqCst);
        let result = match device {
            Device::MainFlash => nor::write(self.registry.main_flash.as_ref(), physical, data),
            Device::SerialFlash => self.registry.serial_flash.block_write(physical, data),
            Device::I2cEeprom => self.registry.eeprom.block_write(physical, data),
        };
        self.writing_device
            .store(NO_WRITE_DEVICE, Ordering::SeqCst);
        result.map_err(FlashHalError::from)
    }

    /// Erase a whole number of device blocks starting at a logical address.
    ///
    /// The physical start must sit on a block boundary and the length must
    /// be a multiple of the block size; anything else is rejected.
    pub fn erase(&self, logical: u32, bytes: u32) -> Result<(), FlashHalError> {
        let (device, physical) = self.translate(logical, bytes)?;
        let row = &self.registry.physical[device.index()];

        let sector_offset = (physical - row.start_address) % row.block_size_bytes;
        let sector_remainder = bytes % row.block_size_bytes;
        if sector_offset != 0 || sector_remainder != 0 {
            return Err(FlashHalError::InvalidAddress);
        }

        let result = match device {
            Device::MainFlash => {
                nor::erase(self.registry.main_flash.as_ref(), row, physical, bytes)
            }
            Device::SerialFlash => paged::erase(
                self.registry.serial_flash.as_ref(),
                self.registry.serial_flash_page,
                physical,
                bytes,
            ),
            Device::I2cEeprom => paged::erase(
                self.registry.eeprom.as_ref(),
                self.registry.eeprom_page,
                physical,
                bytes,
            ),
        };
        result.map_err(FlashHalError::from)
    }

    /// Check that a logical range reads back entirely blank.
    ///
    /// Returns `false` for unmappable addresses or device errors as well as
    /// for genuinely non-blank data; callers that must distinguish use
    /// [`read`](FlashHal::read).
    pub fn blank_check(&self, logical: u32, bytes: u32) -> bool {
        let (device, physical) = match self.translate(logical, bytes) {
            Ok(mapping) => mapping,
            Err(_) => return false,
        };
        match device {
            Device::MainFlash => {
                if logical & 1 != 0 || bytes & 1 != 0 {
                    return false;
                }
                let row = &self.registry.physical[Device::MainFlash.index()];
                nor::blank_check(self.registry.main_flash.as_ref(), row, physical, bytes)
            }
            Device::SerialFlash => paged::blank_check(
                self.registry.serial_flash.as_ref(),
                self.registry.serial_flash_page,
                physical,
                bytes,
            ),
            Device::I2cEeprom => paged::blank_check(
                self.registry.eeprom.as_ref(),
                self.registry.eeprom_page,
                physical,
                bytes,
            ),
        }
    }

    /// Timer-tick entry point: unstick whichever driver is mid-write.
    pub fn force_write_timeout(&self) {
        match Device::from_index(self.writing_device.load(Ordering::SeqCst) as usize) {
            Some(Device::MainFlash) => self.registry.main_flash.force_timeout(),
            Some(Device::SerialFlash) => self.registry.serial_flash.force_timeout(),
            Some(Device::I2cEeprom) => self.registry.eeprom.force_timeout(),
            None => {}
        }
    }

    /// Diagnostic view of one row of the address map.
    pub fn mapping(&self, partition_index: usize) -> Option<AddressTranslation> {
        self.map
            .try_get()
            .ok()
            .and_then(|map| map.row(partition_index))
    }
}

/// Scan a buffer for anything that is not the blank value.
pub(crate) fn buffer_is_blank(buffer: &[u8]) -> bool {
    buffer.iter().all(|&byte| byte == BLANK_LOCATION_CONTAINS)
}
