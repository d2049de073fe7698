//! Log-structured recording system for heterogeneous non-volatile storage.
//!
//! `flashlog` persists a stream of variable-length Tool Data Records (TDRs)
//! into fixed logical partitions mapped across several physical storage
//! devices with different erase-block sizes and access granularities
//! (a word-addressable parallel NOR flash, a byte-addressable SPI serial
//! flash, and a byte-addressable I2C EEPROM).
//!
//! Records are framed on flash as Recording System Records (RSRs):
//!
//! ```text
//! SYNC(0xE1) | ID (LE) | LEN (LE) | TDR bytes | CRC (BE) | ENDSYNC(0x1A)
//! ```
//!
//! There is no filesystem metadata: after a power loss the per-partition
//! write cursor is recovered by a page-level bisection over blank checks
//! followed by a linear scan of the boundary page. All device access is
//! serialised through a single cooperative worker (the gatekeeper), which
//! other tasks feed through bounded request queues.
//!
//! The crate is `no_std` + `alloc`; unit tests run on the host. Device
//! drivers are supplied by the integrating firmware through the capability
//! traits in [`hal`]; RAM-backed reference devices for bring-up and tests
//! live in [`hal::mem`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod crc;
pub mod hal;
pub mod pages;
pub mod partition;
pub mod record;
pub mod search;
pub mod sync;
pub mod system;

pub use hal::{
    ByteDevice, Device, DeviceFault, DeviceRegistry, FlashHal, FlashHalError,
    PhysicalArrangement, WordDevice,
};
pub use partition::{PartitionConfig, PartitionHealth};
pub use record::TdrBuffer;
pub use search::Direction;
pub use system::{
    Configuration, EnqueueError, FormatRequest, InitError, QueueId, QueueStatus, ReadRequest,
    ReadResult, RecordingSystem, WriteRequest,
};
