//! Deployment constants for the recording system.
//!
//! These values are fixed per memory-board build. The partition table and
//! the physical arrangement of the storage devices are runtime inputs to
//! [`crate::system::RecordingSystem::new`] so that each board variant (and
//! the test-suite) can describe its own hardware.

/// Page size in kilobytes. Must be large enough that a maximum-size TDR
/// never spans more than two pages.
pub const PAGE_SIZE_KB: u32 = 8;

/// Page size in bytes.
pub const PAGE_SIZE_BYTES: u32 = PAGE_SIZE_KB * 1024;

/// Largest TDR payload accepted by a write request.
pub const MAX_TDR_SIZE_BYTES: usize = 1024;

/// Upper bound on the number of partitions (partition ids are 8-bit).
pub const MAX_NUMBER_OF_PARTITIONS: usize = 255;

/// Value read back from an unprogrammed location on every device.
pub const BLANK_LOCATION_CONTAINS: u8 = 0xFF;

/// Chunk size for local read buffers (blank scanning, read-back verify).
pub const LOCAL_BLOCK_READ_SIZE: usize = 256;

/// Depth of the read request queue.
pub const READ_QUEUE_LENGTH: usize = 4;

/// Depth of the write request queue.
pub const WRITE_QUEUE_LENGTH: usize = 8;

/// Depth of the format request queue.
pub const FORMAT_QUEUE_LENGTH: usize = 2;

/// Gatekeeper tick period expected from the host scheduler, in ms.
pub const TASK_PERIODICITY_MS: u32 = 10;

/// Partition search timeout armed for each read request, in ms.
pub const READ_QUEUE_TIMEOUT_MS: u32 = 10_000;

/// Device write timeout armed for each write request, in ms.
pub const WRITE_QUEUE_TIMEOUT_MS: u32 = 2_000;

/// Recording system specification revision implemented by this build.
pub const SPEC_LEVEL: u16 = 0x00AA;

/// Software version word reported in the configuration block.
pub const CODE_VERSION: u16 = 0x0101;

/// Identity of the memory board this build targets.
pub const BOARD_TYPE: u16 = 0x0001;

// The search algorithms assume a record never spans more than two pages,
// which holds as long as a page can contain any single TDR.
const _: () = assert!(PAGE_SIZE_BYTES as usize >= MAX_TDR_SIZE_BYTES);
const _: () = assert!(MAX_TDR_SIZE_BYTES <= u16::MAX as usize);
