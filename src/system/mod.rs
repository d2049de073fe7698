//! The recording system: construction, the enqueue APIs, and queries.
//!
//! [`RecordingSystem`] owns everything: the flash HAL, the partition
//! table, the search engine's scratch buffer, and the gatekeeper state
//! machine with its three bounded request queues. Construction performs
//! the whole power-up sequence (partition layout, HAL address map,
//! per-partition cursor recovery), so a value of this type is always
//! initialised and ready to queue requests.
//!
//! Producers call the enqueue APIs from any context; all device access
//! happens inside [`tick`](RecordingSystem::tick), which the host
//! scheduler calls periodically from a single task.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crossbeam_queue::ArrayQueue;
use spin::{Mutex, RwLock};

use crate::config::{
    BOARD_TYPE, CODE_VERSION, FORMAT_QUEUE_LENGTH, MAX_TDR_SIZE_BYTES, PAGE_SIZE_KB,
    READ_QUEUE_LENGTH, SPEC_LEVEL, WRITE_QUEUE_LENGTH,
};
use crate::hal::{Device, DeviceRegistry, FlashHal, HalInitError};
use crate::pages::{self, PageError, PageStatus};
use crate::partition::{LayoutError, PartitionConfig, PartitionHealth, PartitionInfo, PartitionTable};
use crate::search::{Direction, SearchEngine};
use crate::sync::{CancelToken, Semaphore};

mod gatekeeper;
mod request;

pub use request::{
    EnqueueError, FormatRequest, QueueId, QueueStatus, ReadHandle, ReadRequest, ReadResult,
    RequestHandle, WriteRequest,
};

use gatekeeper::{ActiveRead, ActiveWrite, GateState};
use request::{QueuedFormat, QueuedRead, QueuedWrite};

/// Identity and page totals of the recording system, fixed at power-up.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub spec_level: u16,
    pub code_version: u16,
    pub board_type: u16,
    pub number_of_partitions: u16,
    pub page_size_kb: u16,
    /// Pages across all partitions.
    pub total_pages: u32,
    /// Pages that recovery found usable (free or cleanly full).
    pub accessible_pages: u32,
    /// Pages with a corrupted header.
    pub unusable_pages: u32,
    /// Pages with a flagged error.
    pub error_pages: u32,
}

/// Errors from [`RecordingSystem::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    Layout(LayoutError),
    Hal(HalInitError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Layout(error) => write!(f, "partition layout: {}", error),
            InitError::Hal(error) => write!(f, "address mapping: {}", error),
        }
    }
}

impl From<LayoutError> for InitError {
    fn from(error: LayoutError) -> Self {
        InitError::Layout(error)
    }
}

impl From<HalInitError> for InitError {
    fn from(error: HalInitError) -> Self {
        InitError::Hal(error)
    }
}

/// The recording system.
pub struct RecordingSystem {
    pub(crate) configuration: Configuration,
    pub(crate) hal: FlashHal,
    pub(crate) partitions: RwLock<PartitionTable>,
    pub(crate) search: SearchEngine,

    pub(crate) state: GateState,
    pub(crate) active_read: Option<ActiveRead>,
    pub(crate) active_write: Option<ActiveWrite>,

    pub(crate) read_queue: ArrayQueue<QueuedRead>,
    pub(crate) write_queue: ArrayQueue<QueuedWrite>,
    pub(crate) format_queue: ArrayQueue<QueuedFormat>,

    pub(crate) task_enabled: AtomicBool,
    pub(crate) disable_requested: AtomicBool,
    pub(crate) disable_semaphore: Mutex<Option<Arc<Semaphore>>>,

    pub(crate) format_progress: AtomicU8,
}

impl RecordingSystem {
    /// Bring the recording system up.
    ///
    /// Lays the partitions out over the devices, builds the HAL address
    /// map (with its arrangement sanity check), and recovers every
    /// partition's write cursor by bisection. A partition that has never
    /// been formatted does not fail construction; it is reported through
    /// [`partition_status`](RecordingSystem::partition_status) until a
    /// format request succeeds.
    pub fn new(
        registry: DeviceRegistry,
        partitions: &[PartitionConfig],
    ) -> Result<RecordingSystem, InitError> {
        let hal = FlashHal::new(registry);
        let mut table = PartitionTable::from_configs(partitions, &hal)?;
        hal.initialise(&table.logical_regions())?;

        let mut configuration = Configuration {
            spec_level: SPEC_LEVEL,
            code_version: CODE_VERSION,
            board_type: BOARD_TYPE,
            number_of_partitions: table.len() as u16,
            page_size_kb: PAGE_SIZE_KB as u16,
            total_pages: 0,
            accessible_pages: 0,
            unusable_pages: 0,
            error_pages: 0,
        };

        for index in 0..table.len() {
            let ready = table.bisection_search(index, &hal);
            let partition = table.get(index).expect("index in range");

            configuration.total_pages += partition.pages;
            configuration.accessible_pages += partition.free_pages + partition.full_pages;
            configuration.unusable_pages += partition.unusable_pages;
            configuration.error_pages += partition.error_pages;

            if ready {
                log::info!(
                    "partition {}: {} pages, cursor {:#010x}",
                    partition.id,
                    partition.pages,
                    partition.next_available_address.unwrap_or(0)
                );
            } else {
                log::warn!("partition {}: {}", partition.id, partition.health);
            }
        }

        Ok(RecordingSystem {
            configuration,
            hal,
            partitions: RwLock::new(table),
            search: SearchEngine::new(),
            state: GateState::IdleReadCheck,
            active_read: None,
            active_write: None,
            read_queue: ArrayQueue::new(READ_QUEUE_LENGTH),
            write_queue: ArrayQueue::new(WRITE_QUEUE_LENGTH),
            format_queue: ArrayQueue::new(FORMAT_QUEUE_LENGTH),
            task_enabled: AtomicBool::new(false),
            disable_requested: AtomicBool::new(false),
            disable_semaphore: Mutex::new(None),
            format_progress: AtomicU8::new(0),
        })
    }

    /// Snapshot of the configuration block.
    pub fn configuration(&self) -> Configuration {
        self.configuration
    }

    /// Health of a partition, by id.
    pub fn partition_status(&self, partition_id: u8) -> Result<PartitionHealth, EnqueueError> {
        let table = self.partitions.read();
        let index = table
            .index_of(partition_id)
            .ok_or(EnqueueError::BadPartitionId)?;
        Ok(table.get(index).expect("index in range").health)
    }

    /// Diagnostics snapshot of a partition (bounds, cursor, counters).
    pub fn partition(&self, partition_id: u8) -> Option<PartitionInfo> {
        let table = self.partitions.read();
        let index = table.index_of(partition_id)?;
        table.get(index).cloned()
    }

    /// Diagnostic cross-check of one page's header against its contents.
    pub fn page_status(&self, partition_id: u8, page_number: u32) -> Result<PageStatus, PageError> {
        let (start, end) = {
            let table = self.partitions.read();
            let index = table
                .index_of(partition_id)
                .ok_or(PageError::InvalidPartition)?;
            let partition = table.get(index).expect("index in range");
            (partition.start_address, partition.end_address)
        };
        pages::page_status(&self.hal, start, end, partition_id, page_number)
    }

    /// Queue a record search. The result arrives through the returned
    /// handle once the gatekeeper has run the search.
    pub fn read_request(&self, request: ReadRequest) -> Result<Arc<ReadHandle>, EnqueueError> {
        let partition_index = self
            .partitions
            .read()
            .index_of(request.partition_id)
            .ok_or(EnqueueError::BadPartitionId)?;

        let handle = ReadHandle::new();
        self.read_queue
            .push(QueuedRead {
                request,
                partition_index,
                handle: handle.clone(),
            })
            .map_err(|_| {
                log::warn!("read queue full; rejecting request");
                EnqueueError::QueueFull
            })?;
        Ok(handle)
    }

    /// Queue a record append.
    ///
    /// Placement is validated here, before anything touches flash: the
    /// TDR must be non-empty and within size, the framed record must have
    /// an even length when the partition lives on the word-addressable
    /// flash, and it must fit in the partition's remaining space.
    pub fn write_request(&self, request: WriteRequest) -> Result<Arc<RequestHandle>, EnqueueError> {
        let table = self.partitions.read();
        let partition_index = table
            .index_of(request.partition_id)
            .ok_or(EnqueueError::BadPartitionId)?;
        let partition = table.get(partition_index).expect("index in range");

        let tdr_len = request.tdr.tdr_len();
        if tdr_len == 0 || tdr_len > MAX_TDR_SIZE_BYTES {
            return Err(EnqueueError::IncompatibleAlignment);
        }

        let framed_len = request.tdr.framed_len() as u32;
        if partition.device == Device::MainFlash && framed_len % 2 != 0 {
            return Err(EnqueueError::IncompatibleAlignment);
        }

        // The fine-grained page fit check happens at write time; here the
        // record must at least fit in what is left of the partition.
        let cursor = match partition.next_available_address {
            Some(cursor) => cursor,
            None => return Err(EnqueueError::IncompatibleAlignment),
        };
        let remaining = partition.end_address + 1 - cursor;
        if framed_len > remaining {
            return Err(EnqueueError::IncompatibleAlignment);
        }
        drop(table);

        let handle = RequestHandle::new();
        self.write_queue
            .push(QueuedWrite {
                request,
                partition_index,
                handle: handle.clone(),
            })
            .map_err(|_| {
                log::warn!("write queue full; rejecting request");
                EnqueueError::QueueFull
            })?;
        Ok(handle)
    }

    /// Queue a partition format.
    pub fn format_request(&self, request: FormatRequest) -> Result<Arc<RequestHandle>, EnqueueError> {
        let partition_index = self
            .partitions
            .read()
            .index_of(request.partition_id)
            .ok_or(EnqueueError::BadPartitionId)?;

        let handle = RequestHandle::new();
        self.format_queue
            .push(QueuedFormat {
                partition_id: request.partition_id,
                partition_index,
                handle: handle.clone(),
            })
            .map_err(|_| EnqueueError::QueueFull)?;
        Ok(handle)
    }

    /// Progress of the most recent format, 0..=100.
    pub fn format_progress(&self) -> u8 {
        self.format_progress.load(Ordering::Relaxed)
    }

    /// Number of requests waiting in a queue.
    pub fn queue_depth(&self, queue: QueueId) -> usize {
        match queue {
            QueueId::Read => self.read_queue.len(),
            QueueId::Write => self.write_queue.len(),
            QueueId::Format => self.format_queue.len(),
        }
    }

    /// Allow the gatekeeper to process requests.
    pub fn task_enable(&self) {
        self.task_enabled.store(true, Ordering::SeqCst);
    }

    pub fn task_enabled(&self) -> bool {
        self.task_enabled.load(Ordering::SeqCst)
    }

    /// Ask the gatekeeper to stop. The stop takes effect at the next idle
    /// state (an in-flight operation always finishes first) and the
    /// semaphore, when given, is signalled once the worker is stopped.
    pub fn request_task_disable(&self, semaphore: Option<Arc<Semaphore>>) {
        if !self.task_enabled() {
            if let Some(semaphore) = semaphore {
                semaphore.give();
            }
            return;
        }
        *self.disable_semaphore.lock() = semaphore;
        self.disable_requested.store(true, Ordering::SeqCst);
    }

    /// Token that aborts the in-flight (or next) record search; the
    /// read-timeout timer holds a clone and cancels it on expiry.
    pub fn search_cancel_token(&self) -> CancelToken {
        self.search.cancel_token()
    }

    /// Timer-tick entry point for the read timeout.
    pub fn trigger_search_timeout(&self) {
        self.search.cancel_token().cancel();
    }

    /// Timer-tick entry point for the write timeout: unsticks whichever
    /// device driver is mid-program.
    pub fn force_write_timeout(&self) {
        self.hal.force_write_timeout();
    }

    /// Forward search starts at the partition's first address; backward
    /// search starts at the cursor, so instance 0 is the newest record.
    pub(crate) fn search_start_for(
        partition: &PartitionInfo,
        direction: Direction,
    ) -> Option<u32> {
        match direction {
            Direction::Forwards => Some(partition.start_address),
            Direction::Backwards => partition.next_available_address,
        }
    }
}
