//! Request and completion types for the gatekeeper queues.
//!
//! A producer builds a request, hands it to one of the enqueue APIs on
//! [`super::RecordingSystem`], and gets back a shared handle carrying the
//! request's status word, its completion semaphore, and (for reads) the
//! result slot. The gatekeeper drives the status through
//! in-queue → in-progress → complete/failed and gives the semaphore only
//! on the terminal transitions.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::record::TdrBuffer;
use crate::search::Direction;
use crate::sync::Semaphore;

/// Lifecycle of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueStatus {
    /// Accepted and waiting in its queue.
    InQueue = 0,
    /// Pulled from the queue; the operation is running.
    InProgress = 1,
    /// The operation failed or was aborted.
    Failed = 2,
    /// The operation completed successfully.
    Complete = 3,
}

impl QueueStatus {
    fn from_u8(value: u8) -> QueueStatus {
        match value {
            0 => QueueStatus::InQueue,
            1 => QueueStatus::InProgress,
            2 => QueueStatus::Failed,
            _ => QueueStatus::Complete,
        }
    }

    /// Terminal states release the request's semaphore.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Failed | QueueStatus::Complete)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::InQueue => write!(f, "in queue"),
            QueueStatus::InProgress => write!(f, "in progress"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Why a request was refused at the enqueue API.
///
/// A constructed [`super::RecordingSystem`] is always initialised (the
/// constructor fails otherwise), so the "not initialised" rejection of
/// the original interface cannot occur and has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// No partition carries the given id.
    BadPartitionId,
    /// The target queue is at capacity.
    QueueFull,
    /// Write only: the TDR cannot legally be placed: empty or oversized,
    /// odd framed length on a word-addressable partition, or no fit in
    /// the partition's remaining space (including unformatted or full
    /// partitions).
    IncompatibleAlignment,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::BadPartitionId => write!(f, "bad partition id"),
            EnqueueError::QueueFull => write!(f, "queue full"),
            EnqueueError::IncompatibleAlignment => write!(f, "incompatible alignment"),
        }
    }
}

/// Identifies one of the gatekeeper's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    Read,
    Write,
    Format,
}

/// A request to locate a record and return its payload.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub partition_id: u8,
    pub direction: Direction,
    /// Zero-based instance of the matching record, counted in search
    /// order (so instance 0 backwards is the most recent record).
    pub record_instance: u32,
    /// When set, only records with `record_id` are counted.
    pub match_record_id: bool,
    pub record_id: u16,
}

/// A request to append one record.
#[derive(Debug)]
pub struct WriteRequest {
    pub partition_id: u8,
    pub record_id: u16,
    /// Caller-prepared payload with framing reservation.
    pub tdr: TdrBuffer,
    /// Read the programmed bytes back and verify them.
    pub read_back: bool,
}

/// A request to format (erase and re-initialise) a partition.
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest {
    pub partition_id: u8,
}

/// Payload delivered by a successful read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub record_id: u16,
    pub tdr: Vec<u8>,
    pub crc: u16,
}

/// Status word and completion semaphore shared between a producer and
/// the gatekeeper. Used directly by write and format requests.
#[derive(Debug)]
pub struct RequestHandle {
    status: AtomicU8,
    semaphore: Semaphore,
}

impl RequestHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RequestHandle {
            status: AtomicU8::new(QueueStatus::InQueue as u8),
            semaphore: Semaphore::new(),
        })
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Given once when the request reaches a terminal status.
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    pub(crate) fn set_status(&self, status: QueueStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
        if status.is_terminal() {
            self.semaphore.give();
        }
    }
}

/// [`RequestHandle`] plus the result slot filled by a successful read.
#[derive(Debug)]
pub struct ReadHandle {
    inner: RequestHandle,
    result: Mutex<Option<ReadResult>>,
}

impl ReadHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ReadHandle {
            inner: RequestHandle {
                status: AtomicU8::new(QueueStatus::InQueue as u8),
                semaphore: Semaphore::new(),
            },
            result: Mutex::new(None),
        })
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.status()
    }

    pub fn semaphore(&self) -> &Semaphore {
        self.inner.semaphore()
    }

    /// Take the payload of a completed read, leaving the slot empty.
    pub fn take_result(&self) -> Option<ReadResult> {
        self.result.lock().take()
    }

    pub(crate) fn set_status(&self, status: QueueStatus) {
        self.inner.set_status(status);
    }

    pub(crate) fn put_result(&self, result: ReadResult) {
        *self.result.lock() = Some(result);
    }
}

/// Read queue entry: the request plus the pre-resolved partition index.
pub(crate) struct QueuedRead {
    pub(crate) request: ReadRequest,
    pub(crate) partition_index: usize,
    pub(crate) handle: Arc<ReadHandle>,
}

pub(crate) struct QueuedWrite {
    pub(crate) request: WriteRequest,
    pub(crate) partition_index: usize,
    pub(crate) handle: Arc<RequestHandle>,
}

pub(crate) struct QueuedFormat {
    pub(crate) partition_id: u8,
    pub(crate) partition_index: usize,
    pub(crate) handle: Arc<RequestHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_signals_only_on_terminal_status() {
        let handle = RequestHandle::new();
        assert_eq!(handle.status(), QueueStatus::InQueue);
        assert_eq!(handle.semaphore().available(), 0);

        handle.set_status(QueueStatus::InProgress);
        assert_eq!(handle.semaphore().available(), 0, "no signal mid-flight");

        handle.set_status(QueueStatus::Complete);
        assert_eq!(handle.status(), QueueStatus::Complete);
        assert!(handle.semaphore().try_take(), "terminal status signals");
    }

    #[test]
    fn test_read_handle_result_round_trip() {
        let handle = ReadHandle::new();
        assert!(handle.take_result().is_none());

        handle.put_result(ReadResult {
            record_id: 7,
            tdr: alloc::vec![1, 2, 3],
            crc: 0xABCD,
        });
        handle.set_status(QueueStatus::Failed);

        let result = handle.take_result().expect("result stored");
        assert_eq!(result.record_id, 7);
        assert_eq!(result.tdr, [1, 2, 3]);
        assert!(handle.take_result().is_none(), "take drains the slot");
    }
}
