//! The gatekeeper: a tick-driven state machine serialising all device
//! access.
//!
//! The host scheduler calls [`RecordingSystem::tick`] periodically from a
//! single task. Each idle tick inspects exactly one queue, rotating
//! read → write → format so sustained traffic on one queue cannot starve
//! the others; a pulled request then walks through its required /
//! in-progress states on subsequent ticks. At most one device operation
//! is ever in flight.
//!
//! A disable request is honoured only at the idle states, so an operation
//! that has started always runs to completion before the worker stops.

use crate::pages::{self, PageWrite};
use crate::search::SearchParams;
use crate::system::request::{QueuedFormat, QueuedRead, QueuedWrite, QueueStatus, ReadResult};
use crate::system::RecordingSystem;

/// States of the gatekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateState {
    IdleReadCheck,
    IdleWriteCheck,
    IdleFormatCheck,
    ReadRequired,
    ReadInProgress,
    WriteRequired,
    WriteInProgress,
}

/// A read pulled from its queue, with the search parameters once the
/// required-state tick has derived them.
pub(crate) struct ActiveRead {
    pub(crate) item: QueuedRead,
    pub(crate) params: Option<SearchParams>,
}

/// A write pulled from its queue, with the placement derived by the
/// required-state tick.
pub(crate) struct ActiveWrite {
    pub(crate) item: QueuedWrite,
    pub(crate) plan: Option<WritePlan>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WritePlan {
    pub(crate) partition_id: u8,
    pub(crate) partition_start: u32,
    pub(crate) partition_end: u32,
    pub(crate) next_free_addr: u32,
}

impl RecordingSystem {
    /// Run one step of the gatekeeper state machine.
    pub fn tick(&mut self) {
        if !self.task_enabled() {
            return;
        }

        match self.state {
            GateState::IdleReadCheck => {
                if self.stop_if_disable_requested() {
                    return;
                }
                match self.read_queue.pop() {
                    Some(item) => {
                        item.handle.set_status(QueueStatus::InProgress);
                        self.active_read = Some(ActiveRead { item, params: None });
                        self.state = GateState::ReadRequired;
                    }
                    None => self.state = GateState::IdleWriteCheck,
                }
            }

            GateState::IdleWriteCheck => {
                if self.stop_if_disable_requested() {
                    return;
                }
                match self.write_queue.pop() {
                    Some(item) => {
                        item.handle.set_status(QueueStatus::InProgress);
                        self.active_write = Some(ActiveWrite { item, plan: None });
                        self.state = GateState::WriteRequired;
                    }
                    None => self.state = GateState::IdleFormatCheck,
                }
            }

            GateState::IdleFormatCheck => {
                if self.stop_if_disable_requested() {
                    return;
                }
                if let Some(item) = self.format_queue.pop() {
                    self.run_format(item);
                }
                self.state = GateState::IdleReadCheck;
            }

            GateState::ReadRequired => self.read_required(),
            GateState::ReadInProgress => self.read_in_progress(),
            GateState::WriteRequired => self.write_required(),
            GateState::WriteInProgress => self.write_in_progress(),
        }
    }

    fn stop_if_disable_requested(&mut self) -> bool {
        use core::sync::atomic::Ordering;

        if self.disable_requested.swap(false, Ordering::SeqCst) {
            self.task_enabled.store(false, Ordering::SeqCst);
            if let Some(semaphore) = self.disable_semaphore.lock().take() {
                semaphore.give();
            }
            log::info!("recording task stopped");
            return true;
        }
        false
    }

    /// Derive the search parameters for the pulled read request.
    fn read_required(&mut self) {
        let active = match self.active_read.as_mut() {
            Some(active) => active,
            None => {
                self.state = GateState::IdleWriteCheck;
                return;
            }
        };

        let snapshot = {
            let table = self.partitions.read();
            table.get(active.item.partition_index).cloned()
        };

        let params = snapshot.and_then(|partition| {
            let search_start =
                Self::search_start_for(&partition, active.item.request.direction)?;
            Some(SearchParams {
                direction: active.item.request.direction,
                partition_start: partition.start_address,
                partition_end: partition.end_address,
                search_start,
                record_instance: active.item.request.record_instance,
                match_record_id: active.item.request.match_record_id,
                record_id: active.item.request.record_id,
            })
        });

        match params {
            Some(params) => {
                active.params = Some(params);
                self.state = GateState::ReadInProgress;
            }
            None => {
                // No usable cursor (unformatted or unreadable partition).
                let active = self.active_read.take().expect("checked above");
                active.item.handle.set_status(QueueStatus::Failed);
                self.state = GateState::IdleWriteCheck;
            }
        }
    }

    /// Run the search to completion (or cancellation) and deliver the
    /// result.
    fn read_in_progress(&mut self) {
        let active = match self.active_read.take() {
            Some(active) => active,
            None => {
                self.state = GateState::IdleWriteCheck;
                return;
            }
        };
        let params = match active.params {
            Some(params) => params,
            None => {
                active.item.handle.set_status(QueueStatus::Failed);
                self.state = GateState::IdleWriteCheck;
                return;
            }
        };

        let found = self.search.find_record(&self.hal, &params);

        if found {
            let hit = self.search.hit().expect("hit present after success");
            let tdr = self
                .search
                .hit_tdr()
                .expect("payload present after success")
                .to_vec();
            active.item.handle.put_result(ReadResult {
                record_id: hit.record_id,
                tdr,
                crc: hit.crc,
            });
            active.item.handle.set_status(QueueStatus::Complete);
        } else {
            active.item.handle.set_status(QueueStatus::Failed);
        }

        self.state = GateState::IdleWriteCheck;
    }

    /// Derive the placement for the pulled write request.
    fn write_required(&mut self) {
        let active = match self.active_write.as_mut() {
            Some(active) => active,
            None => {
                self.state = GateState::IdleFormatCheck;
                return;
            }
        };

        let plan = {
            let table = self.partitions.read();
            table
                .get(active.item.partition_index)
                .and_then(|partition| {
                    Some(WritePlan {
                        partition_id: partition.id,
                        partition_start: partition.start_address,
                        partition_end: partition.end_address,
                        next_free_addr: partition.next_available_address?,
                    })
                })
        };

        match plan {
            Some(plan) => {
                active.plan = Some(plan);
                self.state = GateState::WriteInProgress;
            }
            None => {
                let active = self.active_write.take().expect("checked above");
                active.item.handle.set_status(QueueStatus::Failed);
                self.state = GateState::IdleFormatCheck;
            }
        }
    }

    /// Append the record and deliver the outcome.
    fn write_in_progress(&mut self) {
        let active = match self.active_write.take() {
            Some(active) => active,
            None => {
                self.state = GateState::IdleFormatCheck;
                return;
            }
        };
        let plan = match active.plan {
            Some(plan) => plan,
            None => {
                active.item.handle.set_status(QueueStatus::Failed);
                self.state = GateState::IdleFormatCheck;
                return;
            }
        };

        let mut item = active.item;
        let result = {
            let mut table = self.partitions.write();
            pages::page_data_write(
                &self.hal,
                &mut table,
                PageWrite {
                    partition_index: item.partition_index,
                    partition_id: plan.partition_id,
                    partition_start: plan.partition_start,
                    partition_end: plan.partition_end,
                    next_free_addr: plan.next_free_addr,
                    record_id: item.request.record_id,
                    buffer: item.request.tdr.bytes_mut(),
                    read_back: item.request.read_back,
                },
            )
        };

        match result {
            Ok(_) => item.handle.set_status(QueueStatus::Complete),
            Err(error) => {
                log::error!(
                    "partition {}: record {:#06x} write failed: {}",
                    plan.partition_id,
                    item.request.record_id,
                    error
                );
                item.handle.set_status(QueueStatus::Failed);
            }
        }

        self.state = GateState::IdleFormatCheck;
    }

    /// Formats run to completion within one tick.
    fn run_format(&mut self, item: QueuedFormat) {
        item.handle.set_status(QueueStatus::InProgress);
        log::info!("partition {}: format started", item.partition_id);

        let result = {
            let mut table = self.partitions.write();
            table.format(item.partition_index, &self.hal, &self.format_progress)
        };

        match result {
            Ok(()) => {
                // Re-derive cursor, counters and health the same way the
                // power-up recovery does.
                let mut table = self.partitions.write();
                table.bisection_search(item.partition_index, &self.hal);
                drop(table);
                log::info!("partition {}: format complete", item.partition_id);
                item.handle.set_status(QueueStatus::Complete);
            }
            Err(error) => {
                log::error!("partition {}: format failed: {}", item.partition_id, error);
                item.handle.set_status(QueueStatus::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mem::{MemByteDevice, MemWordDevice};
    use crate::hal::{Device, DeviceRegistry, PhysicalArrangement, DEVICE_COUNT};
    use crate::partition::PartitionConfig;
    use crate::record::TdrBuffer;
    use crate::system::request::{EnqueueError, FormatRequest, ReadRequest, WriteRequest};
    use crate::search::Direction;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use crate::sync::Semaphore;

    fn arrangement() -> [PhysicalArrangement; DEVICE_COUNT] {
        [
            PhysicalArrangement {
                device: Device::MainFlash,
                start_address: 0,
                end_address: 0x3_FFFF,
                block_size_bytes: 0x2_0000,
            },
            PhysicalArrangement {
                device: Device::SerialFlash,
                start_address: 0,
                end_address: 0x1_FFFF,
                block_size_bytes: 1,
            },
            PhysicalArrangement {
                device: Device::I2cEeprom,
                start_address: 0,
                end_address: 0x7FFF,
                block_size_bytes: 1,
            },
        ]
    }

    // Helper kept trivial so each test reads as a scenario.
    fn run_ticks(system: &mut RecordingSystem, count: usize) {
        for _ in 0..count {
            system.tick();
        }
    }

    fn fresh_system() -> RecordingSystem {
        let physical = arrangement();
        let registry = DeviceRegistry::new(
            Box::new(MemWordDevice::new(physical[0])),
            Box::new(MemByteDevice::new(physical[1])),
            128,
            Box::new(MemByteDevice::new(physical[2])),
            32,
            physical,
        );
        RecordingSystem::new(
            registry,
            &[PartitionConfig {
                id: 11,
                pages: 4,
                device: Device::SerialFlash,
            }],
        )
        .expect("system constructs")
    }

    #[test]
    fn test_unformatted_partition_reports_needs_format() {
        let system = fresh_system();
        assert_eq!(
            system.partition_status(11),
            Ok(crate::partition::PartitionHealth::NeedsFormat)
        );
        assert_eq!(
            system.partition_status(99),
            Err(EnqueueError::BadPartitionId)
        );
    }

    #[test]
    fn test_write_to_unformatted_partition_is_rejected() {
        let system = fresh_system();
        let result = system.write_request(WriteRequest {
            partition_id: 11,
            record_id: 1,
            tdr: TdrBuffer::new(&[1, 2, 3]),
            read_back: false,
        });
        assert_eq!(result.err(), Some(EnqueueError::IncompatibleAlignment));
    }

    #[test]
    fn test_oversized_and_empty_tdrs_are_rejected() {
        let system = fresh_system();
        let oversized = alloc::vec![0u8; crate::config::MAX_TDR_SIZE_BYTES + 1];
        assert_eq!(
            system
                .write_request(WriteRequest {
                    partition_id: 11,
                    record_id: 1,
                    tdr: TdrBuffer::new(&oversized),
                    read_back: false,
                })
                .err(),
            Some(EnqueueError::IncompatibleAlignment)
        );
        assert_eq!(
            system
                .write_request(WriteRequest {
                    partition_id: 11,
                    record_id: 1,
                    tdr: TdrBuffer::new(&[]),
                    read_back: false,
                })
                .err(),
            Some(EnqueueError::IncompatibleAlignment)
        );
    }

    #[test]
    fn test_ticks_do_nothing_until_enabled() {
        let mut system = fresh_system();
        let handle = system
            .format_request(FormatRequest { partition_id: 11 })
            .expect("enqueue");
        run_ticks(&mut system, 10);
        assert_eq!(handle.status(), QueueStatus::InQueue, "task is disabled");

        system.task_enable();
        run_ticks(&mut system, 10);
        assert_eq!(handle.status(), QueueStatus::Complete);
    }

    #[test]
    fn test_format_then_write_then_read_round_trip() {
        let mut system = fresh_system();
        system.task_enable();

        let format = system
            .format_request(FormatRequest { partition_id: 11 })
            .expect("format enqueues");
        run_ticks(&mut system, 10);
        assert_eq!(format.status(), QueueStatus::Complete);
        assert_eq!(system.format_progress(), 100);
        assert!(format.semaphore().try_take(), "completion signalled");

        let write = system
            .write_request(WriteRequest {
                partition_id: 11,
                record_id: 0x0042,
                tdr: TdrBuffer::new(&[0xAA, 0xBB, 0xCC]),
                read_back: true,
            })
            .expect("write enqueues");
        run_ticks(&mut system, 10);
        assert_eq!(write.status(), QueueStatus::Complete);

        let read = system
            .read_request(ReadRequest {
                partition_id: 11,
                direction: Direction::Backwards,
                record_instance: 0,
                match_record_id: true,
                record_id: 0x0042,
            })
            .expect("read enqueues");
        run_ticks(&mut system, 10);
        assert_eq!(read.status(), QueueStatus::Complete);
        let result = read.take_result().expect("result delivered");
        assert_eq!(result.record_id, 0x0042);
        assert_eq!(result.tdr, [0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_read_queue_capacity_is_enforced() {
        let system = fresh_system();
        let request = ReadRequest {
            partition_id: 11,
            direction: Direction::Forwards,
            record_instance: 0,
            match_record_id: false,
            record_id: 0,
        };
        for _ in 0..crate::config::READ_QUEUE_LENGTH {
            system.read_request(request).expect("queue has room");
        }
        assert_eq!(
            system.read_request(request).err(),
            Some(EnqueueError::QueueFull)
        );
    }

    #[test]
    fn test_disable_takes_effect_at_idle_and_signals() {
        let mut system = fresh_system();
        system.task_enable();

        let semaphore = Arc::new(Semaphore::new());
        system.request_task_disable(Some(semaphore.clone()));

        system.tick();
        assert!(!system.task_enabled(), "disabled at the first idle state");
        assert!(semaphore.try_take(), "waiter signalled");

        // Disabling an already stopped task signals immediately.
        let again = Arc::new(Semaphore::new());
        system.request_task_disable(Some(again.clone()));
        assert!(again.try_take());
    }

    #[test]
    fn test_queue_depth_reporting() {
        let system = fresh_system();
        assert_eq!(system.queue_depth(crate::system::QueueId::Read), 0);
        system
            .read_request(ReadRequest {
                partition_id: 11,
                direction: Direction::Forwards,
                record_instance: 0,
                match_record_id: false,
                record_id: 0,
            })
            .expect("enqueue");
        assert_eq!(system.queue_depth(crate::system::QueueId::Read), 1);
    }
}
