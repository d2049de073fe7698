//! Partition layout, recovery, and runtime accounting.
//!
//! Partitions are declared at build time as `(id, page count, device)` and
//! laid end to end through the logical address space in declaration order.
//! Each one is grown (extra pages) or padded (dead bytes) until it spans a
//! whole number of its device's erase blocks, so a partition can always be
//! erased without touching its neighbours.
//!
//! After a reset the write cursor of each partition is recovered by a
//! bisection over page-level blank checks followed by a trailing-blank
//! scan of the boundary page.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::{MAX_NUMBER_OF_PARTITIONS, PAGE_SIZE_BYTES};
use crate::hal::{Device, FlashHal, LogicalRegion};
use crate::pages::{self, PageHeader, PAGE_HEADER_LEN};
use crate::search::find_next_free_address;

/// Build-time description of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Unique 8-bit partition id (the external name of the partition).
    pub id: u8,
    /// Requested number of pages; may be rounded up to fill whole erase
    /// blocks.
    pub pages: u32,
    /// Device the partition lives on.
    pub device: Device,
}

/// Health of a partition, derived at recovery and updated as it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionHealth {
    Ok,
    /// No writable space left.
    Full,
    /// The partition is completely blank and has never been formatted.
    /// Sticky until a format request succeeds.
    NeedsFormat,
    /// Recovery could not read the device.
    ReadFault,
}

impl fmt::Display for PartitionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionHealth::Ok => write!(f, "ok"),
            PartitionHealth::Full => write!(f, "partition full"),
            PartitionHealth::NeedsFormat => write!(f, "partition needs format"),
            PartitionHealth::ReadFault => write!(f, "flash read error"),
        }
    }
}

/// Errors from building the partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    TooManyPartitions,
    DuplicateId(u8),
    ZeroPages(u8),
    /// The layout ran off the end of the 32-bit logical address space.
    AddressOverflow,
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::TooManyPartitions => write!(f, "too many partitions"),
            LayoutError::DuplicateId(id) => write!(f, "duplicate partition id {}", id),
            LayoutError::ZeroPages(id) => write!(f, "partition {} has no pages", id),
            LayoutError::AddressOverflow => write!(f, "logical address space exhausted"),
        }
    }
}

/// Errors from formatting a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    BadPartitionIndex,
    /// The erase failed or the partition did not blank-check afterwards.
    EraseFailure,
    HeaderWriteFailure,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::BadPartitionIndex => write!(f, "bad partition index"),
            FormatError::EraseFailure => write!(f, "partition erase failure"),
            FormatError::HeaderWriteFailure => write!(f, "header write failure"),
        }
    }
}

/// Runtime state of one partition.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub id: u8,
    /// Actual page count after block-size rounding.
    pub pages: u32,
    pub device: Device,
    /// First logical byte address.
    pub start_address: u32,
    /// Last logical byte address (including any padding bytes).
    pub end_address: u32,
    pub health: PartitionHealth,
    /// First writable logical address; `None` until recovery or format
    /// establishes one. May be `end_address + 1` when the partition is
    /// exactly full.
    pub next_available_address: Option<u32>,
    pub free_pages: u32,
    pub full_pages: u32,
    pub unusable_pages: u32,
    pub error_pages: u32,
    pub blank_headers_and_pages: u32,
}

impl PartitionInfo {
    fn clear_counters(&mut self) {
        self.free_pages = 0;
        self.full_pages = 0;
        self.unusable_pages = 0;
        self.error_pages = 0;
        self.blank_headers_and_pages = 0;
    }

    /// Bytes spanned by the pages (excludes padding bytes, which are dead
    /// space at the end of the partition).
    fn page_span(&self) -> u32 {
        self.pages * PAGE_SIZE_BYTES
    }
}

/// The set of partitions on the board, in declaration order.
pub struct PartitionTable {
    partitions: Vec<PartitionInfo>,
}

impl PartitionTable {
    /// Lay the declared partitions end to end, rounding each one up to a
    /// whole number of its device's erase blocks.
    ///
    /// Two rounding strategies apply: when the block size is a multiple of
    /// the page size, extra pages are added until whole blocks are filled;
    /// otherwise padding bytes are appended (converting one page's worth
    /// of padding back into a usable page when possible).
    pub fn from_configs(
        configs: &[PartitionConfig],
        hal: &FlashHal,
    ) -> Result<PartitionTable, LayoutError> {
        if configs.len() > MAX_NUMBER_OF_PARTITIONS {
            return Err(LayoutError::TooManyPartitions);
        }

        let mut partitions = Vec::with_capacity(configs.len());
        let mut next_start: u32 = 0;

        for config in configs {
            if config.pages == 0 {
                return Err(LayoutError::ZeroPages(config.id));
            }
            if partitions.iter().any(|p: &PartitionInfo| p.id == config.id) {
                return Err(LayoutError::DuplicateId(config.id));
            }

            let block_size = hal.block_size_bytes(config.device);
            let mut pages = config.pages;
            let mut padding: u32 = 0;

            let mut bytes = pages
                .checked_mul(PAGE_SIZE_BYTES)
                .ok_or(LayoutError::AddressOverflow)?;

            if block_size > PAGE_SIZE_BYTES {
                if block_size % PAGE_SIZE_BYTES == 0 {
                    // Grow to the next whole number of blocks.
                    let pages_per_block = block_size / PAGE_SIZE_BYTES;
                    if pages % pages_per_block != 0 {
                        pages += pages_per_block - (pages % pages_per_block);
                    }
                    bytes = pages
                        .checked_mul(PAGE_SIZE_BYTES)
                        .ok_or(LayoutError::AddressOverflow)?;
                } else {
                    padding = block_size - (bytes % block_size);
                    // Convert a page's worth of padding into a real page.
                    if padding > PAGE_SIZE_BYTES {
                        pages += 1;
                        bytes += PAGE_SIZE_BYTES;
                        padding -= PAGE_SIZE_BYTES;
                    }
                }
            } else if bytes % block_size != 0 {
                padding = block_size - (bytes % block_size);
            }

            let span = bytes.checked_add(padding).ok_or(LayoutError::AddressOverflow)?;
            let end_address = next_start
                .checked_add(span - 1)
                .ok_or(LayoutError::AddressOverflow)?;

            partitions.push(PartitionInfo {
                id: config.id,
                pages,
                device: config.device,
                start_address: next_start,
                end_address,
                health: PartitionHealth::Ok,
                next_available_address: None,
                free_pages: 0,
                full_pages: 0,
                unusable_pages: 0,
                error_pages: 0,
                blank_headers_and_pages: 0,
            });

            next_start = end_address.checked_add(1).ok_or(LayoutError::AddressOverflow)?;
        }

        Ok(PartitionTable { partitions })
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PartitionInfo> {
        self.partitions.get(index)
    }

    /// Map a partition id to its table index.
    pub fn index_of(&self, id: u8) -> Option<usize> {
        self.partitions.iter().position(|p| p.id == id)
    }

    /// Logical regions for the HAL's address map, in table order.
    pub fn logical_regions(&self) -> Vec<LogicalRegion> {
        self.partitions
            .iter()
            .map(|p| LogicalRegion {
                device: p.device,
                start_address: p.start_address,
                end_address: p.end_address,
            })
            .collect()
    }

    /// Recover the partition's write cursor after a reset.
    ///
    /// Bisects over whole-page blank checks to find the first partially
    /// written page, then scans that page's data region for the first
    /// writable byte. Updates the cursor, health, and page counters.
    /// Returns `true` when the partition is ready for use (a partition
    /// that has never been formatted is not).
    pub fn bisection_search(&mut self, index: usize, hal: &FlashHal) -> bool {
        let partition = match self.partitions.get_mut(index) {
            Some(partition) => partition,
            None => return false,
        };

        partition.clear_counters();
        partition.next_available_address = None;

        let mut lower: u32 = 0;
        let mut upper: u32 = partition.pages - 1;
        let mut previous: u32 = u32::MAX;
        let mut page: u32 = 0;
        let mut boundary_found = false;
        let mut health = PartitionHealth::Ok;
        let mut ready = true;

        loop {
            page = (lower + upper) / 2;

            // Checking the same page twice in succession ends the
            // bisection: this page holds the data boundary.
            if page == previous {
                boundary_found = true;
                break;
            }

            let page_start = partition.start_address + PAGE_SIZE_BYTES * page;
            if hal.blank_check(page_start, PAGE_SIZE_BYTES) {
                // Whole memory blank: the partition was never formatted.
                if page == 0 {
                    health = PartitionHealth::NeedsFormat;
                    partition.blank_headers_and_pages = partition.pages;
                    ready = false;
                    break;
                }
                upper = page - 1;
            } else {
                lower = page + 1;
            }
            previous = page;
        }

        if boundary_found {
            let page_start = partition.start_address + PAGE_SIZE_BYTES * page;
            let data_start = page_start + PAGE_HEADER_LEN;

            match find_next_free_address(hal, data_start, PAGE_SIZE_BYTES - PAGE_HEADER_LEN) {
                Err(_) => {
                    health = PartitionHealth::ReadFault;
                    ready = false;
                }
                Ok(next_free) => {
                    let next_page_start = page_start + PAGE_SIZE_BYTES;
                    let last_page = page + 1 == partition.pages;

                    if next_free == next_page_start && last_page {
                        // The boundary page is the last one and it is
                        // full: no writable space left anywhere.
                        health = PartitionHealth::Full;
                        partition.next_available_address = Some(next_free);
                        partition.free_pages = 0;
                        partition.full_pages = partition.pages;
                    } else if next_free == next_page_start {
                        // Fell off the end of the page: the cursor lands
                        // after the next page's header.
                        partition.next_available_address =
                            Some(next_free + PAGE_HEADER_LEN);
                        partition.full_pages = page + 1;
                        partition.free_pages = partition.pages - page - 1;
                    } else {
                        partition.next_available_address = Some(next_free);
                        partition.full_pages = page;
                        partition.free_pages = partition.pages - page;
                    }
                }
            }
        }

        partition.health = health;
        ready
    }

    /// Erase the partition, verify it blank, and write page 0's header.
    ///
    /// Only the first page header is written; later pages are brought into
    /// use by the append engine as they are reached. The progress counter
    /// steps through 0, 1, 29 (erase), 30, 49 (blank check), 50 (header
    /// write) and 100 (done).
    pub fn format(
        &mut self,
        index: usize,
        hal: &FlashHal,
        progress: &AtomicU8,
    ) -> Result<(), FormatError> {
        progress.store(0, Ordering::Relaxed);

        let partition = match self.partitions.get(index) {
            Some(partition) => partition,
            None => return Err(FormatError::BadPartitionIndex),
        };
        let bytes = partition.page_span();

        progress.store(1, Ordering::Relaxed);
        let erase_result = hal.erase(partition.start_address, bytes);
        progress.store(29, Ordering::Relaxed);
        if erase_result.is_err() {
            return Err(FormatError::EraseFailure);
        }

        progress.store(30, Ordering::Relaxed);
        let blank = hal.blank_check(partition.start_address, bytes);
        progress.store(49, Ordering::Relaxed);
        if !blank {
            return Err(FormatError::EraseFailure);
        }

        progress.store(50, Ordering::Relaxed);
        pages::header_write(
            hal,
            partition.start_address,
            partition.end_address,
            0,
            &PageHeader::closed(partition.id),
        )
        .map_err(|_| FormatError::HeaderWriteFailure)?;

        progress.store(100, Ordering::Relaxed);
        Ok(())
    }

    /// Update free/full accounting after a page fills; once no free pages
    /// remain the partition health flips to full.
    pub fn flag_page_as_full(&mut self, index: usize) {
        if let Some(partition) = self.partitions.get_mut(index) {
            if partition.free_pages != 0 {
                partition.free_pages -= 1;
                partition.full_pages += 1;
                if partition.free_pages == 0 {
                    partition.health = PartitionHealth::Full;
                }
            }
        }
    }

    /// Tally a failed page-header write.
    pub fn note_header_write_failure(&mut self, index: usize) {
        if let Some(partition) = self.partitions.get_mut(index) {
            partition.error_pages += 1;
        }
    }

    /// Set the write cursor. Accepts any address inside the partition plus
    /// the one-past-the-end value (a write that exactly filled it).
    pub fn next_address_set(&mut self, index: usize, next_free_address: u32) -> bool {
        match self.partitions.get_mut(index) {
            Some(partition)
                if next_free_address >= partition.start_address
                    && next_free_address <= partition.end_address + 1 =>
            {
                partition.next_available_address = Some(next_free_address);
                true
            }
            _ => false,
        }
    }
}
