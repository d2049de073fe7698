//! Pages: header codec, geometry, diagnostics, and the append path.
//!
//! A partition is divided into fixed-size pages; each page starts with a
//! 16-byte header followed by a data region holding framed records. Page
//! headers are written once, when a page is first brought into use, and
//! are never rewritten (re-programming previously written locations risks
//! data retention problems at downhole temperatures), which is why new
//! headers carry the `closed` status word from the start.
//!
//! Header byte layout (multi-byte fields MSB first):
//!
//! ```text
//! [0]    format code (0x8D)
//! [1]    partition id
//! [2]    checksum = byte[0] + byte[1] (mod 256)
//! [3..5] status word: 0x6996 closed, 0x7BB7 open, 0xFFFF never written
//! [5]    error code (0xFF = none)
//! [6..8] error address (0xFFFF = none)
//! [8..]  reserved, blank
//! ```

use core::fmt;

use crate::config::{BLANK_LOCATION_CONTAINS, LOCAL_BLOCK_READ_SIZE, PAGE_SIZE_BYTES};
use crate::hal::{buffer_is_blank, FlashHal};
use crate::partition::PartitionTable;
use crate::record;
use crate::search::find_next_free_address;

/// Length of the page header in bytes.
pub const PAGE_HEADER_LEN: u32 = 16;

/// Expected format code in a page header.
pub const HEADER_FORMAT_CODE: u8 = 0x8D;

/// Error-code byte meaning "no error".
pub const HEADER_NO_ERROR: u8 = 0xFF;

/// Status word of a page with no more writable space.
pub const PAGE_STATUS_CLOSED: u16 = 0x6996;

/// Status word of a partially used page.
pub const PAGE_STATUS_OPEN: u16 = 0x7BB7;

/// Status word read from a header that was never written.
pub const PAGE_STATUS_BLANK: u16 = 0xFFFF;

const PAGE_DATA_BYTES: u32 = PAGE_SIZE_BYTES - PAGE_HEADER_LEN;

/// Outcome of validating the 16 header bytes of a page.
///
/// Validation order is fixed: all-blank first, then checksum, partition
/// id, format code and error code, and only then the status word; the
/// first failure wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCheck {
    /// All 16 bytes are blank: the page was never brought into use.
    Blank,
    ChecksumFail,
    PartitionIdFail,
    FormatCodeFail,
    /// The error-code byte is set; the page saw a write failure somewhere.
    ErrorCodeFail,
    /// Status word says the page is full.
    Closed,
    /// Status word says the page is partially used.
    Open,
    /// Status word itself was never written.
    Empty,
    /// Status word holds none of the defined values. Tolerated: to reach
    /// the status classification everything else already checked out.
    Undefined,
}

/// Errors from the page-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    InvalidPartition,
    InvalidPage,
    FlashRead,
    /// The header did not program correctly (device error or read-back
    /// mismatch).
    HeaderWrite,
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::InvalidPartition => write!(f, "invalid partition number"),
            PageError::InvalidPage => write!(f, "invalid page number"),
            PageError::FlashRead => write!(f, "flash read error"),
            PageError::HeaderWrite => write!(f, "page header write failed"),
        }
    }
}

/// Field values for a header about to be written.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub partition_id: u8,
    pub status: u16,
    pub error_code: u8,
    pub error_address: u16,
}

impl PageHeader {
    /// The header written for every page brought into use: status is
    /// `closed` from the start so it never needs rewriting.
    pub fn closed(partition_id: u8) -> Self {
        PageHeader {
            partition_id,
            status: PAGE_STATUS_CLOSED,
            error_code: HEADER_NO_ERROR,
            error_address: 0xFFFF,
        }
    }

    fn encode(&self) -> [u8; PAGE_HEADER_LEN as usize] {
        let mut bytes = [BLANK_LOCATION_CONTAINS; PAGE_HEADER_LEN as usize];
        bytes[0] = HEADER_FORMAT_CODE;
        bytes[1] = self.partition_id;
        bytes[2] = bytes[0].wrapping_add(bytes[1]);
        bytes[3..5].copy_from_slice(&self.status.to_be_bytes());
        bytes[5] = self.error_code;
        bytes[6..8].copy_from_slice(&self.error_address.to_be_bytes());
        bytes
    }
}

/// Read and classify the header of one page.
pub fn header_check(
    hal: &FlashHal,
    partition_start: u32,
    partition_end: u32,
    page_number: u32,
    partition_id: u8,
) -> Result<HeaderCheck, PageError> {
    let read_address = partition_start + PAGE_SIZE_BYTES * page_number;
    if read_address + (PAGE_HEADER_LEN - 1) > partition_end {
        return Err(PageError::InvalidPage);
    }

    let mut buffer = [0u8; PAGE_HEADER_LEN as usize];
    hal.read(read_address, &mut buffer)
        .map_err(|_| PageError::FlashRead)?;
    Ok(classify_header(&buffer, partition_id))
}

fn classify_header(buffer: &[u8], partition_id: u8) -> HeaderCheck {
    if buffer_is_blank(buffer) {
        return HeaderCheck::Blank;
    }
    if buffer[0].wrapping_add(buffer[1]) != buffer[2] {
        return HeaderCheck::ChecksumFail;
    }
    if buffer[1] != partition_id {
        return HeaderCheck::PartitionIdFail;
    }
    if buffer[0] != HEADER_FORMAT_CODE {
        return HeaderCheck::FormatCodeFail;
    }
    if buffer[5] != HEADER_NO_ERROR {
        return HeaderCheck::ErrorCodeFail;
    }
    match u16::from_be_bytes([buffer[3], buffer[4]]) {
        PAGE_STATUS_CLOSED => HeaderCheck::Closed,
        PAGE_STATUS_OPEN => HeaderCheck::Open,
        PAGE_STATUS_BLANK => HeaderCheck::Empty,
        _ => HeaderCheck::Undefined,
    }
}

/// Program a page header and read it back to verify.
pub fn header_write(
    hal: &FlashHal,
    partition_start: u32,
    partition_end: u32,
    page_number: u32,
    header: &PageHeader,
) -> Result<(), PageError> {
    let write_address = partition_start + PAGE_SIZE_BYTES * page_number;
    if write_address + (PAGE_HEADER_LEN - 1) > partition_end {
        return Err(PageError::InvalidPage);
    }

    let bytes = header.encode();
    if write_and_read_back(hal, write_address, &bytes, true) {
        Ok(())
    } else {
        Err(PageError::HeaderWrite)
    }
}

/// Geometry of the page containing a given address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDetails {
    /// The address the details were calculated for.
    pub address: u32,
    pub distance_from_partition_start: u32,
    pub page_number: u32,
    pub max_pages: u32,
    /// First data byte of the page (after the header).
    pub lower_address: u32,
    /// Last byte of the page.
    pub upper_address: u32,
    /// Distance down to the first data byte; zero when the address sits
    /// inside the header.
    pub distance_to_lower: u32,
    /// Distance up to the last byte of the page.
    pub distance_to_upper: u32,
}

/// Calculate page geometry for an address inside a partition.
///
/// Returns `None` when the partition bounds are inverted or the address
/// lies outside them.
pub fn page_details(partition_start: u32, partition_end: u32, address: u32) -> Option<PageDetails> {
    if partition_start > partition_end || address < partition_start || address > partition_end {
        return None;
    }

    let distance = address - partition_start;
    let page_number = distance / PAGE_SIZE_BYTES;
    let max_pages = (partition_end - partition_start) / PAGE_SIZE_BYTES + 1;

    let lower_address = partition_start + page_number * PAGE_SIZE_BYTES + PAGE_HEADER_LEN;
    let upper_address = partition_start + (page_number + 1) * PAGE_SIZE_BYTES - 1;

    Some(PageDetails {
        address,
        distance_from_partition_start: distance,
        page_number,
        max_pages,
        lower_address,
        upper_address,
        distance_to_lower: address.saturating_sub(lower_address),
        distance_to_upper: upper_address - address,
    })
}

/// Diagnostic classification of a page's contents against its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Header and data region are both completely blank.
    BlankHeaderAndPage,
    /// Header and contents disagree.
    Mismatch,
    /// The header itself failed validation.
    HeaderError,
    /// Header reports a write error somewhere in the page.
    HasErrors,
    Full,
    HasSpace,
    Empty,
}

/// Cross-check one page's header against the data actually in it.
///
/// Always derives the next free address of the page's data region, then
/// requires it to be consistent with what the header claims. A page that
/// reports free space must be followed by a blank page; a trailing run of
/// 0xFF in this page may otherwise just be the middle of a record spanning
/// into the next one.
pub fn page_status(
    hal: &FlashHal,
    partition_start: u32,
    partition_end: u32,
    partition_id: u8,
    page_number: u32,
) -> Result<PageStatus, PageError> {
    let header = header_check(hal, partition_start, partition_end, page_number, partition_id)?;

    let initial_read = partition_start + PAGE_SIZE_BYTES * page_number + PAGE_HEADER_LEN;
    let next_page = partition_start + PAGE_SIZE_BYTES * (page_number + 1);
    if next_page - 1 > partition_end {
        return Err(PageError::InvalidPage);
    }

    let next_free = find_next_free_address(hal, initial_read, PAGE_DATA_BYTES)
        .map_err(|_| PageError::FlashRead)?;

    let status = match header {
        HeaderCheck::Blank if next_free == initial_read => PageStatus::BlankHeaderAndPage,
        HeaderCheck::Closed if next_free == next_page => PageStatus::Full,
        HeaderCheck::Open if next_free == initial_read => PageStatus::Empty,
        HeaderCheck::Open if next_free != next_page => PageStatus::HasSpace,
        HeaderCheck::Empty if next_free == initial_read => PageStatus::Empty,
        HeaderCheck::Empty if next_free < next_page => PageStatus::HasSpace,
        HeaderCheck::Undefined => {
            if next_free == initial_read {
                PageStatus::Empty
            } else if next_free != next_page {
                PageStatus::HasSpace
            } else {
                PageStatus::Full
            }
        }
        HeaderCheck::ErrorCodeFail => PageStatus::HasErrors,
        HeaderCheck::ChecksumFail | HeaderCheck::PartitionIdFail | HeaderCheck::FormatCodeFail => {
            PageStatus::HeaderError
        }
        _ => PageStatus::Mismatch,
    };

    if status == PageStatus::HasSpace {
        return check_next_page_is_blank(
            hal,
            partition_start,
            partition_end,
            page_number,
            header,
        );
    }
    Ok(status)
}

fn check_next_page_is_blank(
    hal: &FlashHal,
    partition_start: u32,
    partition_end: u32,
    page_number: u32,
    header: HeaderCheck,
) -> Result<PageStatus, PageError> {
    // Only probe if a next page actually exists.
    let next_page_last = partition_start + PAGE_SIZE_BYTES * (page_number + 2) - 1;
    if next_page_last > partition_end {
        return Ok(PageStatus::HasSpace);
    }

    let next_first = partition_start + PAGE_SIZE_BYTES * (page_number + 1) + PAGE_HEADER_LEN;
    let next_free = find_next_free_address(hal, next_first, PAGE_DATA_BYTES)
        .map_err(|_| PageError::FlashRead)?;

    if next_free == next_first {
        Ok(PageStatus::HasSpace)
    } else if header == HeaderCheck::Undefined {
        Ok(PageStatus::Full)
    } else {
        Ok(PageStatus::Mismatch)
    }
}

/// Program a buffer and optionally read it back in chunks to verify.
///
/// Any device error or read-back mismatch returns `false`; the caller
/// decides whether the cursor still advances (it does, to skip bytes that
/// may be damaged).
pub(crate) fn write_and_read_back(
    hal: &FlashHal,
    logical_start: u32,
    data: &[u8],
    read_back: bool,
) -> bool {
    if hal.write(logical_start, data).is_err() {
        return false;
    }
    if !read_back {
        return true;
    }

    let mut buffer = [0u8; LOCAL_BLOCK_READ_SIZE];
    for (chunk_index, chunk) in data.chunks(LOCAL_BLOCK_READ_SIZE).enumerate() {
        let address = logical_start + (chunk_index * LOCAL_BLOCK_READ_SIZE) as u32;
        let readback = &mut buffer[..chunk.len()];
        if hal.read(address, readback).is_err() || readback != chunk {
            return false;
        }
    }
    true
}

/// Everything the append engine needs to place one record.
pub struct PageWrite<'a> {
    pub partition_index: usize,
    pub partition_id: u8,
    pub partition_start: u32,
    pub partition_end: u32,
    /// Current write cursor of the partition.
    pub next_free_addr: u32,
    pub record_id: u16,
    /// Full framed layout; the wrapper bytes are filled in here.
    pub buffer: &'a mut [u8],
    pub read_back: bool,
}

/// Errors from [`page_data_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageWriteError {
    /// The record cannot fit in the remaining space (checked before any
    /// flash is touched; the cursor does not move).
    InvalidAddresses,
    /// A program or read-back verification failed. The cursor has been
    /// advanced past the suspect bytes.
    DeviceError,
}

impl fmt::Display for PageWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageWriteError::InvalidAddresses => write!(f, "record does not fit at this address"),
            PageWriteError::DeviceError => write!(f, "record write failed"),
        }
    }
}

/// Append one framed record at the partition cursor.
///
/// Handles the record crossing into the next page (at most one boundary,
/// guaranteed by the page-size / TDR-size relationship): the first slice
/// fills the current page, the next page's header is programmed, and the
/// remainder lands after it. The partition cursor is updated through
/// `partitions` even when the write fails, so a retry skips the
/// potentially damaged locations. Returns `Ok(true)` when the write
/// filled the current page.
pub fn page_data_write(
    hal: &FlashHal,
    partitions: &mut PartitionTable,
    mut write: PageWrite<'_>,
) -> Result<bool, PageWriteError> {
    if !record_fits(&write) {
        return Err(PageWriteError::InvalidAddresses);
    }

    record::frame(&mut *write.buffer, write.record_id);

    let (result, next_free) = write_with_overlap(hal, partitions, &write);

    // Move the cursor regardless of the outcome: a failed program leaves
    // the flash in an unknown state and those bytes must not be reused.
    let _ = partitions.next_address_set(write.partition_index, next_free);

    result
}

fn write_with_overlap(
    hal: &FlashHal,
    partitions: &mut PartitionTable,
    write: &PageWrite<'_>,
) -> (Result<bool, PageWriteError>, u32) {
    let details = match page_details(
        write.partition_start,
        write.partition_end,
        write.next_free_addr,
    ) {
        Some(details) => details,
        None => return (Err(PageWriteError::InvalidAddresses), write.next_free_addr),
    };

    // The distance does not count the cursor location itself.
    let free_in_page = details.distance_to_upper + 1;
    let framed_len = write.buffer.len() as u32;

    if framed_len <= free_in_page {
        let ok = write_and_read_back(hal, write.next_free_addr, write.buffer, write.read_back);

        let mut next_free = write.next_free_addr + framed_len;
        let mut filled_page = false;
        if next_free > details.upper_address {
            filled_page = true;
            // Land after the next page's header, or right after the page
            // itself when this was the partition's last one.
            next_free = if details.page_number + 1 < details.max_pages {
                details.upper_address + PAGE_HEADER_LEN + 1
            } else {
                details.upper_address + 1
            };
            close_page_and_open_next(hal, partitions, write, details.page_number);
        }

        let result = if ok {
            Ok(filled_page)
        } else {
            Err(PageWriteError::DeviceError)
        };
        (result, next_free)
    } else {
        // Split across the page boundary.
        let first_len = free_in_page as usize;
        let first_ok = write_and_read_back(
            hal,
            write.next_free_addr,
            &write.buffer[..first_len],
            write.read_back,
        );

        close_page_and_open_next(hal, partitions, write, details.page_number);

        let mut next_free = details.upper_address + PAGE_HEADER_LEN + 1;
        if !first_ok {
            return (Err(PageWriteError::DeviceError), next_free);
        }

        let remainder = &write.buffer[first_len..];
        let second_ok = write_and_read_back(hal, next_free, remainder, write.read_back);
        next_free += remainder.len() as u32;

        let result = if second_ok {
            Ok(true)
        } else {
            Err(PageWriteError::DeviceError)
        };
        (result, next_free)
    }
}

/// Account for the page that just filled and bring the next one into use.
///
/// A failed header write is deliberately non-fatal to the record that was
/// just written; it is tallied in the partition counters and the memory
/// keeps being used.
fn close_page_and_open_next(
    hal: &FlashHal,
    partitions: &mut PartitionTable,
    write: &PageWrite<'_>,
    current_page: u32,
) {
    partitions.flag_page_as_full(write.partition_index);

    match header_write(
        hal,
        write.partition_start,
        write.partition_end,
        current_page + 1,
        &PageHeader::closed(write.partition_id),
    ) {
        Ok(()) => {}
        // Expected when the partition's last page just filled: there is no
        // next page to bring into use.
        Err(PageError::InvalidPage) => {}
        Err(error) => {
            log::warn!(
                "partition {}: header write for page {} failed: {}",
                write.partition_id,
                current_page + 1,
                error
            );
            partitions.note_header_write_failure(write.partition_index);
        }
    }
}

/// Pre-flight check: will the framed record fit in the space left in the
/// partition, using at most the rest of this page plus one more?
fn record_fits(write: &PageWrite<'_>) -> bool {
    let details = match page_details(
        write.partition_start,
        write.partition_end,
        write.next_free_addr,
    ) {
        Some(details) => details,
        None => return false,
    };

    let free_in_page = details.distance_to_upper + 1;
    let framed_len = write.buffer.len() as u32;
    if framed_len <= free_in_page {
        return true;
    }

    // The final byte of the split write must exist within the partition.
    let next_page_first = details.upper_address + PAGE_HEADER_LEN + 1;
    let remainder = framed_len - free_in_page;
    page_details(
        write.partition_start,
        write.partition_end,
        next_page_first + remainder - 1,
    )
    .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: u32 = PAGE_SIZE_BYTES;

    fn encoded(partition_id: u8, status: u16) -> [u8; 16] {
        PageHeader {
            partition_id,
            status,
            error_code: HEADER_NO_ERROR,
            error_address: 0xFFFF,
        }
        .encode()
    }

    #[test]
    fn test_header_encode_layout() {
        let bytes = encoded(11, PAGE_STATUS_CLOSED);
        assert_eq!(bytes[0], 0x8D);
        assert_eq!(bytes[1], 11);
        assert_eq!(bytes[2], 0x8D + 11);
        assert_eq!(&bytes[3..5], &[0x69, 0x96], "status is MSB first");
        assert_eq!(bytes[5], 0xFF);
        assert_eq!(&bytes[6..8], &[0xFF, 0xFF]);
        assert!(bytes[8..].iter().all(|&b| b == 0xFF), "reserved area blank");
    }

    #[test]
    fn test_classify_header_status_words() {
        assert_eq!(
            classify_header(&encoded(3, PAGE_STATUS_CLOSED), 3),
            HeaderCheck::Closed
        );
        assert_eq!(
            classify_header(&encoded(3, PAGE_STATUS_OPEN), 3),
            HeaderCheck::Open
        );
        assert_eq!(
            classify_header(&encoded(3, PAGE_STATUS_BLANK), 3),
            HeaderCheck::Empty
        );
        assert_eq!(
            classify_header(&encoded(3, 0x1234), 3),
            HeaderCheck::Undefined
        );
    }

    #[test]
    fn test_classify_header_blank_wins() {
        let blank = [0xFFu8; 16];
        // A blank header would also fail the checksum test; blank must win.
        assert_eq!(classify_header(&blank, 3), HeaderCheck::Blank);
    }

    #[test]
    fn test_classify_header_failure_order() {
        // Checksum is checked before partition id: corrupt both.
        let mut bytes = encoded(3, PAGE_STATUS_CLOSED);
        bytes[1] = 9;
        assert_eq!(classify_header(&bytes, 3), HeaderCheck::ChecksumFail);

        // Fix the checksum for the wrong id: now the id fail shows.
        bytes[2] = bytes[0].wrapping_add(bytes[1]);
        assert_eq!(classify_header(&bytes, 3), HeaderCheck::PartitionIdFail);

        // Wrong format code with consistent checksum and matching id.
        let mut bytes = encoded(3, PAGE_STATUS_CLOSED);
        bytes[0] = 0x8C;
        bytes[2] = bytes[0].wrapping_add(bytes[1]);
        assert_eq!(classify_header(&bytes, 3), HeaderCheck::FormatCodeFail);

        // Error code set.
        let mut bytes = encoded(3, PAGE_STATUS_CLOSED);
        bytes[5] = 0x01;
        assert_eq!(classify_header(&bytes, 3), HeaderCheck::ErrorCodeFail);
    }

    #[test]
    fn test_page_details_mid_page() {
        let start = 0x1000;
        let end = start + 4 * PS - 1;
        let addr = start + PS + 100;

        let d = page_details(start, end, addr).expect("valid address");
        assert_eq!(d.page_number, 1);
        assert_eq!(d.max_pages, 4);
        assert_eq!(d.lower_address, start + PS + PAGE_HEADER_LEN);
        assert_eq!(d.upper_address, start + 2 * PS - 1);
        assert_eq!(d.distance_to_lower, 100 - PAGE_HEADER_LEN);
        assert_eq!(d.distance_to_upper, PS - 1 - 100);
    }

    #[test]
    fn test_page_details_inside_header_clamps_lower_distance() {
        let start = 0;
        let end = 2 * PS - 1;
        let d = page_details(start, end, start + 4).expect("valid address");
        assert_eq!(d.distance_to_lower, 0, "header addresses clamp to zero");
        assert_eq!(d.page_number, 0);
    }

    #[test]
    fn test_page_details_rejects_out_of_partition() {
        assert!(page_details(0x100, 0x100 + PS - 1, 0x0FF).is_none());
        assert!(page_details(0x100, 0x100 + PS - 1, 0x100 + PS).is_none());
        assert!(page_details(0x200, 0x100, 0x150).is_none(), "inverted bounds");
    }

    #[test]
    fn test_record_fits_within_page() {
        let mut buf = [0u8; 100];
        let write = PageWrite {
            partition_index: 0,
            partition_id: 1,
            partition_start: 0,
            partition_end: 2 * PS - 1,
            next_free_addr: PS - 100, // exactly 100 bytes left in page 0
            record_id: 0,
            buffer: &mut buf,
            read_back: false,
        };
        assert!(record_fits(&write), "exact fit in current page");
    }

    #[test]
    fn test_record_fits_with_split_into_next_page() {
        let mut buf = [0u8; 100];
        let write = PageWrite {
            partition_index: 0,
            partition_id: 1,
            partition_start: 0,
            partition_end: 2 * PS - 1,
            next_free_addr: PS - 40, // 40 left, 60 spill into page 1
            record_id: 0,
            buffer: &mut buf,
            read_back: false,
        };
        assert!(record_fits(&write));
    }

    #[test]
    fn test_record_does_not_fit_past_partition_end() {
        let mut buf = [0u8; 100];
        let write = PageWrite {
            partition_index: 0,
            partition_id: 1,
            partition_start: 0,
            partition_end: PS - 1, // single page partition
            next_free_addr: PS - 40,
            record_id: 0,
            buffer: &mut buf,
            read_back: false,
        };
        assert!(!record_fits(&write), "no next page to spill into");
    }
}
