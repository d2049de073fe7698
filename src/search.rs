//! Searching the recording memory.
//!
//! Two algorithms live here. The trailing-blank scan
//! ([`find_next_free_address`]) finds the first writable byte of a
//! contiguous range by reading it backwards in chunks and counting the
//! run of blank bytes at the end. The record search
//! ([`SearchEngine::find_record`]) walks a partition forwards or
//! backwards through a windowed buffer, validating candidate records one
//! byte at a time, since the stream may contain garbage after an interrupted
//! write, so nothing about record boundaries can be trusted until a CRC
//! and ENDSYNC check out.
//!
//! Window reads skip page headers: filling the buffer takes one physical
//! read, or two when the window crosses a page boundary.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{
    BLANK_LOCATION_CONTAINS, LOCAL_BLOCK_READ_SIZE, MAX_TDR_SIZE_BYTES,
};
use crate::hal::{FlashHal, FlashHalError};
use crate::pages::{page_details, PAGE_HEADER_LEN};
use crate::record::{self, WRAPPER_OVERHEAD};
use crate::sync::CancelToken;

/// Size of the search buffer: twice the largest possible framed record,
/// so a window that starts on a record boundary always contains at least
/// one whole record while data lasts.
pub(crate) const FIND_BUFFER_SIZE: usize = 2 * (MAX_TDR_SIZE_BYTES + WRAPPER_OVERHEAD);

/// Direction of a record search through a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forwards,
    Backwards,
}

/// Find the first address of the blank run that ends a contiguous range.
///
/// Reads backwards from `start + bytes` in chunks, counting trailing
/// blank bytes, and stops at the first chunk holding data. Returns
/// `start + bytes` itself when the last byte of the range is not blank.
///
/// A data byte that happens to be 0xFF is indistinguishable from blank
/// here; the record framing's ENDSYNC trailer exists so that the layers
/// above never have to care.
pub fn find_next_free_address(
    hal: &FlashHal,
    logical_start: u32,
    bytes: u32,
) -> Result<u32, FlashHalError> {
    let block = LOCAL_BLOCK_READ_SIZE as u32;
    let mut buffer = [0u8; LOCAL_BLOCK_READ_SIZE];

    let mut whole_blocks = bytes / block;
    let remainder = bytes % block;

    // May underflow when the range is smaller than one block; the
    // remainder pass below reads from the start and never uses this.
    let mut read_address = (logical_start + bytes).wrapping_sub(block);

    let mut total_blanks: u32 = 0;
    let mut found_data = false;

    while whole_blocks != 0 {
        hal.read(read_address, &mut buffer)?;
        let blanks = count_blanks_from_end(&buffer);
        total_blanks += blanks as u32;

        if blanks != LOCAL_BLOCK_READ_SIZE {
            found_data = true;
            break;
        }
        read_address = read_address.wrapping_sub(block);
        whole_blocks -= 1;
    }

    if remainder != 0 && !found_data {
        let tail = &mut buffer[..remainder as usize];
        hal.read(logical_start, tail)?;
        total_blanks += count_blanks_from_end(tail) as u32;
    }

    Ok(logical_start + bytes - total_blanks)
}

fn count_blanks_from_end(area: &[u8]) -> usize {
    area.iter()
        .rev()
        .take_while(|&&byte| byte == BLANK_LOCATION_CONTAINS)
        .count()
}

/// Parameters of one record search.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub direction: Direction,
    pub partition_start: u32,
    pub partition_end: u32,
    /// Where to start. For backward searches this address itself is
    /// excluded from the first window; starting from the partition cursor
    /// therefore begins at the last written byte.
    pub search_start: u32,
    /// Zero-based instance of the matching record to report.
    pub record_instance: u32,
    /// When set, only records whose id equals `record_id` are counted.
    pub match_record_id: bool,
    pub record_id: u16,
}

/// A validated record located in the engine's scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsrHit {
    /// Offset of the SYNC byte in the scratch buffer.
    pub rsr_start: usize,
    /// Offset of the first TDR byte in the scratch buffer.
    pub tdr_start: usize,
    pub record_id: u16,
    pub tdr_len: u16,
    pub crc: u16,
}

/// One or two physical reads that together fill the scratch buffer,
/// skipping page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    addresses: [u32; 2],
    lengths: [u32; 2],
    reads: usize,
}

impl Window {
    fn one(address: u32, length: u32) -> Window {
        Window {
            addresses: [address, 0],
            lengths: [length, 0],
            reads: 1,
        }
    }

    fn two(first: (u32, u32), second: (u32, u32)) -> Window {
        Window {
            addresses: [first.0, second.0],
            lengths: [first.1, second.1],
            reads: 2,
        }
    }

    fn total(&self) -> u32 {
        self.lengths[..self.reads].iter().sum()
    }
}

struct ScanOutcome {
    /// Validated record plus the index where the next scan resumes.
    found: Option<(record::ParsedRsr, usize, usize)>,
    checked: usize,
    max_check: usize,
}

/// Windowed record search over a partition.
///
/// Owns the scratch buffer; a hit stays valid (and borrowable through
/// [`tdr_bytes`](SearchEngine::hit_tdr)) only until the next search
/// starts. Not re-entrant: exactly one search runs at a time, under the
/// gatekeeper.
pub struct SearchEngine {
    buffer: Vec<u8>,
    hit: Option<RsrHit>,
    cancel: CancelToken,
}

impl SearchEngine {
    pub fn new() -> Self {
        SearchEngine {
            buffer: vec![BLANK_LOCATION_CONTAINS; FIND_BUFFER_SIZE],
            hit: None,
            cancel: CancelToken::new(),
        }
    }

    /// Token that aborts a running search when cancelled. The search
    /// checks it each time the scratch buffer needs refilling and reports
    /// "not found" when it fires.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The hit of the last successful search.
    pub fn hit(&self) -> Option<&RsrHit> {
        self.hit.as_ref()
    }

    /// TDR payload of the last hit, borrowed from the scratch buffer.
    pub fn hit_tdr(&self) -> Option<&[u8]> {
        self.hit
            .as_ref()
            .map(|hit| &self.buffer[hit.tdr_start..hit.tdr_start + hit.tdr_len as usize])
    }

    /// Search the partition for the requested instance of a record.
    ///
    /// Returns `true` and records the hit when found; `false` when the
    /// search space is exhausted, a read fails, or the cancel token fires.
    pub fn find_record(&mut self, hal: &FlashHal, params: &SearchParams) -> bool {
        self.hit = None;
        self.cancel.clear();

        if params.partition_start > params.partition_end {
            return false;
        }
        // Backward searches may legitimately start one past the end: that
        // is the cursor of an exactly full partition.
        let max_start = match params.direction {
            Direction::Forwards => params.partition_end,
            Direction::Backwards => params.partition_end + 1,
        };
        if params.search_start < params.partition_start || params.search_start > max_start {
            return false;
        }

        let mut search_start = params.search_start;
        let mut instance_counter: u32 = 0;

        while !self.cancel.is_cancelled() {
            let window = match setup_window(params, search_start) {
                Some(window) => window,
                None => return false,
            };
            let bytes_read = self.read_window(hal, &window);
            if bytes_read == 0 {
                return false;
            }

            let mut last_valid: usize = match params.direction {
                Direction::Forwards => 0,
                Direction::Backwards => bytes_read,
            };

            loop {
                let mut start_index = last_valid;
                // Step back one for a backward search, or the same record
                // is found again.
                if params.direction == Direction::Backwards && start_index != 0 {
                    start_index -= 1;
                }

                let scan = self.scan_buffer(params.direction, start_index, bytes_read);

                if let Some((parsed, sync_index, last_index)) = scan.found {
                    last_valid = match params.direction {
                        Direction::Forwards => last_index + 1,
                        Direction::Backwards => last_index,
                    };

                    if instance_matches(params, parsed.record_id, &mut instance_counter) {
                        self.hit = Some(RsrHit {
                            rsr_start: sync_index,
                            tdr_start: parsed.tdr_start,
                            record_id: parsed.record_id,
                            tdr_len: parsed.tdr_len,
                            crc: parsed.crc,
                        });
                        return true;
                    }
                }

                // Buffer exhausted: move the window.
                if scan.checked == scan.max_check || last_valid == 0 {
                    match next_search_address(params, &window, last_valid) {
                        Some(next) => search_start = next,
                        None => return false,
                    }
                    break;
                }
            }
        }

        false
    }

    /// Fill the scratch buffer from the window reads. Returns the number
    /// of valid bytes, or zero on any read failure.
    fn read_window(&mut self, hal: &FlashHal, window: &Window) -> usize {
        self.buffer.fill(BLANK_LOCATION_CONTAINS);

        let mut offset = 0usize;
        for read in 0..window.reads {
            let length = window.lengths[read] as usize;
            let target = &mut self.buffer[offset..offset + length];
            if hal.read(window.addresses[read], target).is_err() {
                return 0;
            }
            offset += length;
        }
        offset
    }

    /// Scan the buffer from `start_index` in `direction`, validating each
    /// SYNC candidate, until a record parses or the space is exhausted.
    fn scan_buffer(&self, direction: Direction, start_index: usize, bytes_read: usize) -> ScanOutcome {
        let max_check = if bytes_read > self.buffer.len() || start_index >= bytes_read {
            0
        } else {
            match direction {
                Direction::Forwards => bytes_read - start_index,
                Direction::Backwards => start_index + 1,
            }
        };

        let buffer = &self.buffer[..bytes_read];
        for step in 0..max_check {
            let index = match direction {
                Direction::Forwards => start_index + step,
                Direction::Backwards => start_index - step,
            };

            if buffer[index] == record::SYNC {
                if let Some(parsed) = record::parse_at(buffer, index) {
                    let last_index = match direction {
                        Direction::Forwards => index + parsed.total_len - 1,
                        Direction::Backwards => index,
                    };
                    return ScanOutcome {
                        found: Some((parsed, index, last_index)),
                        checked: step,
                        max_check,
                    };
                }
            }
        }

        ScanOutcome {
            found: None,
            checked: max_check,
            max_check,
        }
    }
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn instance_matches(params: &SearchParams, record_id: u16, counter: &mut u32) -> bool {
    if params.match_record_id && record_id != params.record_id {
        return false;
    }
    if *counter == params.record_instance {
        true
    } else {
        *counter += 1;
        false
    }
}

/// Work out the one or two reads that fill the scratch buffer from
/// `search_start`, truncating at partition edges and skipping headers.
fn setup_window(params: &SearchParams, search_start: u32) -> Option<Window> {
    // Cursor of an exactly full partition: synthesise the final window as
    // the tail of the last page's data region.
    if params.direction == Direction::Backwards && search_start == params.partition_end + 1 {
        let details = page_details(params.partition_start, params.partition_end, params.partition_end)?;
        let available = params.partition_end + 1 - details.lower_address;
        let length = available.min(FIND_BUFFER_SIZE as u32);
        return Some(Window::one(params.partition_end + 1 - length, length));
    }

    let details = page_details(params.partition_start, params.partition_end, search_start)?;
    match params.direction {
        Direction::Forwards => setup_window_forwards(&details),
        Direction::Backwards => setup_window_backwards(&details, params.partition_start),
    }
}

fn setup_window_forwards(details: &crate::pages::PageDetails) -> Option<Window> {
    let buffer = FIND_BUFFER_SIZE as u32;
    let last_page = details.max_pages - 1;

    if details.distance_to_upper >= buffer {
        // Fits inside the page. A start inside the header snaps to the
        // first data byte.
        let address = if details.address < details.lower_address {
            details.lower_address
        } else {
            details.address
        };
        Some(Window::one(address, buffer))
    } else if details.page_number == last_page {
        // Truncated by the end of the partition.
        Some(Window::one(details.address, details.distance_to_upper + 1))
    } else {
        // Crosses into the next page: skip its header.
        let first_len = details.distance_to_upper + 1;
        Some(Window::two(
            (details.address, first_len),
            (
                details.upper_address + PAGE_HEADER_LEN + 1,
                buffer - first_len,
            ),
        ))
    }
}

fn setup_window_backwards(
    details: &crate::pages::PageDetails,
    partition_start: u32,
) -> Option<Window> {
    let buffer = FIND_BUFFER_SIZE as u32;

    if details.distance_to_lower >= buffer {
        // Fits inside the page. The start address itself is excluded so
        // that successive windows stay word aligned.
        Some(Window::one(details.address - buffer, buffer))
    } else if details.page_number == 0 {
        // Truncated by the start of the partition.
        if details.distance_to_lower == 0 {
            return None;
        }
        Some(Window::one(
            partition_start + PAGE_HEADER_LEN,
            details.distance_to_lower,
        ))
    } else {
        // Crosses back into the previous page, skipping this page's
        // header. Starting exactly on the boundary splits the window
        // evenly between the two pages.
        let (current_len, current_addr) = if details.distance_to_lower == 0 {
            (buffer / 2, details.lower_address)
        } else {
            (details.distance_to_lower, details.lower_address)
        };
        let previous_len = if details.distance_to_lower == 0 {
            buffer / 2
        } else {
            buffer - current_len
        };
        let previous_addr = details.lower_address - PAGE_HEADER_LEN - previous_len;

        Some(Window::two(
            (previous_addr, previous_len),
            (current_addr, current_len),
        ))
    }
}

/// After a window is exhausted, work out where the next one starts, or
/// `None` when the search has walked off the searchable range.
fn next_search_address(params: &SearchParams, window: &Window, last_valid: usize) -> Option<u32> {
    let last_valid = last_valid as u32;

    match params.direction {
        Direction::Forwards => {
            let next = if window.reads == 1 {
                if last_valid == 0 {
                    // Nothing validated: continue at the next flash block.
                    window.addresses[0] + window.lengths[0]
                } else {
                    window.addresses[0] + last_valid
                }
            } else if last_valid == 0 {
                window.addresses[1] + window.lengths[1]
            } else if last_valid < window.lengths[0] {
                window.addresses[0] + last_valid
            } else {
                window.addresses[1] + (last_valid - window.lengths[0])
            };

            if next >= params.partition_end {
                None
            } else {
                Some(next)
            }
        }
        Direction::Backwards => {
            let next = if window.reads == 1 {
                if last_valid == window.lengths[0] {
                    window.addresses[0]
                } else {
                    window.addresses[0] + last_valid
                }
            } else if last_valid == window.total() {
                window.addresses[0]
            } else if last_valid < window.lengths[0] {
                window.addresses[0] + last_valid
            } else {
                window.addresses[1] + (last_valid - window.lengths[0])
            };

            if next <= params.partition_start + PAGE_HEADER_LEN {
                None
            } else {
                Some(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE_BYTES;
    use crate::record::TdrBuffer;

    const PS: u32 = PAGE_SIZE_BYTES;
    const BUF: u32 = FIND_BUFFER_SIZE as u32;

    #[test]
    fn test_count_blanks_from_end() {
        assert_eq!(count_blanks_from_end(&[0xFF, 0xFF, 0xFF]), 3);
        assert_eq!(count_blanks_from_end(&[0x00, 0xFF, 0xFF]), 2);
        assert_eq!(count_blanks_from_end(&[0xFF, 0xFF, 0x00]), 0);
        assert_eq!(count_blanks_from_end(&[]), 0);
    }

    fn params(direction: Direction, start: u32, end: u32, search: u32) -> SearchParams {
        SearchParams {
            direction,
            partition_start: start,
            partition_end: end,
            search_start: search,
            record_instance: 0,
            match_record_id: false,
            record_id: 0,
        }
    }

    #[test]
    fn test_forward_window_inside_page() {
        let p = params(Direction::Forwards, 0, 4 * PS - 1, 100);
        let w = setup_window(&p, 100).expect("window");
        assert_eq!(w, Window::one(100, BUF));
    }

    #[test]
    fn test_forward_window_snaps_out_of_header() {
        let p = params(Direction::Forwards, 0, 4 * PS - 1, 4);
        let w = setup_window(&p, 4).expect("window");
        assert_eq!(w, Window::one(16, BUF), "start inside the header snaps to data");
    }

    #[test]
    fn test_forward_window_splits_across_page_boundary() {
        let start = PS - 100; // 100 bytes left in page 0
        let p = params(Direction::Forwards, 0, 4 * PS - 1, start);
        let w = setup_window(&p, start).expect("window");
        assert_eq!(
            w,
            Window::two((start, 100), (PS + 16, BUF - 100)),
            "second read starts after the next page's header"
        );
        assert_eq!(w.total(), BUF);
    }

    #[test]
    fn test_forward_window_truncates_at_partition_end() {
        let start = 4 * PS - 50;
        let p = params(Direction::Forwards, 0, 4 * PS - 1, start);
        let w = setup_window(&p, start).expect("window");
        assert_eq!(w, Window::one(start, 50));
    }

    #[test]
    fn test_backward_window_inside_page() {
        let search = 2 * PS + 5000;
        let p = params(Direction::Backwards, 0, 4 * PS - 1, search);
        let w = setup_window(&p, search).expect("window");
        assert_eq!(
            w,
            Window::one(search - BUF, BUF),
            "backward window excludes the start address"
        );
    }

    #[test]
    fn test_backward_window_truncates_at_partition_start() {
        let p = params(Direction::Backwards, 0, 4 * PS - 1, 116);
        let w = setup_window(&p, 116).expect("window");
        assert_eq!(w, Window::one(16, 100));
    }

    #[test]
    fn test_backward_window_in_first_header_has_no_reads() {
        let p = params(Direction::Backwards, 0, 4 * PS - 1, 10);
        assert!(setup_window(&p, 10).is_none());
    }

    #[test]
    fn test_backward_window_crosses_previous_page() {
        let search = PS + 16 + 100; // 100 data bytes into page 1
        let p = params(Direction::Backwards, 0, 4 * PS - 1, search);
        let w = setup_window(&p, search).expect("window");

        // Second read: the 100 bytes of this page; first read: the rest
        // from the previous page, ending right before this page's header.
        assert_eq!(w.reads, 2);
        assert_eq!(w.lengths, [BUF - 100, 100]);
        assert_eq!(w.addresses[1], PS + 16);
        assert_eq!(w.addresses[0], PS - (BUF - 100));
        assert_eq!(w.total(), BUF);
    }

    #[test]
    fn test_backward_window_from_full_partition_cursor() {
        let end = 2 * PS - 1;
        let p = params(Direction::Backwards, 0, end, end + 1);
        let w = setup_window(&p, end + 1).expect("window");
        assert_eq!(
            w,
            Window::one(end + 1 - BUF, BUF),
            "tail of the last page, ENDSYNC of the final record included"
        );
    }

    #[test]
    fn test_next_search_address_forward_termination() {
        let p = params(Direction::Forwards, 0, 4 * PS - 1, 0);
        let w = Window::one(4 * PS - 200, 200);
        assert_eq!(
            next_search_address(&p, &w, 0),
            None,
            "next block starts at the partition end"
        );
    }

    #[test]
    fn test_next_search_address_forward_resumes_after_record() {
        let p = params(Direction::Forwards, 0, 4 * PS - 1, 0);
        let w = Window::one(1000, BUF);
        assert_eq!(next_search_address(&p, &w, 150), Some(1150));
        // Nothing validated: skip the whole window.
        assert_eq!(next_search_address(&p, &w, 0), Some(1000 + BUF));
    }

    #[test]
    fn test_next_search_address_forward_split_window() {
        let p = params(Direction::Forwards, 0, 4 * PS - 1, 0);
        let w = Window::two((PS - 100, 100), (PS + 16, BUF - 100));
        // Last valid index inside the first read.
        assert_eq!(next_search_address(&p, &w, 40), Some(PS - 100 + 40));
        // Inside the second read: skip over the page header.
        assert_eq!(next_search_address(&p, &w, 150), Some(PS + 16 + 50));
    }

    #[test]
    fn test_next_search_address_backward_termination() {
        let p = params(Direction::Backwards, 0, 4 * PS - 1, 0);
        let w = Window::one(16, 100);
        assert_eq!(
            next_search_address(&p, &w, 100),
            None,
            "window already reached the first data byte"
        );
    }

    #[test]
    fn test_next_search_address_backward_resumes_at_record() {
        let p = params(Direction::Backwards, 0, 4 * PS - 1, 0);
        let w = Window::one(5000, BUF);
        assert_eq!(next_search_address(&p, &w, 70), Some(5070));
        // Nothing validated: resume at the window base.
        assert_eq!(next_search_address(&p, &w, BUF as usize), Some(5000));
    }

    // Buffer-level scans, no flash involved.

    fn engine_with(buffer_content: &[u8]) -> (SearchEngine, usize) {
        let mut engine = SearchEngine::new();
        engine.buffer[..buffer_content.len()].copy_from_slice(buffer_content);
        (engine, buffer_content.len())
    }

    fn framed(id: u16, tdr: &[u8]) -> alloc::vec::Vec<u8> {
        let mut buffer = TdrBuffer::new(tdr);
        buffer.frame(id);
        buffer.as_bytes().to_vec()
    }

    #[test]
    fn test_scan_finds_record_after_garbage() {
        let mut content = vec![0xE1, 0x07, 0x33]; // garbage starting with SYNC
        content.extend(framed(0x0101, &[1, 2, 3]));
        let (engine, len) = engine_with(&content);

        let scan = engine.scan_buffer(Direction::Forwards, 0, len);
        let (parsed, sync_index, last_index) = scan.found.expect("record found");
        assert_eq!(parsed.record_id, 0x0101);
        assert_eq!(sync_index, 3, "garbage SYNC at 0 must be rejected");
        assert_eq!(last_index, len - 1);
    }

    #[test]
    fn test_scan_backwards_finds_last_record() {
        let mut content = framed(0x0001, &[1]);
        content.extend(framed(0x0002, &[2]));
        let (engine, len) = engine_with(&content);

        let scan = engine.scan_buffer(Direction::Backwards, len - 1, len);
        let (parsed, sync_index, _) = scan.found.expect("record found");
        assert_eq!(parsed.record_id, 0x0002);
        assert_eq!(sync_index, 9, "the later record wins backwards");
    }

    #[test]
    fn test_scan_ignores_record_straddling_buffer_end() {
        let full = framed(0x0005, &[7, 8, 9]);
        let cut = &full[..full.len() - 2]; // CRC half missing
        let (engine, len) = engine_with(cut);

        let scan = engine.scan_buffer(Direction::Forwards, 0, len);
        assert!(scan.found.is_none());
        assert_eq!(scan.checked, scan.max_check);
    }

    #[test]
    fn test_instance_counting_with_id_filter() {
        let p = SearchParams {
            direction: Direction::Forwards,
            partition_start: 0,
            partition_end: 0,
            search_start: 0,
            record_instance: 1,
            match_record_id: true,
            record_id: 0x42,
        };
        let mut counter = 0;
        assert!(!instance_matches(&p, 0x99, &mut counter), "wrong id ignored");
        assert_eq!(counter, 0, "non-matching ids are not counted");
        assert!(!instance_matches(&p, 0x42, &mut counter), "instance 0 skipped");
        assert_eq!(counter, 1);
        assert!(instance_matches(&p, 0x42, &mut counter), "instance 1 matches");
    }
}
