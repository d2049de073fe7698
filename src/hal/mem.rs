//! RAM-backed reference devices.
//!
//! These model the timing-free behaviour of the real parts closely enough
//! to develop and test the recording system on a host: the word device
//! honours NOR programming semantics (programming can only clear bits,
//! only erase sets them), the byte device overwrites freely like an
//! EEPROM. Both offer fault injection and inspection hooks.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::sync::CancelToken;

use super::{ByteDevice, DeviceFault, PhysicalArrangement, WordDevice};

/// RAM-backed word-addressable NOR flash.
///
/// Cloning yields another handle onto the same memory, so a test can keep
/// one handle for inspection while the registry owns the other.
#[derive(Clone)]
pub struct MemWordDevice {
    inner: Arc<WordInner>,
}

struct WordInner {
    row: PhysicalArrangement,
    words: Mutex<Vec<u16>>,
    fail_next_program: AtomicBool,
    timeout_forced: AtomicBool,
    erased_sectors: AtomicUsize,
}

impl MemWordDevice {
    pub fn new(row: PhysicalArrangement) -> Self {
        let bytes = (row.end_address - row.start_address + 1) as usize;
        MemWordDevice {
            inner: Arc::new(WordInner {
                row,
                words: Mutex::new(vec![0xFFFF; bytes / 2]),
                fail_next_program: AtomicBool::new(false),
                timeout_forced: AtomicBool::new(false),
                erased_sectors: AtomicUsize::new(0),
            }),
        }
    }

    fn index(&self, word_addr: u32) -> Result<usize, DeviceFault> {
        let base = self.inner.row.start_address / 2;
        let top = (self.inner.row.end_address + 1) / 2;
        if word_addr < base || word_addr >= top {
            return Err(DeviceFault::OutOfRange);
        }
        Ok((word_addr - base) as usize)
    }

    /// Make the next `program_words` call fail.
    pub fn fail_next_program(&self) {
        self.inner.fail_next_program.store(true, Ordering::SeqCst);
    }

    pub fn timeout_forced(&self) -> bool {
        self.inner.timeout_forced.load(Ordering::SeqCst)
    }

    /// Number of sector erases actually issued.
    pub fn erased_sectors(&self) -> usize {
        self.inner.erased_sectors.load(Ordering::SeqCst)
    }

    /// Direct inspection, bypassing the driver interface.
    pub fn peek_word(&self, word_addr: u32) -> u16 {
        let index = self.index(word_addr).expect("peek in range");
        self.inner.words.lock()[index]
    }

    /// Direct byte-level inspection (little-endian, as the HAL packs it).
    pub fn peek_bytes(&self, byte_addr: u32, len: usize) -> Vec<u8> {
        let words = self.inner.words.lock();
        let base = (self.inner.row.start_address / 2) as usize;
        let mut out = Vec::with_capacity(len);
        for offset in 0..len {
            let addr = byte_addr as usize + offset;
            let word = words[addr / 2 - base];
            out.push(if addr % 2 == 0 {
                (word & 0xFF) as u8
            } else {
                (word >> 8) as u8
            });
        }
        out
    }

    /// Direct mutation, bypassing programming rules. Used to model flash
    /// corruption in tests.
    pub fn poke_word(&self, word_addr: u32, value: u16) {
        let index = self.index(word_addr).expect("poke in range");
        self.inner.words.lock()[index] = value;
    }
}

impl WordDevice for MemWordDevice {
    fn read_word(&self, word_addr: u32) -> Result<u16, DeviceFault> {
        let index = self.index(word_addr)?;
        Ok(self.inner.words.lock()[index])
    }

    fn program_words(&self, word_addr: u32, words: &[u16]) -> Result<(), DeviceFault> {
        if self.inner.fail_next_program.swap(false, Ordering::SeqCst) {
            return Err(DeviceFault::WriteFail);
        }
        let start = self.index(word_addr)?;
        let mut memory = self.inner.words.lock();
        if start + words.len() > memory.len() {
            return Err(DeviceFault::OutOfRange);
        }
        for (offset, &word) in words.iter().enumerate() {
            // NOR programming can only clear bits.
            memory[start + offset] &= word;
        }
        Ok(())
    }

    fn erase_sector(&self, word_addr: u32) -> Result<(), DeviceFault> {
        let sector_words = (self.inner.row.block_size_bytes / 2) as usize;
        let start = self.index(word_addr)?;
        if start % sector_words != 0 {
            return Err(DeviceFault::OutOfRange);
        }
        let mut memory = self.inner.words.lock();
        for word in memory[start..start + sector_words].iter_mut() {
            *word = 0xFFFF;
        }
        self.inner.erased_sectors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sector_blank_check(&self, word_addr: u32) -> bool {
        let sector_words = (self.inner.row.block_size_bytes / 2) as usize;
        match self.index(word_addr) {
            Ok(start) => {
                let memory = self.inner.words.lock();
                memory[start..start + sector_words]
                    .iter()
                    .all(|&word| word == 0xFFFF)
            }
            Err(_) => false,
        }
    }

    fn force_timeout(&self) {
        self.inner.timeout_forced.store(true, Ordering::SeqCst);
    }
}

/// RAM-backed byte-addressable serial device (SPI flash or I2C EEPROM).
#[derive(Clone)]
pub struct MemByteDevice {
    inner: Arc<ByteInner>,
}

struct ByteInner {
    row: PhysicalArrangement,
    bytes: Mutex<Vec<u8>>,
    fail_next_write: AtomicBool,
    timeout_forced: AtomicBool,
    reads: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancelToken)>>,
}

impl MemByteDevice {
    pub fn new(row: PhysicalArrangement) -> Self {
        let size = (row.end_address - row.start_address + 1) as usize;
        MemByteDevice {
            inner: Arc::new(ByteInner {
                row,
                bytes: Mutex::new(vec![0xFF; size]),
                fail_next_write: AtomicBool::new(false),
                timeout_forced: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
                cancel_after: Mutex::new(None),
            }),
        }
    }

    fn index(&self, addr: u32, len: usize) -> Result<usize, DeviceFault> {
        let base = self.inner.row.start_address;
        if addr < base {
            return Err(DeviceFault::OutOfRange);
        }
        let start = (addr - base) as usize;
        if start + len > (self.inner.row.end_address - base + 1) as usize {
            return Err(DeviceFault::OutOfRange);
        }
        Ok(start)
    }

    /// Make the next `block_write` call fail.
    pub fn fail_next_write(&self) {
        self.inner.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn timeout_forced(&self) -> bool {
        self.inner.timeout_forced.load(Ordering::SeqCst)
    }

    /// Number of `block_read` calls issued so far.
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Fire `token.cancel()` once `reads` further block reads have been
    /// served. Stands in for the timer that aborts a dragging search.
    pub fn cancel_after_reads(&self, reads: usize, token: CancelToken) {
        *self.inner.cancel_after.lock() = Some((reads, token));
    }

    /// Direct inspection, bypassing the driver interface.
    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let start = self.index(addr, len).expect("peek in range");
        self.inner.bytes.lock()[start..start + len].to_vec()
    }

    /// Direct mutation, bypassing the driver interface. Used to model
    /// flash corruption in tests.
    pub fn poke(&self, addr: u32, value: u8) {
        let start = self.index(addr, 1).expect("poke in range");
        self.inner.bytes.lock()[start] = value;
    }
}

impl ByteDevice for MemByteDevice {
    fn block_read(&self, addr: u32, out: &mut [u8]) -> Result<(), DeviceFault> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let mut hook = self.inner.cancel_after.lock();
        if let Some((remaining, token)) = hook.as_mut() {
            if *remaining == 0 {
                token.cancel();
            } else {
                *remaining -= 1;
            }
        }
        drop(hook);

        let start = self.index(addr, out.len())?;
        out.copy_from_slice(&self.inner.bytes.lock()[start..start + out.len()]);
        Ok(())
    }

    fn block_write(&self, addr: u32, data: &[u8]) -> Result<(), DeviceFault> {
        if self.inner.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(DeviceFault::WriteFail);
        }
        let start = self.index(addr, data.len())?;
        self.inner.bytes.lock()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn force_timeout(&self) {
        self.inner.timeout_forced.store(true, Ordering::SeqCst);
    }
}
