//! Executable text.
//!
//! The region is a run of little-endian 64-bit words. Every load and store is
//! a single atomic word access, so a fetch of bytes that lie inside one word
//! observes either all of a store to that word or none of it. Fetches that
//! span two words can see a mix of two stores; the patcher never lets that
//! happen to a live instruction.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arrayvec::ArrayVec;

use crate::config::{MAX_INSN_LEN, TEXT_WORD};
use crate::error::{Error, Result};
use crate::ids::TextAddr;

pub type InsnBytes = ArrayVec<u8, MAX_INSN_LEN>;

pub struct TextRegion {
    words: Vec<AtomicU64>,
    /// Bump pointer for unit allocations.
    next: AtomicUsize,
}

fn word_index(addr: usize) -> (usize, u32) {
    (addr / TEXT_WORD, (addr % TEXT_WORD) as u32 * 8)
}

impl TextRegion {
    pub fn new(words: usize) -> Self {
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len() * TEXT_WORD
    }

    pub fn available(&self) -> usize {
        self.len().saturating_sub(self.next.load(Ordering::Relaxed))
    }

    /// Reserves `size` bytes aligned to one word. Text is never reused once
    /// handed out.
    pub fn reserve(&self, size: usize) -> Result<TextAddr> {
        let size = size.next_multiple_of(TEXT_WORD);
        let mut start = self.next.load(Ordering::Relaxed);
        loop {
            let end = start
                .checked_add(size)
                .filter(|end| *end <= self.len())
                .ok_or(Error::TextExhausted {
                    requested: size,
                    available: self.len().saturating_sub(start),
                })?;
            match self
                .next
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(TextAddr::new(start)),
                Err(actual) => start = actual,
            }
        }
    }

    pub fn contains(&self, addr: TextAddr, len: usize) -> bool {
        addr.get()
            .checked_add(len)
            .is_some_and(|end| end <= self.len())
    }

    /// Reads `len` bytes, loading each word they touch exactly once, in
    /// ascending order.
    pub fn read(&self, addr: TextAddr, len: usize) -> InsnBytes {
        let mut out = InsnBytes::new();
        let mut cached: Option<(usize, u64)> = None;
        for i in 0..len.min(MAX_INSN_LEN) {
            let (index, shift) = word_index(addr.get() + i);
            let word = match cached {
                Some((cached_index, word)) if cached_index == index => word,
                _ => {
                    let word = self.words[index].load(Ordering::Acquire);
                    cached = Some((index, word));
                    word
                }
            };
            out.push((word >> shift) as u8);
        }
        out
    }

    /// Stores `bytes` at `addr`, one atomic read-modify-write per word touched.
    ///
    /// # Safety
    ///
    /// When `bytes` spans more than one word, concurrent fetches of the range
    /// may observe a mix of old and new bytes. The caller must guarantee no
    /// CPU executes the range until the store is complete.
    pub unsafe fn write(&self, addr: TextAddr, bytes: &[u8]) {
        let mut i = 0;
        while i < bytes.len() {
            let (index, shift) = word_index(addr.get() + i);
            let in_word = (TEXT_WORD - (shift / 8) as usize).min(bytes.len() - i);

            let mut mask = 0u64;
            let mut value = 0u64;
            for (j, byte) in bytes[i..i + in_word].iter().enumerate() {
                let s = shift + j as u32 * 8;
                mask |= 0xff << s;
                value |= u64::from(*byte) << s;
            }
            self.merge_word(index, mask, value);
            i += in_word;
        }
    }

    /// Stores `bytes` with a single atomic word update. Returns false, leaving
    /// the text untouched, if the range crosses a word boundary.
    pub fn write_atomic(&self, addr: TextAddr, bytes: &[u8]) -> bool {
        if !fits_in_word(addr, bytes.len()) {
            return false;
        }
        // SAFETY: A single-word store is observed atomically.
        unsafe { self.write(addr, bytes) };
        true
    }

    fn merge_word(&self, index: usize, mask: u64, value: u64) {
        let word = &self.words[index];
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let new = (current & !mask) | value;
            match word.compare_exchange_weak(current, new, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Whether `len` bytes at `addr` sit inside one text word.
pub fn fits_in_word(addr: TextAddr, len: usize) -> bool {
    len != 0 && len <= TEXT_WORD && addr.get() / TEXT_WORD == (addr.get() + len - 1) / TEXT_WORD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_across_words() {
        let text = TextRegion::new(4);
        let bytes = [1, 2, 3, 4, 5];
        unsafe { text.write(TextAddr::new(6), &bytes) };
        assert_eq!(text.read(TextAddr::new(6), 5).as_slice(), &bytes);
        assert_eq!(text.read(TextAddr::new(5), 2).as_slice(), &[0, 1]);
        assert_eq!(text.read(TextAddr::new(10), 2).as_slice(), &[5, 0]);
    }

    #[test]
    fn atomic_write_refuses_to_straddle() {
        let text = TextRegion::new(2);
        assert!(!text.write_atomic(TextAddr::new(6), &[0xaa; 4]));
        assert_eq!(text.read(TextAddr::new(6), 4).as_slice(), &[0; 4]);
        assert!(text.write_atomic(TextAddr::new(4), &[0xaa; 4]));
        assert_eq!(text.read(TextAddr::new(4), 4).as_slice(), &[0xaa; 4]);
    }

    #[test]
    fn reserve_is_word_aligned_and_bounded() {
        let text = TextRegion::new(4);
        assert_eq!(text.reserve(3).unwrap(), TextAddr::new(0));
        assert_eq!(text.reserve(9).unwrap(), TextAddr::new(8));
        assert_eq!(
            text.reserve(16),
            Err(Error::TextExhausted {
                requested: 16,
                available: 8
            })
        );
        assert_eq!(text.available(), 8);
    }

    #[test]
    fn fits_in_word_edges() {
        assert!(fits_in_word(TextAddr::new(0), 8));
        assert!(fits_in_word(TextAddr::new(3), 5));
        assert!(!fits_in_word(TextAddr::new(4), 5));
        assert!(!fits_in_word(TextAddr::new(0), 0));
    }
}
