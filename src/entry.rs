//! Side-table records.
//!
//! A unit's jump table section is a flat array of `ENTRY_SIZE`-byte
//! little-endian records:
//!
//! | offset | size | field                                          |
//! |--------|------|------------------------------------------------|
//! | 0      | 4    | site, relative to the start of the unit's text |
//! | 4      | 4    | jump target, relative to the same base         |
//! | 8      | 8    | `key << 2 \| flags`                            |
//!
//! Keeping every field relative to the unit makes the section position
//! independent, so the loader merges records without relocating them.

use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};

use crate::arch::JumpType;
use crate::config::ENTRY_SIZE;
use crate::error::{Error, Result};
use crate::ids::{FlagId, TextAddr, UnitId};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        /// The site reports true when the jump is not taken. Set for
        /// branches marked likely.
        const BRANCH = 1;
        /// The site lives in init text that is discarded after the unit
        /// finishes initializing.
        const INIT = 2;
    }
}

const FLAG_BITS: u32 = 2;

/// One record as it appears in a section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEntry {
    pub code: u32,
    pub target: u32,
    pub key: u64,
}

impl RawEntry {
    pub fn new(code: u32, target: u32, key: FlagId, flags: EntryFlags) -> Self {
        Self {
            code,
            target,
            key: u64::from(key.get()) << FLAG_BITS | flags.bits(),
        }
    }

    pub fn key(&self) -> FlagId {
        FlagId::new((self.key >> FLAG_BITS) as u32)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.key)
    }

    pub fn write(&self, out: &mut [u8; ENTRY_SIZE]) {
        LittleEndian::write_u32(&mut out[0..4], self.code);
        LittleEndian::write_u32(&mut out[4..8], self.target);
        LittleEndian::write_u64(&mut out[8..16], self.key);
    }

    pub fn read(bytes: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            code: LittleEndian::read_u32(&bytes[0..4]),
            target: LittleEndian::read_u32(&bytes[4..8]),
            key: LittleEndian::read_u64(&bytes[8..16]),
        }
    }

    /// Resolves the record against the text base of the unit it belongs to.
    pub fn resolve(&self, unit: UnitId, base: TextAddr, len: u8) -> JumpEntry {
        JumpEntry {
            code: base.add(self.code as usize),
            target: base.add(self.target as usize),
            key: self.key(),
            flags: self.flags(),
            unit,
            len,
        }
    }
}

pub fn parse_section(bytes: &[u8]) -> Result<Vec<RawEntry>> {
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(Error::MalformedSection {
            offset: bytes.len() - bytes.len() % ENTRY_SIZE,
        });
    }
    Ok(bytes
        .chunks_exact(ENTRY_SIZE)
        .filter_map(|chunk| <&[u8; ENTRY_SIZE]>::try_from(chunk).ok())
        .map(RawEntry::read)
        .collect())
}

pub fn write_section(entries: &[RawEntry]) -> Vec<u8> {
    let mut out = vec![0; entries.len() * ENTRY_SIZE];
    for (entry, chunk) in entries.iter().zip(out.chunks_exact_mut(ENTRY_SIZE)) {
        if let Ok(chunk) = <&mut [u8; ENTRY_SIZE]>::try_from(chunk) {
            entry.write(chunk);
        }
    }
    out
}

/// A registered site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JumpEntry {
    pub code: TextAddr,
    pub target: TextAddr,
    pub key: FlagId,
    pub flags: EntryFlags,
    pub unit: UnitId,
    /// Length of the instruction at `code`.
    pub len: u8,
}

impl JumpEntry {
    pub fn is_branch(&self) -> bool {
        self.flags.contains(EntryFlags::BRANCH)
    }

    pub fn is_init(&self) -> bool {
        self.flags.contains(EntryFlags::INIT)
    }

    /// The instruction the site must hold while its key is `enabled`.
    pub fn jump_type(&self, enabled: bool) -> JumpType {
        JumpType::from_taken(enabled ^ self.is_branch())
    }

    /// What the branch reports when the CPU decodes `ty` at the site.
    pub fn outcome(&self, ty: JumpType) -> bool {
        (ty == JumpType::Jmp) ^ self.is_branch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let entry = RawEntry::new(0x10, 0x40, FlagId::new(3), EntryFlags::BRANCH);
        let bytes = write_section(&[entry]);
        assert_eq!(
            bytes,
            [0x10, 0, 0, 0, 0x40, 0, 0, 0, 0x0d, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(parse_section(&bytes), Ok(vec![entry]));
        assert_eq!(entry.key(), FlagId::new(3));
        assert_eq!(entry.flags(), EntryFlags::BRANCH);
    }

    #[test]
    fn truncated_section_is_rejected() {
        assert_eq!(
            parse_section(&[0; ENTRY_SIZE + 3]),
            Err(Error::MalformedSection { offset: ENTRY_SIZE })
        );
    }

    #[test]
    fn likely_and_unlikely_polarity() {
        let raw = RawEntry::new(0, 8, FlagId::new(1), EntryFlags::empty());
        let unlikely = raw.resolve(UnitId::new(1), TextAddr::new(0x100), 2);
        assert_eq!(unlikely.jump_type(false), JumpType::Nop);
        assert_eq!(unlikely.jump_type(true), JumpType::Jmp);
        assert!(unlikely.outcome(JumpType::Jmp));

        let raw = RawEntry::new(0, 8, FlagId::new(1), EntryFlags::BRANCH | EntryFlags::INIT);
        let likely = raw.resolve(UnitId::new(1), TextAddr::new(0x100), 2);
        assert!(likely.is_init());
        assert_eq!(likely.jump_type(true), JumpType::Nop);
        assert!(likely.outcome(JumpType::Nop));
        assert!(!likely.outcome(JumpType::Jmp));
        assert_eq!(likely.code, TextAddr::new(0x100));
        assert_eq!(likely.target, TextAddr::new(0x108));
    }
}
