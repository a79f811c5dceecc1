use byteorder::{ByteOrder, LittleEndian};

use super::{sign_extend, ArchPatch, Insn, JumpType};
use crate::ids::TextAddr;
use crate::text::{fits_in_word, InsnBytes};

const NOP: u32 = 0xd503_201f;
const B: u32 = 0x1400_0000;
const B_MASK: u32 = 0xfc00_0000;
const IMM26: u32 = 0x03ff_ffff;

/// `nop` / `b <target>`, both a single aligned 32-bit word.
#[derive(Debug, Default)]
pub struct Aarch64;

impl Aarch64 {
    pub const fn new() -> Self {
        Aarch64
    }
}

fn imm26(site: TextAddr, target: TextAddr) -> Option<u32> {
    let offset = site.distance_to(target);
    // +/-128MiB in units of one instruction.
    if offset % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&offset) {
        return None;
    }
    Some((offset >> 2) as u32 & IMM26)
}

impl ArchPatch for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn insn_len(&self, site: TextAddr, target: TextAddr) -> Option<usize> {
        imm26(site, target).map(|_| 4)
    }

    fn encode(&self, ty: JumpType, site: TextAddr, target: TextAddr) -> Option<InsnBytes> {
        let word = match ty {
            JumpType::Nop => NOP,
            JumpType::Jmp => B | imm26(site, target)?,
        };
        let mut insn = InsnBytes::new();
        insn.try_extend_from_slice(&word.to_le_bytes()).ok()?;
        Some(insn)
    }

    fn decode(&self, bytes: &[u8], site: TextAddr) -> Option<Insn> {
        if bytes.len() != 4 {
            return None;
        }
        let word = LittleEndian::read_u32(bytes);
        if word == NOP {
            Some(Insn::Nop)
        } else if word & B_MASK == B {
            site.offset(sign_extend(word & IMM26, 26) << 2).map(Insn::Jump)
        } else {
            None
        }
    }

    fn can_store_atomically(&self, site: TextAddr, len: usize) -> bool {
        site.is_aligned(4) && fits_in_word(site, len)
    }
}
