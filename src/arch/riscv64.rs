use byteorder::{ByteOrder, LittleEndian};

use super::{sign_extend, ArchPatch, Insn, JumpType};
use crate::ids::TextAddr;
use crate::text::{fits_in_word, InsnBytes};

// addi x0, x0, 0
const NOP: u32 = 0x0000_0013;
// jal x0, <imm>
const JAL_X0: u32 = 0x0000_006f;
const JAL_X0_MASK: u32 = 0x0000_0fff;

/// `nop` / `jal x0, <target>`, assembled without compressed instructions so
/// both forms are one aligned 32-bit word.
#[derive(Debug, Default)]
pub struct Riscv64;

impl Riscv64 {
    pub const fn new() -> Self {
        Riscv64
    }
}

fn jal_imm(site: TextAddr, target: TextAddr) -> Option<u32> {
    let offset = site.distance_to(target);
    if offset % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&offset) {
        return None;
    }
    let imm = offset as u32;
    Some(
        ((imm & 0x10_0000) << 11)
            | ((imm & 0x7fe) << 20)
            | ((imm & 0x800) << 9)
            | (imm & 0xf_f000),
    )
}

fn jal_offset(word: u32) -> i64 {
    let imm = ((word >> 31) & 1) << 20
        | ((word >> 21) & 0x3ff) << 1
        | ((word >> 20) & 1) << 11
        | ((word >> 12) & 0xff) << 12;
    sign_extend(imm, 21)
}

impl ArchPatch for Riscv64 {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn insn_len(&self, site: TextAddr, target: TextAddr) -> Option<usize> {
        jal_imm(site, target).map(|_| 4)
    }

    fn encode(&self, ty: JumpType, site: TextAddr, target: TextAddr) -> Option<InsnBytes> {
        let word = match ty {
            JumpType::Nop => NOP,
            JumpType::Jmp => JAL_X0 | jal_imm(site, target)?,
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
        } else if word & JAL_X0_MASK == JAL_X0 {
            site.offset(jal_offset(word)).map(Insn::Jump)
        } else {
            None
        }
    }

    fn can_store_atomically(&self, site: TextAddr, len: usize) -> bool {
        site.is_aligned(4) && fits_in_word(site, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jal_matches_assembler_output() {
        // jal x0, 8
        let bytes = Riscv64
            .encode(JumpType::Jmp, TextAddr::new(0x100), TextAddr::new(0x108))
            .unwrap();
        assert_eq!(LittleEndian::read_u32(&bytes), 0x0080_006f);
        // jal x0, -4
        let bytes = Riscv64
            .encode(JumpType::Jmp, TextAddr::new(0x100), TextAddr::new(0x0fc))
            .unwrap();
        assert_eq!(LittleEndian::read_u32(&bytes), 0xffdf_f06f);
    }

    #[test]
    fn out_of_range_target_is_unsupported() {
        assert_eq!(
            Riscv64.insn_len(TextAddr::new(0), TextAddr::new(1 << 20)),
            None
        );
    }
}
