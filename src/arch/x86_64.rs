use byteorder::{ByteOrder, LittleEndian};

use super::{ArchPatch, Insn, JumpType};
use crate::ids::TextAddr;
use crate::text::InsnBytes;

const INT3: u8 = 0xcc;
const JMP8: u8 = 0xeb;
const JMP32: u8 = 0xe9;

// Recommended multi-byte NOPs from the "Software Optimization Guide for AMD
// Family 19h Processors".
const NOP2: [u8; 2] = [0x66, 0x90];
const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

/// Two-byte `jmp rel8` / `nop` when the target is near, five-byte
/// `jmp rel32` / `nopl 0x0(%rax,%rax,1)` otherwise.
#[derive(Debug, Default)]
pub struct X86_64;

impl X86_64 {
    pub const fn new() -> Self {
        X86_64
    }
}

fn disp(site: TextAddr, len: usize, target: TextAddr) -> i64 {
    site.add(len).distance_to(target)
}

impl ArchPatch for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn insn_len(&self, site: TextAddr, target: TextAddr) -> Option<usize> {
        if i8::try_from(disp(site, 2, target)).is_ok() {
            Some(2)
        } else if i32::try_from(disp(site, 5, target)).is_ok() {
            Some(5)
        } else {
            None
        }
    }

    fn encode(&self, ty: JumpType, site: TextAddr, target: TextAddr) -> Option<InsnBytes> {
        let len = self.insn_len(site, target)?;
        let mut insn = InsnBytes::new();
        match (ty, len) {
            (JumpType::Nop, 2) => insn.try_extend_from_slice(&NOP2).ok()?,
            (JumpType::Nop, _) => insn.try_extend_from_slice(&NOP5).ok()?,
            (JumpType::Jmp, 2) => {
                insn.push(JMP8);
                insn.push(disp(site, 2, target) as i8 as u8);
            }
            (JumpType::Jmp, _) => {
                let mut rel = [0; 4];
                LittleEndian::write_i32(&mut rel, disp(site, 5, target) as i32);
                insn.push(JMP32);
                insn.try_extend_from_slice(&rel).ok()?;
            }
        }
        Some(insn)
    }

    fn decode(&self, bytes: &[u8], site: TextAddr) -> Option<Insn> {
        match bytes {
            [INT3, ..] => Some(Insn::Trap),
            [0x66, 0x90] => Some(Insn::Nop),
            [0x0f, 0x1f, 0x44, 0x00, 0x00] => Some(Insn::Nop),
            [JMP8, rel] => site.add(2).offset(i64::from(*rel as i8)).map(Insn::Jump),
            [JMP32, rel @ ..] if rel.len() == 4 => site
                .add(5)
                .offset(i64::from(LittleEndian::read_i32(rel)))
                .map(Insn::Jump),
            _ => None,
        }
    }

    fn trap_opcode(&self) -> Option<u8> {
        Some(INT3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_when_target_is_near() {
        let site = TextAddr::new(0x100);
        assert_eq!(X86_64.insn_len(site, TextAddr::new(0x102 + 127)), Some(2));
        assert_eq!(X86_64.insn_len(site, TextAddr::new(0x102 + 128)), Some(5));
        assert_eq!(X86_64.insn_len(site, TextAddr::new(0x102 - 128)), Some(2));
        assert_eq!(X86_64.insn_len(site, TextAddr::new(0x102 - 129)), Some(5));
    }

    #[test]
    fn encodings_match_the_manual() {
        let site = TextAddr::new(0x100);
        let near = TextAddr::new(0x110);
        let far = TextAddr::new(0x1000);

        assert_eq!(X86_64.encode(JumpType::Nop, site, near).unwrap().as_slice(), &NOP2);
        assert_eq!(X86_64.encode(JumpType::Jmp, site, near).unwrap().as_slice(), &[0xeb, 0x0e]);
        assert_eq!(X86_64.encode(JumpType::Nop, site, far).unwrap().as_slice(), &NOP5);
        assert_eq!(
            X86_64.encode(JumpType::Jmp, site, far).unwrap().as_slice(),
            &[0xe9, 0xfb, 0x0e, 0x00, 0x00]
        );
    }

    #[test]
    fn trap_byte_decodes_as_trap() {
        assert_eq!(
            X86_64.decode(&[INT3, 0x1f, 0x44, 0x00, 0x00], TextAddr::new(0)),
            Some(Insn::Trap)
        );
        assert_eq!(X86_64.decode(&[0x90, 0x90], TextAddr::new(0)), None);
    }

    #[test]
    fn straddling_sites_are_still_patchable() {
        // Crosses a text word, but the breakpoint protocol covers it.
        assert_eq!(X86_64.check_site(TextAddr::new(6), TextAddr::new(0x400)), Ok(5));
        assert!(!X86_64.can_store_atomically(TextAddr::new(6), 5));
    }
}
