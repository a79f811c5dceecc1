//! Per-architecture branch encodings.
//!
//! Every patchable site holds one of two instructions of identical length: a
//! no-op that falls through, or an unconditional jump to the site's target.
//! An architecture describes how to encode and decode both, and whether a
//! given site can be rewritten without a fetching CPU ever seeing a mix of the
//! two.

use crate::error::{Error, Result};
use crate::ids::TextAddr;
use crate::text::{fits_in_word, InsnBytes};

pub mod aarch64;
pub mod nopatch;
pub mod riscv64;
pub mod x86_64;

pub use self::aarch64::Aarch64;
pub use self::nopatch::NoPatch;
pub use self::riscv64::Riscv64;
pub use self::x86_64::X86_64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JumpType {
    Nop,
    Jmp,
}

impl JumpType {
    pub const fn from_taken(taken: bool) -> Self {
        if taken {
            JumpType::Jmp
        } else {
            JumpType::Nop
        }
    }
}

/// A decoded site, as seen by a fetching CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insn {
    Nop,
    Jump(TextAddr),
    /// The first byte is a breakpoint planted by an in-progress patch.
    Trap,
}

impl Insn {
    pub fn jump_type(self) -> Option<JumpType> {
        match self {
            Insn::Nop => Some(JumpType::Nop),
            Insn::Jump(_) => Some(JumpType::Jmp),
            Insn::Trap => None,
        }
    }
}

pub trait ArchPatch: Sync {
    fn name(&self) -> &'static str;

    /// False for targets that cannot rewrite text at all; every branch then
    /// tests its key's count instead.
    fn patchable(&self) -> bool {
        true
    }

    /// Length of the instruction used for a site jumping to `target`, or
    /// `None` if the target is out of range.
    fn insn_len(&self, site: TextAddr, target: TextAddr) -> Option<usize>;

    fn encode(&self, ty: JumpType, site: TextAddr, target: TextAddr) -> Option<InsnBytes>;

    fn decode(&self, bytes: &[u8], site: TextAddr) -> Option<Insn>;

    /// Whether `len` bytes at `site` can be replaced with one store that every
    /// CPU observes atomically.
    fn can_store_atomically(&self, site: TextAddr, len: usize) -> bool {
        fits_in_word(site, len)
    }

    /// Single-byte breakpoint used to fence a site off while a wider write is
    /// in progress, if the architecture has one.
    fn trap_opcode(&self) -> Option<u8> {
        None
    }

    /// Checks that a site can be patched in both directions and returns the
    /// length of its instruction.
    fn check_site(&self, site: TextAddr, target: TextAddr) -> Result<usize> {
        let len = self
            .insn_len(site, target)
            .ok_or(Error::PatchUnsupported { site })?;
        if !self.can_store_atomically(site, len) && self.trap_opcode().is_none() {
            return Err(Error::PatchUnsupported { site });
        }
        for ty in [JumpType::Nop, JumpType::Jmp] {
            let bytes = self
                .encode(ty, site, target)
                .ok_or(Error::PatchUnsupported { site })?;
            if bytes.len() != len {
                return Err(Error::PatchUnsupported { site });
            }
        }
        Ok(len)
    }
}

#[cfg(target_arch = "x86_64")]
pub type NativeArch = X86_64;

#[cfg(target_arch = "aarch64")]
pub type NativeArch = Aarch64;

#[cfg(target_arch = "riscv64")]
pub type NativeArch = Riscv64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
pub type NativeArch = NoPatch;

/// The encoding for the target this crate was built for.
pub fn native() -> &'static dyn ArchPatch {
    static NATIVE: NativeArch = NativeArch::new();
    &NATIVE
}

pub(crate) fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((u64::from(value) << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(arch: &dyn ArchPatch, site: TextAddr, target: TextAddr) {
        let len = arch.check_site(site, target).unwrap();
        let nop = arch.encode(JumpType::Nop, site, target).unwrap();
        let jmp = arch.encode(JumpType::Jmp, site, target).unwrap();
        assert_eq!(nop.len(), len);
        assert_eq!(jmp.len(), len);
        assert_eq!(arch.decode(&nop, site), Some(Insn::Nop));
        assert_eq!(arch.decode(&jmp, site), Some(Insn::Jump(target)));
    }

    #[test]
    fn every_arch_decodes_what_it_encodes() {
        for arch in [&X86_64 as &dyn ArchPatch, &Aarch64, &Riscv64] {
            round_trip(arch, TextAddr::new(0x100), TextAddr::new(0x140));
            round_trip(arch, TextAddr::new(0x4000), TextAddr::new(0x100));
        }
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0x3ff_ffff, 26), -1);
        assert_eq!(sign_extend(0x1ff_ffff, 26), 0x1ff_ffff);
        assert_eq!(sign_extend(0x80, 8), -128);
    }

    #[test]
    fn native_is_selected_at_build_time() {
        let native = native();
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")) {
            assert!(native.patchable());
        } else {
            assert!(!native.patchable());
        }
    }
}
