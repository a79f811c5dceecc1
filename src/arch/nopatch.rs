use super::{ArchPatch, Insn, JumpType};
use crate::ids::TextAddr;
use crate::text::InsnBytes;

/// Targets without safe text patching. Sites occupy no text and every branch
/// loads its key's count.
#[derive(Debug, Default)]
pub struct NoPatch;

impl NoPatch {
    pub const fn new() -> Self {
        NoPatch
    }
}

impl ArchPatch for NoPatch {
    fn name(&self) -> &'static str {
        "nopatch"
    }

    fn patchable(&self) -> bool {
        false
    }

    fn insn_len(&self, _site: TextAddr, _target: TextAddr) -> Option<usize> {
        Some(0)
    }

    fn encode(&self, _ty: JumpType, _site: TextAddr, _target: TextAddr) -> Option<InsnBytes> {
        Some(InsnBytes::new())
    }

    fn decode(&self, _bytes: &[u8], _site: TextAddr) -> Option<Insn> {
        None
    }

    fn can_store_atomically(&self, _site: TextAddr, _len: usize) -> bool {
        false
    }
}
