//! Grouping key changes so their sites are rewritten in one patch pass.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::key::{KeyState, StaticKey};
use crate::system::JumpLabels;

/// Key changes staged by one caller. Staging touches neither the keys nor
/// the text; `commit` applies everything with a single patch pass, so the
/// synchronization broadcasts are paid once for the whole batch. A batch
/// dropped without committing has no effect.
#[must_use = "a batch does nothing unless committed"]
pub struct Batch<'s> {
    sys: &'s JumpLabels,
    staged: Vec<(Arc<KeyState>, bool)>,
}

impl<'s> Batch<'s> {
    pub fn new(sys: &'s JumpLabels) -> Self {
        Self {
            sys,
            staged: Vec::new(),
        }
    }

    /// Stages `key` to end up `enabled`. Staging the same key again replaces
    /// the earlier request. A key of another registry is refused.
    pub fn stage(&mut self, key: &StaticKey<'_>, enabled: bool) -> Result<&mut Self> {
        if !core::ptr::eq(key.system(), self.sys) {
            return Err(Error::UnknownKey { key: key.id() });
        }
        match self
            .staged
            .iter_mut()
            .find(|(state, _)| state.id() == key.id())
        {
            Some(slot) => slot.1 = enabled,
            None => self.staged.push((key.state().clone(), enabled)),
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Applies every staged change. Returns how many keys changed direction.
    pub fn commit(mut self) -> usize {
        let staged = core::mem::take(&mut self.staged);
        self.sys.commit_batch(&staged)
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            log::debug!("discarding {} staged key changes", self.staged.len());
        }
    }
}
