//! Keys: the counted flags that branch sites test.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::ids::{FlagId, UnitId};
use crate::system::JumpLabels;

/// Count value while the first enable is patching sites.
const UPDATING: i32 = -1;

pub struct KeyState {
    id: FlagId,
    name: &'static str,
    default: bool,
    owner: UnitId,
    // > 0: enabled; 0: disabled; UPDATING: first enable in progress.
    enabled: AtomicI32,
}

impl KeyState {
    pub(crate) fn new(id: FlagId, name: &'static str, default: bool, owner: UnitId) -> Self {
        Self {
            id,
            name,
            default,
            owner,
            enabled: AtomicI32::new(i32::from(default)),
        }
    }

    pub fn id(&self) -> FlagId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default(&self) -> bool {
        self.default
    }

    pub fn owner(&self) -> UnitId {
        self.owner
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) > 0
    }

    /// The count, with an in-progress first enable reading as one.
    pub fn count(&self) -> i32 {
        match self.enabled.load(Ordering::Acquire) {
            UPDATING => 1,
            n => n,
        }
    }

    /// Increments unless that would take the count off zero.
    fn inc_not_disabled(&self) -> bool {
        let mut v = self.enabled.load(Ordering::Relaxed);
        while v > 0 && v < i32::MAX {
            match self
                .enabled
                .compare_exchange_weak(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => v = actual,
            }
        }
        false
    }

    /// Decrements unless that would take the count to zero.
    fn dec_unless_one(&self) -> bool {
        let mut v = self.enabled.load(Ordering::Relaxed);
        while v > 1 {
            match self
                .enabled
                .compare_exchange_weak(v, v - 1, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => v = actual,
            }
        }
        false
    }

    /// Prepares a move to `enabled` under the update lock. Returns true if the
    /// key changes direction, in which case its sites must be patched and,
    /// for an enable, `finish_enable` called afterwards.
    pub(crate) fn begin_set(&self, enabled: bool) -> bool {
        if enabled {
            if self
                .enabled
                .compare_exchange(0, UPDATING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            let v = self.enabled.load(Ordering::Relaxed);
            if v != 1 {
                log::warn!("key {} ({}) set while counted at {}", self.name, self.id, v);
            }
            false
        } else {
            let mut v = self.enabled.load(Ordering::Relaxed);
            while v > 0 {
                if v != 1 {
                    log::warn!("key {} ({}) cleared while counted at {}", self.name, self.id, v);
                }
                match self
                    .enabled
                    .compare_exchange(v, 0, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => return true,
                    Err(actual) => v = actual,
                }
            }
            false
        }
    }

    pub(crate) fn finish_enable(&self) {
        self.enabled.store(1, Ordering::Release);
    }

    /// Counted enable under the update lock: true if this is the first.
    pub(crate) fn begin_inc(&self) -> bool {
        if self
            .enabled
            .compare_exchange(0, UPDATING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        if !self.inc_not_disabled() {
            log::warn!("key {} ({}) count saturated", self.name, self.id);
        }
        false
    }

    /// Counted disable under the update lock: true if this was the last.
    pub(crate) fn begin_dec(&self) -> bool {
        loop {
            if self.dec_unless_one() {
                return false;
            }
            match self
                .enabled
                .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(0) => {
                    log::warn!("key {} ({}) disabled more often than enabled", self.name, self.id);
                    return false;
                }
                Err(_) => continue,
            }
        }
    }
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("default", &self.default)
            .field("count", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

/// A handle on a key for the code that flips it.
#[derive(Clone)]
pub struct StaticKey<'s> {
    sys: &'s JumpLabels,
    state: Arc<KeyState>,
}

impl<'s> StaticKey<'s> {
    pub(crate) fn new(sys: &'s JumpLabels, state: Arc<KeyState>) -> Self {
        Self { sys, state }
    }

    pub(crate) fn state(&self) -> &Arc<KeyState> {
        &self.state
    }

    pub(crate) fn system(&self) -> &'s JumpLabels {
        self.sys
    }

    pub fn id(&self) -> FlagId {
        self.state.id
    }

    pub fn name(&self) -> &'static str {
        self.state.name
    }

    pub fn default(&self) -> bool {
        self.state.default
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    pub fn count(&self) -> i32 {
        self.state.count()
    }

    /// Takes a reference. The first one patches every site of the key.
    pub fn enable(&self) {
        if self.state.inc_not_disabled() {
            return;
        }
        self.sys.key_inc(&self.state);
    }

    /// Drops a reference. The last one patches every site of the key.
    pub fn disable(&self) {
        if self.state.dec_unless_one() {
            return;
        }
        self.sys.key_dec(&self.state);
    }

    /// Sets the key regardless of its count: enabling a disabled key leaves a
    /// count of one, disabling clears it.
    pub fn set(&self, enabled: bool) {
        self.sys.key_set(&self.state, enabled);
    }
}

impl fmt::Debug for StaticKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(default: bool) -> KeyState {
        KeyState::new(FlagId::new(1), "test", default, UnitId::CORE)
    }

    #[test]
    fn initial_count_follows_default() {
        assert_eq!(state(true).count(), 1);
        assert!(state(true).is_enabled());
        assert_eq!(state(false).count(), 0);
    }

    #[test]
    fn first_inc_and_last_dec_report_transitions() {
        let key = state(false);
        assert!(key.begin_inc());
        assert!(!key.is_enabled());
        assert_eq!(key.count(), 1);
        key.finish_enable();
        assert!(!key.begin_inc());
        assert_eq!(key.count(), 2);

        assert!(!key.begin_dec());
        assert!(key.begin_dec());
        assert!(!key.begin_dec());
        assert_eq!(key.count(), 0);
    }

    #[test]
    fn set_clears_any_count() {
        let key = state(true);
        assert!(key.inc_not_disabled());
        assert!(key.begin_set(false));
        assert_eq!(key.count(), 0);
        assert!(!key.begin_set(false));
        assert!(key.begin_set(true));
        key.finish_enable();
        assert!(!key.begin_set(true));
    }
}
