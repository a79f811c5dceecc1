//! The side table: every registered site, grouped by key.
//!
//! Entries are kept sorted by `(key, site)` so all sites of one key form a
//! contiguous run. A patch pass walks that run front to back instead of
//! chasing a hash bucket per site.

use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::entry::JumpEntry;
use crate::error::{Error, Result};
use crate::ids::{FlagId, TextAddr, UnitId};

/// Answers whether code of an unloading unit can still be executed.
///
/// Finding live frames is the module loader's job; the side table only asks.
pub trait Reachability {
    fn is_reachable(&self, unit: UnitId, site: TextAddr) -> bool;
}

impl<F> Reachability for F
where
    F: Fn(UnitId, TextAddr) -> bool,
{
    fn is_reachable(&self, unit: UnitId, site: TextAddr) -> bool {
        self(unit, site)
    }
}

/// Every CPU has left the unit.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quiescent;

impl Reachability for Quiescent {
    fn is_reachable(&self, _unit: UnitId, _site: TextAddr) -> bool {
        false
    }
}

#[derive(Default)]
pub struct JumpTable {
    entries: Vec<JumpEntry>,
    sites: HashMap<TextAddr, FlagId>,
}

fn sort_key(entry: &JumpEntry) -> (FlagId, TextAddr) {
    (entry.key, entry.code)
}

impl JumpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key a site is registered for.
    pub fn key_of(&self, site: TextAddr) -> Option<FlagId> {
        self.sites.get(&site).copied()
    }

    pub fn register(&mut self, entry: JumpEntry) -> Result<bool> {
        self.register_all(&[entry]).map(|added| added == 1)
    }

    /// Registers a unit's entries as one operation: either all of them are
    /// added or, on error, none are. Re-registering a site for the key it
    /// already belongs to is a no-op. Returns the number of entries added.
    pub fn register_all(&mut self, entries: &[JumpEntry]) -> Result<usize> {
        let mut pending: HashMap<TextAddr, FlagId> = HashMap::new();
        for entry in entries {
            let existing = self
                .sites
                .get(&entry.code)
                .or_else(|| pending.get(&entry.code))
                .copied();
            match existing {
                Some(existing) if existing != entry.key => {
                    log::warn!(
                        "site {} registered for key {}, refusing key {}",
                        entry.code,
                        existing,
                        entry.key
                    );
                    return Err(Error::DuplicateRegistration {
                        site: entry.code,
                        existing,
                        requested: entry.key,
                    });
                }
                Some(_) => {}
                None => {
                    pending.insert(entry.code, entry.key);
                }
            }
        }

        let added = pending.len();
        for entry in entries {
            if pending.remove(&entry.code).is_some() {
                self.sites.insert(entry.code, entry.key);
                self.entries.push(*entry);
            } else {
                log::debug!("site {} already registered for key {}", entry.code, entry.key);
            }
        }
        self.entries.sort_unstable_by_key(sort_key);
        Ok(added)
    }

    /// All sites of `key`, as one contiguous run.
    pub fn lookup(&self, key: FlagId) -> &[JumpEntry] {
        let start = self.entries.partition_point(|e| e.key < key);
        let end = start + self.entries[start..].partition_point(|e| e.key == key);
        &self.entries[start..end]
    }

    pub fn entries_of(&self, unit: UnitId) -> impl Iterator<Item = &JumpEntry> + '_ {
        self.entries.iter().filter(move |e| e.unit == unit)
    }

    /// Units other than `owner` with sites registered for `key`.
    pub fn foreign_user(&self, key: FlagId, owner: UnitId) -> Option<UnitId> {
        self.lookup(key)
            .iter()
            .find(|e| e.unit != owner)
            .map(|e| e.unit)
    }

    /// Removes every entry of `unit`. Refused, with nothing removed, if any of
    /// the unit's sites is still reachable.
    pub fn unregister_unit(&mut self, unit: UnitId, reachability: &dyn Reachability) -> Result<usize> {
        if let Some(live) = self
            .entries_of(unit)
            .find(|e| reachability.is_reachable(unit, e.code))
        {
            log::error!("unit {} still reachable through site {}", unit, live.code);
            return Err(Error::UnitBusy {
                unit,
                site: live.code,
            });
        }
        Ok(self.remove_where(|e| e.unit == unit))
    }

    /// Drops the init-text entries of `unit`; their text is gone and must
    /// never be patched again.
    pub fn invalidate_init(&mut self, unit: UnitId) -> usize {
        self.remove_where(|e| e.unit == unit && e.is_init())
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&JumpEntry) -> bool) -> usize {
        let before = self.entries.len();
        let sites = &mut self.sites;
        self.entries.retain(|e| {
            if pred(e) {
                sites.remove(&e.code);
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::entry::EntryFlags;

    fn entry(unit: u32, key: u32, code: usize) -> JumpEntry {
        JumpEntry {
            code: TextAddr::new(code),
            target: TextAddr::new(code + 0x40),
            key: FlagId::new(key),
            flags: EntryFlags::empty(),
            unit: UnitId::new(unit),
            len: 2,
        }
    }

    #[test]
    fn lookup_returns_contiguous_run() {
        // Given
        let mut table = JumpTable::new();
        table
            .register_all(&[entry(1, 2, 0x30), entry(1, 1, 0x10), entry(1, 2, 0x20), entry(1, 3, 0x40)])
            .unwrap();

        // When
        let sites = table.lookup(FlagId::new(2));

        // Then
        assert_eq!(
            sites.iter().map(|e| e.code.get()).collect::<Vec<_>>(),
            vec![0x20, 0x30]
        );
        assert!(table.lookup(FlagId::new(9)).is_empty());
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn duplicate_site_for_other_key_is_refused() {
        // Given
        let mut table = JumpTable::new();
        table.register(entry(1, 1, 0x10)).unwrap();

        // When
        let result = table.register_all(&[entry(2, 5, 0x50), entry(2, 2, 0x10)]);

        // Then
        assert_eq!(
            result,
            Err(Error::DuplicateRegistration {
                site: TextAddr::new(0x10),
                existing: FlagId::new(1),
                requested: FlagId::new(2),
            })
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.key_of(TextAddr::new(0x50)), None);
    }

    #[test]
    fn duplicate_within_one_unit_is_refused() {
        let mut table = JumpTable::new();
        assert!(table
            .register_all(&[entry(1, 1, 0x10), entry(1, 2, 0x10)])
            .is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn reregistering_same_key_is_idempotent() {
        let mut table = JumpTable::new();
        assert_eq!(table.register(entry(1, 1, 0x10)), Ok(true));
        assert_eq!(table.register(entry(1, 1, 0x10)), Ok(false));
        assert_eq!(table.lookup(FlagId::new(1)).len(), 1);
    }

    #[test]
    fn unregister_refuses_reachable_unit() {
        // Given
        let mut table = JumpTable::new();
        table
            .register_all(&[entry(1, 1, 0x10), entry(2, 1, 0x80), entry(2, 2, 0x90)])
            .unwrap();
        let on_stack = TextAddr::new(0x90);

        // When
        let busy = table.unregister_unit(UnitId::new(2), &|_: UnitId, site: TextAddr| site == on_stack);

        // Then
        assert_eq!(
            busy,
            Err(Error::UnitBusy {
                unit: UnitId::new(2),
                site: on_stack
            })
        );
        assert_eq!(table.len(), 3);

        assert_eq!(table.unregister_unit(UnitId::new(2), &Quiescent), Ok(2));
        assert_eq!(table.len(), 1);
        assert_eq!(table.key_of(TextAddr::new(0x80)), None);
    }

    #[test]
    fn invalidate_init_only_drops_init_entries() {
        let mut table = JumpTable::new();
        let mut init = entry(1, 1, 0x20);
        init.flags = EntryFlags::INIT;
        table.register_all(&[entry(1, 1, 0x10), init]).unwrap();

        assert_eq!(table.invalidate_init(UnitId::new(1)), 1);
        assert_eq!(table.lookup(FlagId::new(1)).len(), 1);
        assert_eq!(table.foreign_user(FlagId::new(1), UnitId::new(1)), None);
        assert_eq!(table.foreign_user(FlagId::new(1), UnitId::new(7)), Some(UnitId::new(1)));
    }
}
