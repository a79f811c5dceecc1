//! The registry that ties keys, the side table, the text and the CPUs
//! together.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;
use spinning_top::RwSpinlock;

use crate::arch::{ArchPatch, Insn};
use crate::batch::Batch;
use crate::config::{Config, ENTRY_SIZE, MAX_INSN_LEN, TEXT_WORD};
use crate::cpu_set::LogicalCpuId;
use crate::entry::{parse_section, JumpEntry};
use crate::error::{Error, Result};
use crate::ids::{AtomicFlagId, AtomicUnitId, FlagId, TextAddr, UnitId};
use crate::key::{KeyState, StaticKey};
use crate::patch::Patcher;
use crate::percpu::Cpus;
use crate::table::{JumpTable, Reachability};
use crate::text::{InsnBytes, TextRegion};
use crate::unit::{Branch, Unit, UnitBuilder};

/// Counters exposed for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Patch passes that rewrote at least one site.
    pub passes: usize,
    /// Synchronization broadcasts issued.
    pub syncs: usize,
    pub sites_patched: usize,
}

pub(crate) struct UnitInfo {
    pub name: &'static str,
    pub base: TextAddr,
    pub size: usize,
}

pub struct JumpLabels {
    config: Config,
    arch: &'static dyn ArchPatch,
    patching: bool,
    text: TextRegion,
    table: RwSpinlock<JumpTable>,
    keys: RwSpinlock<HashMap<FlagId, Arc<KeyState>>>,
    units: RwSpinlock<HashMap<UnitId, UnitInfo>>,
    // Serializes key transitions, batch commits and unit load/unload. Taken
    // before the side table and the text lock.
    update_lock: Mutex<()>,
    patcher: Patcher,
    cpus: Cpus,
    next_key: AtomicFlagId,
    next_unit: AtomicUnitId,
}

impl JumpLabels {
    pub fn new(config: Config, arch: &'static dyn ArchPatch) -> Self {
        let patching = config.self_modifying && arch.patchable();
        log::info!(
            "jump labels: {} text bytes, {} ({})",
            config.text_size,
            arch.name(),
            if patching { "patching" } else { "fallback" }
        );
        Self {
            text: TextRegion::new(config.text_words()),
            config,
            arch,
            patching,
            table: RwSpinlock::new(JumpTable::new()),
            keys: RwSpinlock::new(HashMap::new()),
            units: RwSpinlock::new(HashMap::new()),
            update_lock: Mutex::new(()),
            patcher: Patcher::new(),
            cpus: Cpus::new(),
            next_key: AtomicFlagId::new(FlagId::new(1)),
            next_unit: AtomicUnitId::new(UnitId::new(1)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arch(&self) -> &'static dyn ArchPatch {
        self.arch
    }

    /// Whether sites are rewritten in place. When false every branch tests
    /// its key's count.
    pub fn is_patching(&self) -> bool {
        self.patching
    }

    pub(crate) fn text(&self) -> &TextRegion {
        &self.text
    }

    pub fn stats(&self) -> Stats {
        let patch = self.patcher.stats();
        Stats {
            passes: patch.passes,
            syncs: self.cpus.syncs(),
            sites_patched: patch.sites_patched,
        }
    }

    /// Declares a key that lives as long as the system.
    pub fn define_key(&self, name: &'static str, default: bool) -> StaticKey<'_> {
        let state = Arc::new(KeyState::new(self.next_key.next(), name, default, UnitId::CORE));
        self.keys.write().insert(state.id(), state.clone());
        log::debug!("key {} ({}) defined, default {}", name, state.id(), default);
        StaticKey::new(self, state)
    }

    pub(crate) fn alloc_key_id(&self) -> FlagId {
        self.next_key.next()
    }

    pub fn key(&self, id: FlagId) -> Option<StaticKey<'_>> {
        self.key_state(id).map(|state| StaticKey::new(self, state))
    }

    pub(crate) fn key_state(&self, id: FlagId) -> Option<Arc<KeyState>> {
        self.keys.read().get(&id).cloned()
    }

    pub fn begin_batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    pub fn bring_up_cpu(&self) -> Option<Cpu<'_>> {
        self.cpus.bring_up().map(|id| Cpu { sys: self, id })
    }

    /// Sites currently registered for `key`.
    pub fn sites(&self, key: FlagId) -> Vec<JumpEntry> {
        self.table.read().lookup(key).to_vec()
    }

    pub(crate) fn key_inc(&self, state: &KeyState) {
        let _guard = self.update_lock.lock();
        if state.begin_inc() {
            self.patch_keys(&[(state, true)]);
            state.finish_enable();
        }
    }

    pub(crate) fn key_dec(&self, state: &KeyState) {
        let _guard = self.update_lock.lock();
        if state.begin_dec() {
            self.patch_keys(&[(state, false)]);
        }
    }

    pub(crate) fn key_set(&self, state: &KeyState, enabled: bool) {
        let _guard = self.update_lock.lock();
        if state.begin_set(enabled) {
            self.patch_keys(&[(state, enabled)]);
            if enabled {
                state.finish_enable();
            }
        }
    }

    /// Moves every `(key, enabled)` in one go. Returns how many keys changed
    /// direction.
    pub(crate) fn commit_batch(&self, staged: &[(Arc<KeyState>, bool)]) -> usize {
        let _guard = self.update_lock.lock();
        let flips: Vec<(&KeyState, bool)> = staged
            .iter()
            .filter(|(state, enabled)| state.begin_set(*enabled))
            .map(|(state, enabled)| (&**state, *enabled))
            .collect();
        self.patch_keys(&flips);
        for (state, enabled) in &flips {
            if *enabled {
                state.finish_enable();
            }
        }
        flips.len()
    }

    /// Rewrites every site of every key in `flips` in one patch pass. Caller
    /// holds the update lock and has already moved the counts.
    fn patch_keys(&self, flips: &[(&KeyState, bool)]) {
        if !self.patching || flips.is_empty() {
            return;
        }
        let table = self.table.read();
        let mut pass = self.patcher.begin(
            &self.text,
            self.arch,
            &self.cpus,
            self.config.effective_batch_max(),
        );
        for (state, enabled) in flips {
            log::debug!(
                "key {} ({}) -> {}",
                state.name(),
                state.id(),
                if *enabled { "enabled" } else { "disabled" }
            );
            for entry in table.lookup(state.id()) {
                pass.queue(entry, entry.jump_type(*enabled));
            }
        }
        pass.finish();
    }

    pub fn unit_builder(&self, name: &'static str, size: usize) -> Result<UnitBuilder<'_>> {
        let size = size.next_multiple_of(TEXT_WORD);
        let base = self.text.reserve(size)?;
        log::debug!(
            "unit {}: {} text bytes at {}, {} left",
            name,
            size,
            base,
            self.text.available()
        );
        Ok(UnitBuilder::new(self, self.next_unit.next(), name, base, size))
    }

    /// Merges a unit's side table into the registry and brings its sites in
    /// line with the current state of their keys.
    ///
    /// Fails, leaving the registry untouched, if a record is malformed, names
    /// an unknown key, points at a site that cannot be patched, or collides
    /// with a registered site.
    pub fn load_unit(&self, builder: UnitBuilder<'_>) -> Result<Unit<'_>> {
        let _guard = self.update_lock.lock();
        let id = builder.id();
        if !core::ptr::eq(builder.system(), self) {
            return Err(Error::UnknownUnit { unit: id });
        }
        if self.units.read().contains_key(&id) {
            return Err(Error::UnitExists { unit: id });
        }

        let declared: Vec<Arc<KeyState>> = builder
            .declared_keys()
            .iter()
            .map(|decl| Arc::new(KeyState::new(decl.id, decl.name, decl.default, id)))
            .collect();
        let lookup_key = |key: FlagId| -> Option<Arc<KeyState>> {
            declared
                .iter()
                .find(|state| state.id() == key)
                .cloned()
                .or_else(|| self.key_state(key))
        };

        let raw = parse_section(&builder.section())?;
        let mut entries = Vec::with_capacity(raw.len());
        for (i, record) in raw.iter().enumerate() {
            let offset = i * ENTRY_SIZE;
            let in_unit = |rel: u32| (rel as usize) < builder.size();
            if !in_unit(record.code) || !in_unit(record.target) {
                return Err(Error::MalformedSection { offset });
            }
            let state = lookup_key(record.key()).ok_or(Error::UnknownKey { key: record.key() })?;
            let code = builder.base().add(record.code as usize);
            let target = builder.base().add(record.target as usize);

            let len = if self.patching {
                let len = self.arch.check_site(code, target)?;
                if record.code as usize + len > builder.size() {
                    return Err(Error::MalformedSection { offset });
                }
                let entry = record.resolve(id, builder.base(), len as u8);
                let compiled = entry.jump_type(state.default());
                let current = self.text.read(code, len);
                match self.arch.decode(&current, code).and_then(Insn::jump_type) {
                    Some(ty) if ty == compiled => {}
                    _ => return Err(Error::UnexpectedOpcode { site: code }),
                }
                len
            } else {
                0
            };
            entries.push((record.resolve(id, builder.base(), len as u8), state));
        }

        let sites: Vec<JumpEntry> = entries.iter().map(|(entry, _)| *entry).collect();
        let mut table = self.table.write();
        table.register_all(&sites)?;

        {
            let mut keys = self.keys.write();
            for state in &declared {
                keys.insert(state.id(), state.clone());
            }
        }
        self.units.write().insert(
            id,
            UnitInfo {
                name: builder.name(),
                base: builder.base(),
                size: builder.size(),
            },
        );

        if self.patching {
            let mut pass = self.patcher.begin(
                &self.text,
                self.arch,
                &self.cpus,
                self.config.effective_batch_max(),
            );
            for (entry, state) in &entries {
                let enabled = state.count() > 0;
                if enabled != state.default() {
                    pass.queue(entry, entry.jump_type(enabled));
                }
            }
            pass.finish();
        }
        drop(table);

        log::info!(
            "unit {} ({}) loaded: {} sites, {} keys",
            builder.name(),
            id,
            sites.len(),
            declared.len()
        );
        Ok(Unit::new(self, id, builder.base(), builder.size(), entries))
    }

    /// Removes a unit's sites and destroys the keys it owns.
    ///
    /// Refused, leaving the unit loaded, if any of its sites is still
    /// reachable or another unit still has sites on one of its keys.
    pub fn unload_unit(&self, unit: UnitId, reachability: &dyn Reachability) -> Result<usize> {
        let _guard = self.update_lock.lock();
        let name = match self.units.read().get(&unit) {
            Some(info) => info.name,
            None => return Err(Error::UnknownUnit { unit }),
        };

        let owned: Vec<FlagId> = self
            .keys
            .read()
            .values()
            .filter(|state| state.owner() == unit)
            .map(|state| state.id())
            .collect();

        let mut table = self.table.write();
        for key in &owned {
            if let Some(user) = table.foreign_user(*key, unit) {
                log::warn!("unit {} ({}) unload refused: key {} used by {}", name, unit, key, user);
                return Err(Error::KeyInUse { key: *key, user });
            }
        }
        let removed = table.unregister_unit(unit, reachability)?;
        drop(table);

        {
            let mut keys = self.keys.write();
            for key in &owned {
                keys.remove(key);
            }
        }
        self.units.write().remove(&unit);
        log::info!("unit {} ({}) unloaded: {} sites", name, unit, removed);
        Ok(removed)
    }

    /// Forgets the init-text sites of `unit` once its init code is discarded.
    pub fn free_init(&self, unit: UnitId) -> Result<usize> {
        let _guard = self.update_lock.lock();
        if !self.units.read().contains_key(&unit) {
            return Err(Error::UnknownUnit { unit });
        }
        let removed = self.table.write().invalidate_init(unit);
        log::debug!("unit {}: {} init sites invalidated", unit, removed);
        Ok(removed)
    }

    /// Text range of a loaded unit.
    pub fn unit_text(&self, unit: UnitId) -> Option<(TextAddr, usize)> {
        self.units.read().get(&unit).map(|info| (info.base, info.size))
    }
}

/// A simulated CPU. Dropping it takes the CPU offline.
pub struct Cpu<'s> {
    sys: &'s JumpLabels,
    id: LogicalCpuId,
}

impl<'s> Cpu<'s> {
    pub fn id(&self) -> LogicalCpuId {
        self.id
    }

    /// Fetches `len` bytes of text as one instruction fetch. `None` if the
    /// range leaves the text region or is longer than any instruction.
    pub fn fetch(&self, addr: TextAddr, len: usize) -> Option<InsnBytes> {
        if len > MAX_INSN_LEN || !self.sys.text.contains(addr, len) {
            return None;
        }
        let _fetch = self.sys.cpus.enter_fetch(self.id);
        Some(self.sys.text.read(addr, len))
    }

    /// Fetches and decodes the instruction at a site, resolving a breakpoint
    /// planted by a patch in progress. `None` means the bytes matched neither
    /// encoding.
    pub fn decode(&self, entry: &JumpEntry) -> Option<Insn> {
        let _fetch = self.sys.cpus.enter_fetch(self.id);
        let bytes = self.sys.text.read(entry.code, usize::from(entry.len));
        match self.sys.arch.decode(&bytes, entry.code)? {
            Insn::Trap => self.sys.patcher.resolve_trap(self.sys.arch, entry.code),
            insn => Some(insn),
        }
    }

    /// Runs a branch site.
    pub fn execute(&self, branch: &Branch<'_>) -> bool {
        branch.evaluate(self)
    }
}

impl Drop for Cpu<'_> {
    fn drop(&mut self) {
        self.sys.cpus.take_down(self.id);
    }
}
