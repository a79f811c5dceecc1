//! Code units: what the code generator emits and the loader merges.
//!
//! A `UnitBuilder` plays the compiler: it writes each branch's compiled-in
//! instruction into the unit's text and appends one record to the unit's jump
//! table section. Nothing it writes is live until `JumpLabels::load_unit`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::{Insn, JumpType};
use crate::config::{ENTRY_SIZE, TEXT_WORD};
use crate::entry::{write_section, EntryFlags, JumpEntry, RawEntry};
use crate::error::{Error, Result};
use crate::ids::{FlagId, TextAddr, UnitId};
use crate::key::{KeyState, StaticKey};
use crate::system::{Cpu, JumpLabels};
use crate::table::Reachability;

#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyDecl {
    pub id: FlagId,
    pub name: &'static str,
    pub default: bool,
}

pub struct UnitBuilder<'s> {
    sys: &'s JumpLabels,
    id: UnitId,
    name: &'static str,
    base: TextAddr,
    size: usize,
    cursor: usize,
    init: bool,
    keys: Vec<KeyDecl>,
    entries: Vec<RawEntry>,
}

impl<'s> UnitBuilder<'s> {
    pub(crate) fn new(sys: &'s JumpLabels, id: UnitId, name: &'static str, base: TextAddr, size: usize) -> Self {
        Self {
            sys,
            id,
            name,
            base,
            size,
            cursor: 0,
            init: false,
            keys: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> TextAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the next emitted instruction.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn system(&self) -> &'s JumpLabels {
        self.sys
    }

    pub(crate) fn declared_keys(&self) -> &[KeyDecl] {
        &self.keys
    }

    /// The unit's jump table section.
    pub fn section(&self) -> Vec<u8> {
        write_section(&self.entries)
    }

    /// Declares a key owned by this unit. It becomes visible when the unit
    /// loads and is destroyed when it unloads.
    pub fn define_key(&mut self, name: &'static str, default: bool) -> FlagId {
        let id = self.sys.alloc_key_id();
        self.keys.push(KeyDecl { id, name, default });
        id
    }

    /// Following branches live in init text.
    pub fn init_section(&mut self) -> &mut Self {
        self.init = true;
        self
    }

    /// Following branches live in regular text.
    pub fn text_section(&mut self) -> &mut Self {
        self.init = false;
        self
    }

    pub fn pad(&mut self, bytes: usize) -> Result<&mut Self> {
        self.advance(bytes)?;
        Ok(self)
    }

    pub fn align(&mut self, align: usize) -> Result<&mut Self> {
        let aligned = self
            .cursor
            .checked_next_multiple_of(align.max(1))
            .ok_or(Error::TextExhausted {
                requested: align,
                available: self.landing_pad().saturating_sub(self.cursor),
            })?;
        self.advance(aligned - self.cursor)?;
        Ok(self)
    }

    /// Out-of-line landing pad that branches jump to by default: the last
    /// word of the unit.
    pub fn landing_pad(&self) -> usize {
        self.size.saturating_sub(TEXT_WORD)
    }

    /// A branch that is expected to be false: falls through while the key is
    /// disabled. Returns the site's offset in the unit.
    pub fn branch_unlikely(&mut self, key: FlagId) -> Result<usize> {
        self.branch_to(key, false, self.landing_pad())
    }

    /// A branch that is expected to be true: falls through while the key is
    /// enabled.
    pub fn branch_likely(&mut self, key: FlagId) -> Result<usize> {
        self.branch_to(key, true, self.landing_pad())
    }

    pub fn branch_to(&mut self, key: FlagId, likely: bool, target: usize) -> Result<usize> {
        let default = self.key_default(key)?;
        if target >= self.size {
            return Err(Error::MalformedSection {
                offset: self.entries.len() * ENTRY_SIZE,
            });
        }

        let offset = self.cursor;
        let code = self.base.add(offset);
        let len = if self.sys.is_patching() {
            let arch = self.sys.arch();
            let target = self.base.add(target);
            let len = arch
                .insn_len(code, target)
                .ok_or(Error::PatchUnsupported { site: code })?;
            let ty = JumpType::from_taken(default ^ likely);
            let bytes = arch
                .encode(ty, code, target)
                .ok_or(Error::PatchUnsupported { site: code })?;
            self.check_room(len)?;
            // SAFETY: The unit is not loaded, so no CPU executes its text.
            unsafe { self.sys.text().write(code, &bytes) };
            len
        } else {
            // The fallback test is ordinary code; it still needs an address.
            self.check_room(1)?;
            1
        };
        self.cursor += len;

        let mut flags = EntryFlags::empty();
        if likely {
            flags |= EntryFlags::BRANCH;
        }
        if self.init {
            flags |= EntryFlags::INIT;
        }
        self.entries
            .push(RawEntry::new(offset as u32, target as u32, key, flags));
        Ok(offset)
    }

    /// Appends a record without emitting any code, as a linker would for a
    /// section produced elsewhere.
    pub fn record(&mut self, entry: RawEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    fn key_default(&self, key: FlagId) -> Result<bool> {
        if let Some(decl) = self.keys.iter().find(|decl| decl.id == key) {
            return Ok(decl.default);
        }
        self.sys
            .key_state(key)
            .map(|state| state.default())
            .ok_or(Error::UnknownKey { key })
    }

    fn check_room(&self, bytes: usize) -> Result<()> {
        let limit = self.landing_pad();
        self.cursor
            .checked_add(bytes)
            .filter(|end| *end <= limit)
            .map(|_| ())
            .ok_or(Error::TextExhausted {
                requested: bytes,
                available: limit.saturating_sub(self.cursor),
            })
    }

    fn advance(&mut self, bytes: usize) -> Result<()> {
        self.check_room(bytes)?;
        self.cursor += bytes;
        Ok(())
    }
}

/// A loaded unit.
pub struct Unit<'s> {
    sys: &'s JumpLabels,
    id: UnitId,
    base: TextAddr,
    size: usize,
    branches: Vec<(JumpEntry, Arc<KeyState>)>,
}

impl<'s> Unit<'s> {
    pub(crate) fn new(
        sys: &'s JumpLabels,
        id: UnitId,
        base: TextAddr,
        size: usize,
        branches: Vec<(JumpEntry, Arc<KeyState>)>,
    ) -> Self {
        Self {
            sys,
            id,
            base,
            size,
            branches,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn base(&self) -> TextAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The branch emitted at `offset`.
    pub fn branch(&self, offset: usize) -> Option<Branch<'s>> {
        let code = self.base.add(offset);
        self.branches
            .iter()
            .find(|(entry, _)| entry.code == code)
            .map(|(entry, key)| Branch {
                sys: self.sys,
                entry: *entry,
                key: key.clone(),
            })
    }

    pub fn branches(&self) -> impl Iterator<Item = Branch<'s>> + '_ {
        self.branches.iter().map(|(entry, key)| Branch {
            sys: self.sys,
            entry: *entry,
            key: key.clone(),
        })
    }

    pub fn key(&self, id: FlagId) -> Option<StaticKey<'s>> {
        self.sys.key(id)
    }

    pub fn free_init(&self) -> Result<usize> {
        self.sys.free_init(self.id)
    }

    pub fn unload(&self, reachability: &dyn Reachability) -> Result<usize> {
        self.sys.unload_unit(self.id, reachability)
    }
}

/// One patchable branch, as seen by code that runs it.
#[derive(Clone)]
pub struct Branch<'s> {
    sys: &'s JumpLabels,
    entry: JumpEntry,
    key: Arc<KeyState>,
}

impl<'s> Branch<'s> {
    pub(crate) fn system(&self) -> &'s JumpLabels {
        self.sys
    }

    pub fn site(&self) -> TextAddr {
        self.entry.code
    }

    pub fn entry(&self) -> &JumpEntry {
        &self.entry
    }

    pub fn key_id(&self) -> FlagId {
        self.entry.key
    }

    pub fn is_likely(&self) -> bool {
        self.entry.is_branch()
    }

    /// Runs the site on `cpu`. A patched site costs one fetch and never reads
    /// the key; without patching this is a plain load of the count.
    #[inline]
    pub fn evaluate(&self, cpu: &Cpu<'_>) -> bool {
        if !self.sys.is_patching() {
            return self.key.is_enabled();
        }
        match cpu.decode(&self.entry).and_then(Insn::jump_type) {
            Some(ty) => self.entry.outcome(ty),
            None => {
                log::error!("torn instruction at site {}", self.entry.code);
                panic!("torn instruction at site {}", self.entry.code);
            }
        }
    }
}
