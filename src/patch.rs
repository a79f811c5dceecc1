//! Rewriting live branch sites.
//!
//! A patch pass owns the text lock for its whole duration, so at most one pass
//! runs at a time. Every site queued in a pass is written before the pass
//! synchronizes, which is what lets a batch of key changes share broadcasts:
//!
//! * a site whose instruction fits in one text word is replaced with a single
//!   store, and the pass ends with one broadcast;
//! * a wider site is fenced off with a breakpoint first. The pass plants the
//!   breakpoint on every such site, broadcasts, writes the tails, broadcasts,
//!   restores the first bytes and broadcasts once more. A CPU that fetches a
//!   breakpoint resolves it against the in-flight list and runs the new
//!   instruction.
//!
//! Once a pass starts writing it runs to completion. There is no rollback: a
//! half-applied pass would leave sites that match neither direction.

use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use spin::{Mutex, MutexGuard};
use spinning_top::RwSpinlock;

use crate::arch::{ArchPatch, Insn, JumpType};
use crate::config::BATCH_MAX;
use crate::entry::JumpEntry;
use crate::ids::TextAddr;
use crate::percpu::Cpus;
use crate::text::{InsnBytes, TextRegion};

#[derive(Clone, Debug)]
struct PokeLoc {
    addr: TextAddr,
    new: InsnBytes,
    atomic: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub passes: usize,
    pub sites_patched: usize,
}

pub struct Patcher {
    text_lock: Mutex<()>,
    in_flight: RwSpinlock<ArrayVec<PokeLoc, BATCH_MAX>>,
    passes: AtomicUsize,
    sites_patched: AtomicUsize,
}

/// Write access to live text. Only a `PatchPass` holds one, and only while it
/// holds the text lock.
struct TextPoke<'a> {
    text: &'a TextRegion,
    _guard: MutexGuard<'a, ()>,
}

impl TextPoke<'_> {
    fn store(&self, addr: TextAddr, bytes: &[u8]) {
        if !self.text.write_atomic(addr, bytes) {
            bug_at(addr, "atomic store crosses a text word");
        }
    }

    /// # Safety
    ///
    /// No CPU may execute `addr..addr + bytes.len()` until the write is
    /// followed by a broadcast.
    unsafe fn store_fenced(&self, addr: TextAddr, bytes: &[u8]) {
        unsafe { self.text.write(addr, bytes) }
    }
}

#[cold]
fn bug_at(addr: TextAddr, what: &str) -> ! {
    log::error!("jump label: {} at site {}", what, addr);
    panic!("jump label: {} at site {}", what, addr);
}

impl Patcher {
    pub fn new() -> Self {
        Self {
            text_lock: Mutex::new(()),
            in_flight: RwSpinlock::new(ArrayVec::new_const()),
            passes: AtomicUsize::new(0),
            sites_patched: AtomicUsize::new(0),
        }
    }

    /// Starts a pass, waiting for any pass already in progress.
    pub fn begin<'a>(
        &'a self,
        text: &'a TextRegion,
        arch: &'a dyn ArchPatch,
        cpus: &'a Cpus,
        batch_max: usize,
    ) -> PatchPass<'a> {
        let guard = self.text_lock.lock();
        PatchPass {
            patcher: self,
            poke: TextPoke {
                text,
                _guard: guard,
            },
            arch,
            cpus,
            queue: ArrayVec::new_const(),
            batch_max: batch_max.clamp(1, BATCH_MAX),
        }
    }

    /// What a CPU that fetched a breakpoint at `addr` executes instead.
    pub fn resolve_trap(&self, arch: &dyn ArchPatch, addr: TextAddr) -> Option<Insn> {
        let in_flight = self.in_flight.read();
        let loc = in_flight.iter().find(|loc| loc.addr == addr)?;
        arch.decode(&loc.new, addr)
    }

    pub fn stats(&self) -> PatchStats {
        PatchStats {
            passes: self.passes.load(Ordering::Relaxed),
            sites_patched: self.sites_patched.load(Ordering::Relaxed),
        }
    }
}

pub struct PatchPass<'a> {
    patcher: &'a Patcher,
    poke: TextPoke<'a>,
    arch: &'a dyn ArchPatch,
    cpus: &'a Cpus,
    queue: ArrayVec<PokeLoc, BATCH_MAX>,
    batch_max: usize,
}

impl PatchPass<'_> {
    /// Queues `entry` to hold `ty`. The site must currently hold the opposite
    /// instruction; a site that already holds `ty` is skipped.
    pub fn queue(&mut self, entry: &JumpEntry, ty: JumpType) {
        let len = usize::from(entry.len);
        let Some(new) = self.arch.encode(ty, entry.code, entry.target) else {
            bug_at(entry.code, "unencodable site");
        };
        let current = self.poke.text.read(entry.code, len);
        match self.arch.decode(&current, entry.code) {
            Some(insn) if insn.jump_type() == Some(ty) => {
                log::trace!("site {} already {:?}", entry.code, ty);
                return;
            }
            Some(Insn::Nop) | Some(Insn::Jump(_)) => {}
            _ => bug_at(entry.code, "unexpected opcode"),
        }

        if self.queue.len() >= self.batch_max {
            self.flush();
        }
        self.queue.push(PokeLoc {
            addr: entry.code,
            atomic: self.arch.can_store_atomically(entry.code, len),
            new,
        });
    }

    /// Applies everything still queued and releases the text lock.
    pub fn finish(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let count = self.queue.len();

        for loc in self.queue.iter().filter(|loc| loc.atomic) {
            self.poke.store(loc.addr, &loc.new);
        }

        let fenced = self.queue.iter().any(|loc| !loc.atomic);
        if fenced {
            let Some(trap) = self.arch.trap_opcode() else {
                bug_at(self.queue[0].addr, "wide site without breakpoint support");
            };
            {
                let mut in_flight = self.patcher.in_flight.write();
                in_flight.clear();
                in_flight.extend(self.queue.iter().filter(|loc| !loc.atomic).cloned());
            }
            for loc in self.queue.iter().filter(|loc| !loc.atomic) {
                self.poke.store(loc.addr, &[trap]);
            }
            self.cpus.sync_core();

            for loc in self.queue.iter().filter(|loc| !loc.atomic) {
                // SAFETY: The first byte is a breakpoint and every CPU has
                // seen it, so nothing decodes the tail until it is restored.
                unsafe { self.poke.store_fenced(loc.addr.add(1), &loc.new[1..]) };
            }
            self.cpus.sync_core();

            for loc in self.queue.iter().filter(|loc| !loc.atomic) {
                self.poke.store(loc.addr, &loc.new[..1]);
            }
        }

        self.cpus.sync_core();

        if fenced {
            self.patcher.in_flight.write().clear();
        }

        log::debug!(
            "patched {} sites ({}) with {} broadcasts",
            count,
            self.arch.name(),
            if fenced { 3 } else { 1 }
        );
        self.patcher.passes.fetch_add(1, Ordering::Relaxed);
        self.patcher.sites_patched.fetch_add(count, Ordering::Relaxed);
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::arch::{Aarch64, X86_64};
    use crate::entry::EntryFlags;
    use crate::ids::{FlagId, UnitId};

    fn site(arch: &dyn ArchPatch, text: &TextRegion, code: usize, target: usize) -> JumpEntry {
        let code = TextAddr::new(code);
        let target = TextAddr::new(target);
        let len = arch.check_site(code, target).unwrap();
        let nop = arch.encode(JumpType::Nop, code, target).unwrap();
        unsafe { text.write(code, &nop) };
        JumpEntry {
            code,
            target,
            key: FlagId::new(1),
            flags: EntryFlags::empty(),
            unit: UnitId::new(1),
            len: len as u8,
        }
    }

    #[test]
    fn aligned_sites_cost_one_broadcast() {
        // Given
        let text = TextRegion::new(16);
        let cpus = Cpus::new();
        let patcher = Patcher::new();
        let a = site(&Aarch64, &text, 0x10, 0x40);
        let b = site(&Aarch64, &text, 0x14, 0x40);

        // When
        let mut pass = patcher.begin(&text, &Aarch64, &cpus, BATCH_MAX);
        pass.queue(&a, JumpType::Jmp);
        pass.queue(&b, JumpType::Jmp);
        pass.finish();

        // Then
        assert_eq!(cpus.syncs(), 1);
        assert_eq!(
            Aarch64.decode(&text.read(a.code, 4), a.code),
            Some(Insn::Jump(a.target))
        );
        assert_eq!(
            patcher.stats(),
            PatchStats {
                passes: 1,
                sites_patched: 2
            }
        );
    }

    #[test]
    fn straddling_site_uses_breakpoint_protocol() {
        // Given
        let text = TextRegion::new(16);
        let cpus = Cpus::new();
        let patcher = Patcher::new();
        let wide = site(&X86_64, &text, 0x06, 0x400);
        let before = text.read(wide.code, 5);

        // When
        let mut pass = patcher.begin(&text, &X86_64, &cpus, BATCH_MAX);
        pass.queue(&wide, JumpType::Jmp);
        pass.finish();

        // Then
        assert_eq!(cpus.syncs(), 3);
        assert_eq!(
            X86_64.decode(&text.read(wide.code, 5), wide.code),
            Some(Insn::Jump(wide.target))
        );
        assert_eq!(patcher.resolve_trap(&X86_64, wide.code), None);

        let mut pass = patcher.begin(&text, &X86_64, &cpus, BATCH_MAX);
        pass.queue(&wide, JumpType::Nop);
        pass.finish();
        assert_eq!(text.read(wide.code, 5), before);
    }

    #[test]
    fn already_patched_site_is_skipped() {
        let text = TextRegion::new(4);
        let cpus = Cpus::new();
        let patcher = Patcher::new();
        let a = site(&Aarch64, &text, 0x0, 0x8);

        let mut pass = patcher.begin(&text, &Aarch64, &cpus, BATCH_MAX);
        pass.queue(&a, JumpType::Nop);
        pass.finish();

        assert_eq!(cpus.syncs(), 0);
        assert_eq!(patcher.stats().passes, 0);
    }

    #[test]
    fn full_queue_flushes_early() {
        let text = TextRegion::new(16);
        let cpus = Cpus::new();
        let patcher = Patcher::new();
        let sites: Vec<_> = (0..5).map(|i| site(&Aarch64, &text, i * 4, 0x60)).collect();

        let mut pass = patcher.begin(&text, &Aarch64, &cpus, 2);
        for s in &sites {
            pass.queue(s, JumpType::Jmp);
        }
        pass.finish();

        assert_eq!(cpus.syncs(), 3);
        assert_eq!(patcher.stats().sites_patched, 5);
    }
}
