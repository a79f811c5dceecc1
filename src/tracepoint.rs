//! Tracepoints gated by a static branch.
//!
//! A tracepoint costs one patched branch while nobody listens. Registering
//! the first probe enables its key, which flips the branch so `trace` starts
//! calling probes; unregistering the last one flips it back.

use alloc::vec::Vec;

use spinning_top::RwSpinlock;

use crate::error::{Error, Result};
use crate::ids::{AtomicProbeId, ProbeId};
use crate::key::StaticKey;
use crate::system::Cpu;
use crate::unit::Branch;

pub type Probe<T> = fn(&T);

pub struct Tracepoint<'s, T> {
    name: &'static str,
    key: StaticKey<'s>,
    branch: Branch<'s>,
    probes: RwSpinlock<Vec<(ProbeId, Probe<T>)>>,
    next_probe: AtomicProbeId,
}

impl<'s, T> Tracepoint<'s, T> {
    /// `branch` must test `key`, and both must belong to the same registry.
    pub fn new(name: &'static str, key: StaticKey<'s>, branch: Branch<'s>) -> Result<Self> {
        if branch.key_id() != key.id() || !core::ptr::eq(branch.system(), key.system()) {
            return Err(Error::UnknownKey {
                key: branch.key_id(),
            });
        }
        Ok(Self {
            name,
            key,
            branch,
            probes: RwSpinlock::new(Vec::new()),
            next_probe: AtomicProbeId::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn probe_count(&self) -> usize {
        self.probes.read().len()
    }

    pub fn register_probe(&self, probe: Probe<T>) -> ProbeId {
        let id = self.next_probe.next();
        self.probes.write().push((id, probe));
        self.key.enable();
        log::debug!("tracepoint {}: probe {} registered", self.name, id);
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister_probe(&self, id: ProbeId) -> bool {
        let removed = {
            let mut probes = self.probes.write();
            let before = probes.len();
            probes.retain(|(probe_id, _)| *probe_id != id);
            probes.len() != before
        };
        if removed {
            self.key.disable();
            log::debug!("tracepoint {}: probe {} unregistered", self.name, id);
        }
        removed
    }

    /// Calls every probe with `arg` if the tracepoint's branch is taken.
    #[inline]
    pub fn trace(&self, cpu: &Cpu<'_>, arg: &T) {
        if self.branch.evaluate(cpu) {
            self.call_probes(arg);
        }
    }

    #[cold]
    fn call_probes(&self, arg: &T) {
        for (_, probe) in self.probes.read().iter() {
            probe(arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use test_log::test;

    use super::*;
    use crate::arch::X86_64;
    use crate::config::Config;
    use crate::system::JumpLabels;

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn count_hits(weight: &usize) {
        HITS.fetch_add(*weight, Ordering::SeqCst);
    }

    #[test]
    fn probes_run_only_while_registered() {
        // Given
        let sys = JumpLabels::new(Config::new().text_size(1024).self_modifying(true), &X86_64);
        let key = sys.define_key("sched_switch", false);
        let mut builder = sys.unit_builder("sched", 64).unwrap();
        let offset = builder.branch_unlikely(key.id()).unwrap();
        let unit = sys.load_unit(builder).unwrap();
        let tp = Tracepoint::new("sched_switch", key.clone(), unit.branch(offset).unwrap()).unwrap();
        let cpu = sys.bring_up_cpu().unwrap();
        tp.trace(&cpu, &1);
        assert_eq!(HITS.load(Ordering::SeqCst), 0);

        // When
        let first = tp.register_probe(count_hits);
        let second = tp.register_probe(count_hits);
        tp.trace(&cpu, &1);

        // Then
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
        assert_eq!(key.count(), 2);
        assert_eq!(sys.stats().passes, 1);

        assert!(tp.unregister_probe(first));
        assert!(!tp.unregister_probe(first));
        tp.trace(&cpu, &10);
        assert_eq!(HITS.load(Ordering::SeqCst), 12);

        assert!(tp.unregister_probe(second));
        assert!(!key.is_enabled());
        tp.trace(&cpu, &100);
        assert_eq!(HITS.load(Ordering::SeqCst), 12);
        assert_eq!(tp.probe_count(), 0);
    }

    #[test]
    fn branch_must_test_the_tracepoint_key() {
        let sys = JumpLabels::new(Config::new().text_size(1024).self_modifying(true), &X86_64);
        let key = sys.define_key("irq_entry", false);
        let other = sys.define_key("irq_exit", false);
        let mut builder = sys.unit_builder("irq", 64).unwrap();
        let offset = builder.branch_unlikely(other.id()).unwrap();
        let unit = sys.load_unit(builder).unwrap();

        let result = Tracepoint::<()>::new("irq_entry", key, unit.branch(offset).unwrap());
        assert_eq!(
            result.err().map(|err| err.to_string()),
            Some(format!("key {} not defined", other.id()))
        );
    }

    #[test]
    fn key_of_another_registry_is_refused() {
        let sys = JumpLabels::new(Config::new().text_size(1024).self_modifying(true), &X86_64);
        let other = JumpLabels::new(Config::new().text_size(1024).self_modifying(true), &X86_64);
        let key = sys.define_key("page_fault", false);
        let foreign = other.define_key("page_fault", false);
        let mut builder = sys.unit_builder("mm", 64).unwrap();
        let offset = builder.branch_unlikely(key.id()).unwrap();
        let unit = sys.load_unit(builder).unwrap();
        assert_eq!(key.id(), foreign.id());

        let result = Tracepoint::<()>::new("page_fault", foreign, unit.branch(offset).unwrap());

        assert_eq!(result.err(), Some(Error::UnknownKey { key: key.id() }));
        assert!(Tracepoint::<()>::new("page_fault", key, unit.branch(offset).unwrap()).is_ok());
    }
}
