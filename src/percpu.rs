use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::cpu_set::{LogicalCpuId, LogicalCpuSet, MAX_CPU_COUNT};

/// Per-CPU state touched by the fetch path and the synchronization broadcast.
pub struct PercpuBlock {
    pub cpu_id: LogicalCpuId,

    // Odd while the CPU is between loading a site's bytes and acting on them.
    // Only the owning CPU writes it; broadcasters only read.
    fetch_seq: AtomicUsize,

    // Last broadcast generation this CPU has fenced for.
    acked: AtomicUsize,
}

impl PercpuBlock {
    const fn new(cpu_id: LogicalCpuId) -> Self {
        Self {
            cpu_id,
            fetch_seq: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
        }
    }
}

/// Marks the owning CPU as fetching until dropped.
pub struct FetchGuard<'a> {
    block: &'a PercpuBlock,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.block.fetch_seq.fetch_add(1, Ordering::Release);
    }
}

/// The simulated CPUs and the broadcast that makes a text write visible to
/// all of them.
pub struct Cpus {
    online: LogicalCpuSet,
    blocks: Vec<PercpuBlock>,
    generation: AtomicUsize,
}

impl Cpus {
    pub fn new() -> Self {
        Self {
            online: LogicalCpuSet::empty(),
            blocks: (0..MAX_CPU_COUNT)
                .map(|id| PercpuBlock::new(LogicalCpuId::new(id)))
                .collect(),
            generation: AtomicUsize::new(0),
        }
    }

    pub fn bring_up(&self) -> Option<LogicalCpuId> {
        let id = self.online.claim_first()?;
        let block = self.block(id);
        block
            .acked
            .store(self.generation.load(Ordering::Acquire), Ordering::Release);
        log::debug!("CPU {} online", id);
        Some(id)
    }

    pub fn take_down(&self, id: LogicalCpuId) {
        self.online.atomic_clear(id);
        log::debug!("CPU {} offline", id);
    }

    pub fn block(&self, id: LogicalCpuId) -> &PercpuBlock {
        &self.blocks[id.get() as usize]
    }

    pub fn online(&self) -> &LogicalCpuSet {
        &self.online
    }

    /// Number of broadcasts issued so far.
    pub fn syncs(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Enters a fetch on `id`. Fences first if a broadcast happened since the
    /// CPU last looked, and acknowledges it.
    pub fn enter_fetch(&self, id: LogicalCpuId) -> FetchGuard<'_> {
        let block = self.block(id);
        block.fetch_seq.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation.load(Ordering::SeqCst);
        if block.acked.load(Ordering::Relaxed) != generation {
            fence(Ordering::SeqCst);
            block.acked.store(generation, Ordering::Release);
        }
        FetchGuard { block }
    }

    /// Returns once no CPU can still be acting on bytes it fetched before the
    /// call.
    ///
    /// Waits for each CPU that is inside a fetch to leave it; CPUs outside a
    /// fetch will see every earlier store when they next enter one. The wait
    /// is bounded by one fetch per online CPU.
    #[cfg(feature = "multi_core")]
    pub fn sync_core(&self) {
        fence(Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        for id in self.online.iter() {
            let block = self.block(id);
            let seq = block.fetch_seq.load(Ordering::SeqCst);
            if seq % 2 == 0 {
                continue;
            }
            // Load is cheaper than CAS while spinning.
            while block.fetch_seq.load(Ordering::Acquire) == seq {
                core::hint::spin_loop();
            }
        }
    }

    #[cfg(not(feature = "multi_core"))]
    pub fn sync_core(&self) {
        fence(Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use test_log::test;

    use super::*;

    #[test]
    fn broadcast_counts_and_acks() {
        // Given
        let cpus = Cpus::new();
        let id = cpus.bring_up().unwrap();

        // When
        cpus.sync_core();
        cpus.sync_core();
        drop(cpus.enter_fetch(id));

        // Then
        assert_eq!(cpus.syncs(), 2);
        assert_eq!(cpus.block(id).acked.load(Ordering::Acquire), 2);
        cpus.take_down(id);
        assert_eq!(cpus.online().count(), 0);
    }

    #[cfg(feature = "multi_core")]
    #[test]
    fn broadcast_waits_for_fetch_in_progress() {
        // Given
        let cpus = Cpus::new();
        let id = cpus.bring_up().unwrap();
        let released = AtomicBool::new(false);

        std::thread::scope(|s| {
            let guard = cpus.enter_fetch(id);

            // When
            let waiter = s.spawn(|| {
                cpus.sync_core();
                released.load(Ordering::SeqCst)
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            released.store(true, Ordering::SeqCst);
            drop(guard);

            // Then
            assert!(waiter.join().unwrap());
        });
    }

    #[test]
    fn idle_cpus_do_not_block_broadcast() {
        let cpus = Cpus::new();
        for _ in 0..4 {
            cpus.bring_up().unwrap();
        }
        cpus.sync_core();
        assert_eq!(cpus.syncs(), 1);
    }
}
