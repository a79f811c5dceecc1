use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::string::String;

/// A unique number identifying one simulated CPU.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct LogicalCpuId(u32);

impl LogicalCpuId {
    pub const fn new(inner: u32) -> Self {
        Self(inner)
    }
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for LogicalCpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[logical cpu #{}]", self.0)
    }
}
impl core::fmt::Display for LogicalCpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(target_pointer_width = "64")]
pub const MAX_CPU_COUNT: u32 = 128;

#[cfg(target_pointer_width = "32")]
pub const MAX_CPU_COUNT: u32 = 32;

const SET_WORDS: usize = (MAX_CPU_COUNT / usize::BITS) as usize;

/// Online CPUs. Bits are claimed and released atomically so CPUs can come and
/// go while a synchronization broadcast is walking the set.
#[derive(Debug)]
pub struct LogicalCpuSet([AtomicUsize; SET_WORDS]);

fn parts(id: LogicalCpuId) -> (usize, u32) {
    ((id.get() / usize::BITS) as usize, id.get() % usize::BITS)
}

impl LogicalCpuSet {
    pub const fn empty() -> Self {
        const ZEROES: AtomicUsize = AtomicUsize::new(0);
        Self([ZEROES; SET_WORDS])
    }

    pub fn contains(&self, id: LogicalCpuId) -> bool {
        let (word, bit) = parts(id);
        self.0[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Claims the lowest clear bit, `None` when every CPU is online.
    pub fn claim_first(&self) -> Option<LogicalCpuId> {
        for (i, word) in self.0.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != !0 {
                let bit = (!current).trailing_zeros();
                match word.compare_exchange_weak(
                    current,
                    current | 1 << bit,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(LogicalCpuId::new(i as u32 * usize::BITS + bit)),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    pub fn atomic_clear(&self, id: LogicalCpuId) {
        let (word, bit) = parts(id);
        let _ = self.0[word].fetch_and(!(1 << bit), Ordering::Release);
    }

    pub fn count(&self) -> u32 {
        self.0
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }

    pub fn to_raw(&self) -> RawMask {
        self.0.each_ref().map(|w| w.load(Ordering::Acquire))
    }

    /// Snapshot of the CPUs online at the time of the call.
    pub fn iter(&self) -> impl Iterator<Item = LogicalCpuId> {
        let raw = self.to_raw();
        (0..SET_WORDS).flat_map(move |i| {
            let w = raw[i];
            (0..usize::BITS).filter_map(move |b| {
                if w & 1 << b != 0 {
                    Some(LogicalCpuId::new(i as u32 * usize::BITS + b))
                } else {
                    None
                }
            })
        })
    }

    /// Hex mask of the online CPUs, lowest word first.
    pub fn to_hex(&self) -> String {
        use core::fmt::Write;

        let mut ret = String::new();
        let raw = self.to_raw();
        let used = raw.iter().rposition(|w| *w != 0).map_or(1, |i| i + 1);
        for (i, word) in raw.iter().take(used).enumerate() {
            if i != 0 {
                ret.push('_');
            }
            let _ = write!(ret, "{word:x}");
        }
        ret
    }
}

pub type RawMask = [usize; SET_WORDS];
