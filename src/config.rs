//! Build-time constants and runtime configuration.

/// Width, in bytes, of one word of the simulated text region. A store that
/// stays inside one word is observed atomically by every fetching CPU.
pub const TEXT_WORD: usize = core::mem::size_of::<u64>();

/// Longest patchable instruction any architecture encodes.
pub const MAX_INSN_LEN: usize = 8;

/// Upper bound on the number of sites queued for a single patch pass.
pub const BATCH_MAX: usize = 256;

/// Size in bytes of one side-table record.
pub const ENTRY_SIZE: usize = 16;

#[cfg(target_pointer_width = "64")]
const DEFAULT_TEXT_SIZE: usize = 64 * 1024;

#[cfg(target_pointer_width = "32")]
const DEFAULT_TEXT_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Bytes of executable text available to units.
    pub text_size: usize,
    /// Sites per patch pass; clamped to `1..=BATCH_MAX`.
    pub batch_max: usize,
    /// Whether branch sites are rewritten in place. When false every branch
    /// falls back to testing its key's count.
    pub self_modifying: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            text_size: DEFAULT_TEXT_SIZE,
            batch_max: BATCH_MAX,
            self_modifying: cfg!(feature = "self_modifying"),
        }
    }

    pub const fn text_size(mut self, text_size: usize) -> Self {
        self.text_size = text_size;
        self
    }

    pub const fn batch_max(mut self, batch_max: usize) -> Self {
        self.batch_max = batch_max;
        self
    }

    pub const fn self_modifying(mut self, self_modifying: bool) -> Self {
        self.self_modifying = self_modifying;
        self
    }

    pub(crate) fn effective_batch_max(&self) -> usize {
        self.batch_max.clamp(1, BATCH_MAX)
    }

    pub(crate) fn text_words(&self) -> usize {
        self.text_size.div_ceil(TEXT_WORD)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_max_is_clamped() {
        assert_eq!(Config::new().batch_max(0).effective_batch_max(), 1);
        assert_eq!(
            Config::new().batch_max(BATCH_MAX * 4).effective_batch_max(),
            BATCH_MAX
        );
        assert_eq!(Config::new().batch_max(3).effective_batch_max(), 3);
    }

    #[test]
    fn text_is_rounded_up_to_whole_words() {
        assert_eq!(Config::new().text_size(17).text_words(), 3);
        assert_eq!(Config::new().text_size(16).text_words(), 2);
    }
}
