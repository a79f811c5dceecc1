//! # Jump labels
//!
//! Conditional branches whose direction is flipped by rewriting the branch
//! instruction in place. A site costs one no-op or one unconditional jump
//! until a key changes, at which point every site testing that key is
//! patched and all CPUs are made to see the new bytes before the change
//! completes.
//!
//! Text lives in a simulated, word-addressed region shared by any number of
//! simulated CPUs, so the patching protocol can be exercised from ordinary
//! threads.

// Used for arch::arch
#![allow(clippy::module_inception)]
// Not implementing default is sometimes useful when construction has side effects
#![allow(clippy::new_without_default)]
// Used to make it nicer to return errors, for example, .ok_or(Error::UnknownKey { key })
#![allow(clippy::or_fun_call)]
// This is usually a serious issue - a missing import of a define where it is interpreted
// as a catch-all variable in a match, for example
#![deny(unreachable_patterns)]
// Ensure that all must_use results are used
#![deny(unused_must_use)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate bitflags;

/// Shared utility functions
#[macro_use]
pub mod common;

/// Per-architecture instruction encodings
pub mod arch;

/// Grouped key changes
pub mod batch;

/// Build-time and boot-time parameters
pub mod config;

/// Sets of logical CPUs
pub mod cpu_set;

/// Jump table records
pub mod entry;

pub mod error;

/// Identifiers
pub mod ids;

/// Keys and their reference counts
pub mod key;

/// Ring-buffer logger
pub mod log;

/// Text patching
pub mod patch;

/// Simulated CPUs and synchronization broadcasts
pub mod percpu;

/// The jump label registry
pub mod system;

/// The side table
pub mod table;

/// Simulated text
pub mod text;

/// Tracepoints
pub mod tracepoint;

/// Code units
pub mod unit;

pub use crate::arch::{native, ArchPatch, Insn, JumpType};
pub use crate::batch::Batch;
pub use crate::config::Config;
pub use crate::entry::{EntryFlags, JumpEntry, RawEntry};
pub use crate::error::{Error, Result};
pub use crate::ids::{FlagId, ProbeId, TextAddr, UnitId};
pub use crate::key::StaticKey;
pub use crate::system::{Cpu, JumpLabels, Stats};
pub use crate::table::{Quiescent, Reachability};
pub use crate::tracepoint::Tracepoint;
pub use crate::unit::{Branch, Unit, UnitBuilder};

static JUMP_LABELS: spin::Once<JumpLabels> = spin::Once::new();

/// Sets up the global registry for the architecture this crate was built
/// for. Later calls return the registry from the first one.
pub fn init(config: Config) -> &'static JumpLabels {
    JUMP_LABELS.call_once(|| JumpLabels::new(config, arch::native()))
}

/// The global registry, if `init` has run.
pub fn jump_labels() -> Option<&'static JumpLabels> {
    JUMP_LABELS.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_registry_is_created_once() {
        let first = init(Config::new());
        let second = init(Config::new().text_size(64));

        assert!(core::ptr::eq(first, second));
        assert_eq!(second.config().text_size, Config::new().text_size);
        assert!(jump_labels().is_some_and(|sys| core::ptr::eq(sys, first)));
    }
}
