use core::fmt;

use crate::ids::{FlagId, TextAddr, UnitId};

/// Reasons a registration, load or unload is refused.
///
/// Every variant is reported before any state changes; a failed operation
/// leaves the side table, the keys and the text exactly as they were.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The site is already registered against a different key.
    DuplicateRegistration {
        site: TextAddr,
        existing: FlagId,
        requested: FlagId,
    },
    /// The architecture cannot rewrite this site without tearing it.
    PatchUnsupported { site: TextAddr },
    /// The bytes at the site are not the encoding the side table describes.
    UnexpectedOpcode { site: TextAddr },
    /// A site of the unit is still reachable from a live call stack.
    UnitBusy { unit: UnitId, site: TextAddr },
    /// A unit with this identifier is already loaded.
    UnitExists { unit: UnitId },
    UnknownUnit { unit: UnitId },
    /// A key owned by the unit still has sites registered by another unit.
    KeyInUse { key: FlagId, user: UnitId },
    UnknownKey { key: FlagId },
    /// Not enough executable text left for the request.
    TextExhausted { requested: usize, available: usize },
    /// The side-table section is not a whole number of records, or a record
    /// points outside its unit.
    MalformedSection { offset: usize },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::DuplicateRegistration {
                site,
                existing,
                requested,
            } => write!(
                f,
                "site {} already registered for key {}, refusing key {}",
                site, existing, requested
            ),
            Error::PatchUnsupported { site } => {
                write!(f, "site {} cannot be patched atomically", site)
            }
            Error::UnexpectedOpcode { site } => write!(f, "unexpected opcode at site {}", site),
            Error::UnitBusy { unit, site } => {
                write!(f, "unit {} still reachable through site {}", unit, site)
            }
            Error::UnitExists { unit } => write!(f, "unit {} already loaded", unit),
            Error::UnknownUnit { unit } => write!(f, "unit {} not loaded", unit),
            Error::KeyInUse { key, user } => {
                write!(f, "key {} still has sites in unit {}", key, user)
            }
            Error::UnknownKey { key } => write!(f, "key {} not defined", key),
            Error::TextExhausted {
                requested,
                available,
            } => write!(
                f,
                "text exhausted: requested {} bytes, {} available",
                requested, available
            ),
            Error::MalformedSection { offset } => {
                write!(f, "malformed jump table section at offset {}", offset)
            }
        }
    }
}
