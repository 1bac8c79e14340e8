//! Container fingerprints and freshness checks.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::model::StampTable;

/// Something whose identity can be fingerprinted cheaply.
pub trait Stampable {
    fn name(&self) -> String;
    fn stamp(&self) -> io::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StampKind {
    /// Size plus modification time.
    #[default]
    Metadata,
    /// SHA-256 of the contents.
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StampState {
    #[default]
    NotChecked,
    Valid,
    Invalid,
    Missing,
}

impl StampState {
    /// Invalid and Missing behave the same; they differ only in diagnostics.
    pub fn forces_rescan(self) -> bool {
        matches!(self, Self::Invalid | Self::Missing)
    }
}

/// Tracks one stamp check per scan cycle.
#[derive(Debug, Default)]
pub struct StampValidator {
    state: StampState,
    always_valid: bool,
}

impl StampValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A validator that trusts any stored stamp for the right container.
    pub fn always_valid() -> Self {
        Self {
            state: StampState::NotChecked,
            always_valid: true,
        }
    }

    pub fn state(&self) -> StampState {
        self.state
    }

    pub fn validate(&mut self, stored: Option<&StampTable>, live: &dyn Stampable) -> StampState {
        self.state = match stored {
            None => StampState::Missing,
            Some(stored) => self.compare(stored, live),
        };
        self.state
    }

    /// Hand the result to the caller and reset for the next cycle.
    pub fn consume(&mut self) -> StampState {
        std::mem::take(&mut self.state)
    }

    fn compare(&self, stored: &StampTable, live: &dyn Stampable) -> StampState {
        let name = live.name();
        if stored.name != name {
            tracing::debug!(
                target: "anno_cache",
                stored = %stored.name,
                live = %name,
                "stamp belongs to a different container"
            );
            return StampState::Invalid;
        }
        if self.always_valid {
            return StampState::Valid;
        }
        match live.stamp() {
            Ok(current) if current == stored.stamp => StampState::Valid,
            Ok(_) => StampState::Invalid,
            Err(err) => {
                // Unverifiable caches are never trusted.
                tracing::debug!(
                    target: "anno_cache",
                    container = %name,
                    error = %err,
                    "failed to stamp container"
                );
                StampState::Invalid
            }
        }
    }
}

pub fn is_valid(stored: &StampTable, live: &dyn Stampable) -> bool {
    StampValidator::new().validate(Some(stored), live) == StampState::Valid
}

/// Stamp table for the live state of `live`.
pub fn current_stamp(live: &dyn Stampable) -> io::Result<StampTable> {
    Ok(StampTable {
        name: live.name(),
        stamp: live.stamp()?,
    })
}

pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

pub fn hash_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// `(size, mtime nanos)` of a file.
pub fn file_metadata(path: &Path) -> io::Result<(u64, u128)> {
    let meta = std::fs::metadata(path)?;
    let nanos = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok((meta.len(), nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Fake {
        name: &'static str,
        stamp: Cell<Option<&'static str>>,
    }

    impl Stampable for Fake {
        fn name(&self) -> String {
            self.name.to_string()
        }

        fn stamp(&self) -> io::Result<String> {
            self.stamp
                .get()
                .map(str::to_string)
                .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }
    }

    fn stored(name: &str, stamp: &str) -> StampTable {
        StampTable {
            name: name.to_string(),
            stamp: stamp.to_string(),
        }
    }

    #[test]
    fn validator_moves_through_states_once_per_cycle() {
        let live = Fake {
            name: "lib/a.jar",
            stamp: Cell::new(Some("s1")),
        };
        let mut validator = StampValidator::new();
        assert_eq!(validator.state(), StampState::NotChecked);

        assert_eq!(
            validator.validate(Some(&stored("lib/a.jar", "s1")), &live),
            StampState::Valid
        );
        assert_eq!(validator.consume(), StampState::Valid);
        assert_eq!(validator.state(), StampState::NotChecked);

        assert_eq!(validator.validate(None, &live), StampState::Missing);
        assert!(validator.consume().forces_rescan());
    }

    #[test]
    fn changed_stamp_is_invalid() {
        let live = Fake {
            name: "lib/a.jar",
            stamp: Cell::new(Some("s1")),
        };
        let table = stored("lib/a.jar", "s1");
        assert!(is_valid(&table, &live));

        live.stamp.set(Some("s2"));
        assert!(!is_valid(&table, &live));
    }

    #[test]
    fn io_failure_fails_safe_to_invalid() {
        let live = Fake {
            name: "lib/a.jar",
            stamp: Cell::new(None),
        };
        let mut validator = StampValidator::new();
        assert_eq!(
            validator.validate(Some(&stored("lib/a.jar", "s1")), &live),
            StampState::Invalid
        );
    }

    #[test]
    fn stamp_of_another_container_is_invalid_even_when_always_valid() {
        let live = Fake {
            name: "lib/b.jar",
            stamp: Cell::new(Some("s1")),
        };
        let mut validator = StampValidator::always_valid();
        assert_eq!(
            validator.validate(Some(&stored("lib/a.jar", "s1")), &live),
            StampState::Invalid
        );

        let live = Fake {
            name: "lib/a.jar",
            stamp: Cell::new(None),
        };
        assert_eq!(
            validator.validate(Some(&stored("lib/a.jar", "old")), &live),
            StampState::Valid
        );
    }

    #[test]
    fn hash_reader_matches_hash_content() -> io::Result<()> {
        let data = b"class Foo {}".repeat(10_000);
        assert_eq!(hash_reader(&data[..])?, hash_content(&data));
        Ok(())
    }
}
