//! Error taxonomy for the cache engine.
//!
//! - [`FormatError`]: the file framing is broken; the whole file is rejected.
//! - [`ParseError`]: one record is malformed; it is skipped and reported
//!   alongside the best-effort table.
//! - [`DecodeError`]: a table cannot be decoded at all (corrupt, wrong table,
//!   unknown or mismatched version). Scoped to that one table.
//! - [`EncodeError`]: a table model cannot be expressed in the requested
//!   version.
//! - [`CacheError`]: failures of the orchestrator; only I/O reaches callers.

use std::path::PathBuf;

use crate::model::{TableKind, TableVersion};

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("file exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("missing or damaged magic begin bytes")]
    BadMagicBegin,

    #[error("missing or damaged magic end bytes")]
    BadMagicEnd,

    #[error("truncated {region} region at offset {offset}")]
    Truncated { region: &'static str, offset: usize },

    #[error("expected {region} region tag {expected:#04x} at offset {offset}, found {found:#04x}")]
    UnexpectedRegion {
        region: &'static str,
        expected: u8,
        found: u8,
        offset: usize,
    },

    #[error("expected header entry {expected:#04x}, found {found:#04x}")]
    BadHeaderTag { expected: u8, found: u8 },

    #[error("header entry {tag:#04x} declares length {len}, wider than the entry")]
    BadHeaderLength { tag: u8, len: usize },

    #[error("header entry {tag:#04x} is not valid UTF-8")]
    HeaderNotUtf8 { tag: u8 },

    #[error("unsupported string encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("header timestamp {0:?} is not a number")]
    BadTimestamp(String),

    #[error("string {index} in the string pool is not valid UTF-8")]
    StringNotUtf8 { index: u32 },

    #[error("data region declares {declared} bytes but its records span {actual}")]
    DataLengthMismatch { declared: usize, actual: usize },

    #[error("trailer counts ({records} records, {strings} strings) disagree with the file")]
    TrailerMismatch { records: u32, strings: u32 },

    #[error("{count} unexpected bytes after magic end")]
    TrailingBytes { count: usize },
}

/// A record-level malformation. The record is dropped, decoding continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record {record} (offset {offset}): {kind}")]
pub struct ParseError {
    pub record: usize,
    pub offset: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("string index {index} out of range (pool holds {len})")]
    StringIndexOutOfRange { index: u32, len: usize },

    #[error("expected tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),

    #[error("record body ended early")]
    UnexpectedEnd,

    #[error("{count} unread bytes at end of record")]
    TrailingBytes { count: usize },

    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("corrupt cache file: {0}")]
    Corrupt(#[from] FormatError),

    #[error("unknown table {0:?}")]
    UnknownTable(String),

    #[error("expected table {expected}, found {found:?}")]
    WrongTable { expected: TableKind, found: String },

    #[error("table {table} does not support version {version:?}")]
    UnsupportedVersion { table: TableKind, version: String },

    #[error("table {table} must hold {expected} record(s), found {found}")]
    RecordCount {
        table: TableKind,
        expected: usize,
        found: usize,
    },

    #[error("table {table} declares version {declared} but holds {detail}")]
    VersionMismatch {
        table: TableKind,
        declared: TableVersion,
        detail: &'static str,
    },
}

impl DecodeError {
    /// True for failures that mean "this file is not trustworthy at all".
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::RecordCount { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("table {table} does not support version {version}")]
    UnsupportedVersion {
        table: TableKind,
        version: TableVersion,
    },

    #[error("this table type cannot be stored as a {kind} file")]
    KindMismatch { kind: TableKind },

    #[error("header value for {tag:#04x} is {len} bytes, entries hold at most {max}")]
    HeaderTooWide { tag: u8, len: usize, max: usize },

    #[error("table {table} version {version} cannot hold {field}")]
    FieldNotInVersion {
        table: TableKind,
        version: TableVersion,
        field: &'static str,
    },

    #[error("{what} exceeds the format limit")]
    TooLarge { what: &'static str },
}

/// Errors produced by the cache orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {table}: {source}")]
    Encode {
        table: TableKind,
        #[source]
        source: EncodeError,
    },

    #[error("failed to stamp container {name}: {source}")]
    Stamp {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_message_names_the_record() {
        let err = ParseError {
            record: 3,
            offset: 120,
            kind: ParseErrorKind::StringIndexOutOfRange { index: 9, len: 2 },
        };
        let message = err.to_string();
        assert!(message.contains("record 3"), "{message}");
        assert!(message.contains("string index 9"), "{message}");
    }

    #[test]
    fn version_errors_are_not_corruption() {
        assert!(DecodeError::Corrupt(FormatError::BadMagicEnd).is_corruption());
        assert!(
            !DecodeError::UnsupportedVersion {
                table: TableKind::Classes,
                version: "9.9".to_string(),
            }
            .is_corruption()
        );
    }
}
