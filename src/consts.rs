//! Byte-level grammar of the cache file format.
//!
//! Everything here is process-wide constant data. Region tags frame the file,
//! header tags label the fixed-width header entries, and the remaining tags
//! label fields inside table records.

pub const MAGIC_BEGIN_BYTES: [u8; 4] = [0xC0, 0xCA, 0x01, 0x01];
pub const MAGIC_END_BYTES: [u8; 4] = [0xC0, 0xCA, 0xA0, 0xA0];

// Regions, in file order.
pub const HEADER_BYTE: u8 = 0x01;
pub const DATA_BYTE: u8 = 0x02;
pub const STRINGS_BYTE: u8 = 0x03;
pub const TRAILER_BYTE: u8 = 0x04;

/// Width of one header entry: tag, length, value, zero padding.
pub const HEADER_WIDTH: usize = 60;
/// Longest header value that fits in one entry.
pub const HEADER_VALUE_MAX: usize = HEADER_WIDTH - 2;

pub const ENCODING_BYTE: u8 = 0x11;
pub const TABLE_BYTE: u8 = 0x12;
pub const VERSION_BYTE: u8 = 0x13;
pub const TIMESTAMP_BYTE: u8 = 0x14;

pub const NAME_BYTE: u8 = 0x15;
pub const STAMP_BYTE: u8 = 0x16;

pub const POLICY_BYTE: u8 = 0x21;
pub const SIGNATURE_BYTE: u8 = 0x22;

pub const PACKAGE_BYTE: u8 = 0x31;
pub const CLASS_BYTE: u8 = 0x32;
pub const CLASS_SOURCE_BYTE: u8 = 0x33;

pub const SUPERCLASS_BYTE: u8 = 0x41;
// INTERFACE_BYTE and MODIFIERS_BYTE share a value in the shipped format. Class
// records tell them apart by position: the interface count comes first, so the
// tag that follows the last interface is the modifiers field.
pub const INTERFACE_BYTE: u8 = 0x42;
pub const MODIFIERS_BYTE: u8 = 0x42;

pub const PACKAGE_ANNOTATION_BYTE: u8 = 0x51;
pub const CLASS_ANNOTATION_BYTE: u8 = 0x52;
pub const FIELD_ANNOTATION_BYTE: u8 = 0x53;
pub const METHOD_ANNOTATION_BYTE: u8 = 0x54;

pub const ENCODING: &str = "UTF-8";

pub const STAMP_TABLE_NAME: &str = "Stamp";
pub const CLASSES_TABLE_NAME: &str = "Classes";
pub const TARGETS_TABLE_NAME: &str = "Annotation Targets";
pub const CONTAINER_TABLE_NAME: &str = "Container";
pub const RESOLVED_REFS_TABLE_NAME: &str = "Resolved References";
pub const UNRESOLVED_REFS_TABLE_NAME: &str = "Unresolved References";

pub const VERSION_10: &str = "1.0";
pub const VERSION_20: &str = "2.0";

/// Upper bound on a cache file we are willing to load.
///
/// A corrupted length prefix should degrade to a cache miss rather than an
/// enormous allocation.
pub const MAX_FILE_BYTES: usize = 256 * 1024 * 1024;
