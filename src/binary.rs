//! Framing of a single cache file.
//!
//! ```text
//! MAGIC_BEGIN
//! HEADER   4 x HEADER_WIDTH entries: ENCODING, TABLE, VERSION, TIMESTAMP
//! DATA     u32 record count, u32 byte length, { u32 body length, body }*
//! STRINGS  u32 count, { u32 length, utf-8 bytes }*
//! TRAILER  u32 record count, u32 string count
//! MAGIC_END
//! ```
//!
//! Integers are big-endian. Record bodies refer to strings by pool index.
//! [`TableWriter`] produces this layout; [`TableFile::parse`] validates the
//! framing and hands out one [`RecordReader`] per record. What the records
//! mean is up to the per-table codecs.

use crate::consts::{
    DATA_BYTE, ENCODING, ENCODING_BYTE, HEADER_BYTE, HEADER_VALUE_MAX, HEADER_WIDTH,
    MAGIC_BEGIN_BYTES, MAGIC_END_BYTES, MAX_FILE_BYTES, STRINGS_BYTE, TABLE_BYTE, TIMESTAMP_BYTE,
    TRAILER_BYTE, VERSION_BYTE,
};
use crate::error::{EncodeError, FormatError, ParseError, ParseErrorKind};
use crate::model::{StringPool, TableKind, TableVersion};

/// Decoded header entries. Table name and version stay raw here: an unknown
/// name or version is not corruption, so the codec layer judges them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Header {
    pub encoding: String,
    pub table: String,
    pub version: String,
    pub timestamp: u64,
}

pub struct TableWriter {
    kind: TableKind,
    version: TableVersion,
    timestamp: u64,
    pool: StringPool,
    data: Vec<u8>,
    records: u32,
}

impl TableWriter {
    pub fn new(kind: TableKind, version: TableVersion, timestamp: u64) -> Self {
        Self {
            kind,
            version,
            timestamp,
            pool: StringPool::new(),
            data: Vec::new(),
            records: 0,
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    /// Append one length-prefixed record built by `build`.
    pub fn record(
        &mut self,
        build: impl FnOnce(&mut RecordWriter<'_>) -> Result<(), EncodeError>,
    ) -> Result<(), EncodeError> {
        let mut writer = RecordWriter {
            pool: &mut self.pool,
            body: Vec::new(),
        };
        build(&mut writer)?;
        let body = writer.body;

        let len = u32::try_from(body.len()).map_err(|_| EncodeError::TooLarge { what: "record" })?;
        self.records = self
            .records
            .checked_add(1)
            .ok_or(EncodeError::TooLarge { what: "record count" })?;
        self.data.extend_from_slice(&len.to_be_bytes());
        self.data.extend_from_slice(&body);
        Ok(())
    }

    /// Seal the file. Output depends only on the records written, the
    /// version and the timestamp.
    pub fn finish(self) -> Result<Vec<u8>, EncodeError> {
        let data_len =
            u32::try_from(self.data.len()).map_err(|_| EncodeError::TooLarge { what: "data region" })?;
        let string_count = u32::try_from(self.pool.len())
            .map_err(|_| EncodeError::TooLarge { what: "string pool" })?;

        let strings_len: usize = self.pool.strings().iter().map(|s| s.len() + 4).sum();
        let mut out = Vec::with_capacity(
            4 + 1 + 4 * HEADER_WIDTH + 9 + self.data.len() + 5 + strings_len + 9 + 4,
        );

        out.extend_from_slice(&MAGIC_BEGIN_BYTES);

        out.push(HEADER_BYTE);
        write_header_entry(&mut out, ENCODING_BYTE, ENCODING)?;
        write_header_entry(&mut out, TABLE_BYTE, self.kind.name())?;
        write_header_entry(&mut out, VERSION_BYTE, self.version.as_str())?;
        write_header_entry(&mut out, TIMESTAMP_BYTE, &self.timestamp.to_string())?;

        out.push(DATA_BYTE);
        out.extend_from_slice(&self.records.to_be_bytes());
        out.extend_from_slice(&data_len.to_be_bytes());
        out.extend_from_slice(&self.data);

        out.push(STRINGS_BYTE);
        out.extend_from_slice(&string_count.to_be_bytes());
        for s in self.pool.strings() {
            let len = u32::try_from(s.len()).map_err(|_| EncodeError::TooLarge { what: "string" })?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        out.push(TRAILER_BYTE);
        out.extend_from_slice(&self.records.to_be_bytes());
        out.extend_from_slice(&string_count.to_be_bytes());

        out.extend_from_slice(&MAGIC_END_BYTES);
        Ok(out)
    }
}

fn write_header_entry(out: &mut Vec<u8>, tag: u8, value: &str) -> Result<(), EncodeError> {
    let bytes = value.as_bytes();
    if bytes.len() > HEADER_VALUE_MAX {
        return Err(EncodeError::HeaderTooWide {
            tag,
            len: bytes.len(),
            max: HEADER_VALUE_MAX,
        });
    }
    out.push(tag);
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    out.resize(out.len() + HEADER_VALUE_MAX - bytes.len(), 0);
    Ok(())
}

/// Builds the body of one record.
pub struct RecordWriter<'a> {
    pool: &'a mut StringPool,
    body: Vec<u8>,
}

impl RecordWriter<'_> {
    pub fn string(&mut self, tag: u8, value: &str) -> Result<(), EncodeError> {
        let idx = self
            .pool
            .intern(value)
            .ok_or(EncodeError::TooLarge { what: "string pool" })?;
        self.body.push(tag);
        self.body.extend_from_slice(&idx.to_be_bytes());
        Ok(())
    }

    pub fn optional_string(&mut self, tag: u8, value: Option<&str>) -> Result<(), EncodeError> {
        match value {
            Some(v) => self.string(tag, v),
            None => Ok(()),
        }
    }

    pub fn u32(&mut self, tag: u8, value: u32) {
        self.body.push(tag);
        self.body.extend_from_slice(&value.to_be_bytes());
    }

    pub fn count(&mut self, n: usize) -> Result<(), EncodeError> {
        let n = u32::try_from(n).map_err(|_| EncodeError::TooLarge { what: "field count" })?;
        self.body.extend_from_slice(&n.to_be_bytes());
        Ok(())
    }
}

/// A cache file whose framing has been validated.
#[derive(Debug)]
pub struct TableFile<'a> {
    pub header: Header,
    records: Vec<(usize, &'a [u8])>,
    strings: Vec<&'a str>,
}

impl<'a> TableFile<'a> {
    /// Validate magic bytes, regions, header entries and trailer. Any failure
    /// rejects the whole file.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FormatError> {
        if bytes.len() > MAX_FILE_BYTES {
            return Err(FormatError::TooLarge {
                limit: MAX_FILE_BYTES,
            });
        }
        if bytes.len() < MAGIC_BEGIN_BYTES.len() || bytes[..4] != MAGIC_BEGIN_BYTES {
            return Err(FormatError::BadMagicBegin);
        }
        if bytes.len() < 8 || bytes[bytes.len() - 4..] != MAGIC_END_BYTES {
            return Err(FormatError::BadMagicEnd);
        }

        let mut input = Input {
            bytes: &bytes[..bytes.len() - 4],
            pos: 4,
        };

        input.region(HEADER_BYTE, "header")?;
        let encoding = input.header_entry(ENCODING_BYTE)?;
        let table = input.header_entry(TABLE_BYTE)?;
        let version = input.header_entry(VERSION_BYTE)?;
        let timestamp = input.header_entry(TIMESTAMP_BYTE)?;
        if encoding != ENCODING {
            return Err(FormatError::UnsupportedEncoding(encoding));
        }
        let timestamp = timestamp
            .parse::<u64>()
            .map_err(|_| FormatError::BadTimestamp(timestamp.clone()))?;

        input.region(DATA_BYTE, "data")?;
        let record_count = input.u32("data")?;
        let data_len = input.u32("data")? as usize;
        let data_start = input.pos;
        let data = input.take(data_len, "data")?;
        let records = split_records(data, data_start, record_count)?;

        input.region(STRINGS_BYTE, "strings")?;
        let string_count = input.u32("strings")?;
        let mut strings = Vec::with_capacity((string_count as usize).min(input.remaining() / 4));
        for index in 0..string_count {
            let len = input.u32("strings")? as usize;
            let raw = input.take(len, "strings")?;
            let s = std::str::from_utf8(raw).map_err(|_| FormatError::StringNotUtf8 { index })?;
            strings.push(s);
        }

        input.region(TRAILER_BYTE, "trailer")?;
        let trailer_records = input.u32("trailer")?;
        let trailer_strings = input.u32("trailer")?;
        if trailer_records != record_count || trailer_strings != string_count {
            return Err(FormatError::TrailerMismatch {
                records: trailer_records,
                strings: trailer_strings,
            });
        }
        if input.remaining() != 0 {
            return Err(FormatError::TrailingBytes {
                count: input.remaining(),
            });
        }

        Ok(Self {
            header: Header {
                encoding,
                table,
                version,
                timestamp,
            },
            records,
            strings,
        })
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn records(&self) -> impl Iterator<Item = RecordReader<'_>> + '_ {
        self.records
            .iter()
            .enumerate()
            .map(|(index, &(offset, body))| RecordReader {
                index,
                offset,
                body,
                pos: 0,
                strings: &self.strings,
            })
    }
}

fn split_records(
    data: &[u8],
    data_start: usize,
    count: u32,
) -> Result<Vec<(usize, &[u8])>, FormatError> {
    let mut records = Vec::with_capacity((count as usize).min(data.len() / 4));
    let mut input = Input {
        bytes: data,
        pos: 0,
    };
    for _ in 0..count {
        let len = input.u32("data").map_err(|_| FormatError::Truncated {
            region: "data",
            offset: data_start + input.pos,
        })? as usize;
        let offset = data_start + input.pos;
        let body = input.take(len, "data").map_err(|_| FormatError::Truncated {
            region: "data",
            offset,
        })?;
        records.push((offset, body));
    }
    if input.pos != data.len() {
        return Err(FormatError::DataLengthMismatch {
            declared: data.len(),
            actual: input.pos,
        });
    }
    Ok(records)
}

struct Input<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize, region: &'static str) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::Truncated {
                region,
                offset: self.pos,
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self, region: &'static str) -> Result<u32, FormatError> {
        let raw = self.take(4, region)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn region(&mut self, expected: u8, region: &'static str) -> Result<(), FormatError> {
        let offset = self.pos;
        let found = self.take(1, region)?[0];
        if found != expected {
            return Err(FormatError::UnexpectedRegion {
                region,
                expected,
                found,
                offset,
            });
        }
        Ok(())
    }

    fn header_entry(&mut self, expected: u8) -> Result<String, FormatError> {
        let entry = self.take(HEADER_WIDTH, "header")?;
        let tag = entry[0];
        if tag != expected {
            return Err(FormatError::BadHeaderTag {
                expected,
                found: tag,
            });
        }
        let len = entry[1] as usize;
        if len > HEADER_VALUE_MAX {
            return Err(FormatError::BadHeaderLength { tag, len });
        }
        let value = std::str::from_utf8(&entry[2..2 + len])
            .map_err(|_| FormatError::HeaderNotUtf8 { tag })?;
        Ok(value.to_string())
    }
}

/// Cursor over one record body.
#[derive(Debug)]
pub struct RecordReader<'a> {
    index: usize,
    offset: usize,
    body: &'a [u8],
    pos: usize,
    strings: &'a [&'a str],
}

impl RecordReader<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            record: self.index,
            offset: self.offset + self.pos,
            kind,
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.body.len()
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.body.get(self.pos).copied()
    }

    pub fn next_tag(&mut self) -> Result<u8, ParseError> {
        let tag = self
            .peek_tag()
            .ok_or_else(|| self.error(ParseErrorKind::UnexpectedEnd))?;
        self.pos += 1;
        Ok(tag)
    }

    pub fn expect_tag(&mut self, expected: u8) -> Result<(), ParseError> {
        let found = self
            .peek_tag()
            .ok_or_else(|| self.error(ParseErrorKind::UnexpectedEnd))?;
        if found != expected {
            return Err(self.error(ParseErrorKind::UnexpectedTag { expected, found }));
        }
        self.pos += 1;
        Ok(())
    }

    pub fn raw_u32(&mut self) -> Result<u32, ParseError> {
        if self.body.len() - self.pos < 4 {
            return Err(self.error(ParseErrorKind::UnexpectedEnd));
        }
        let raw = &self.body[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// A string reference without a leading tag.
    pub fn string_ref(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let index = self.raw_u32()?;
        match self.strings.get(index as usize) {
            Some(s) => Ok((*s).to_string()),
            None => {
                self.pos = start;
                Err(self.error(ParseErrorKind::StringIndexOutOfRange {
                    index,
                    len: self.strings.len(),
                }))
            }
        }
    }

    pub fn string(&mut self, tag: u8) -> Result<String, ParseError> {
        self.expect_tag(tag)?;
        self.string_ref()
    }

    pub fn optional_string(&mut self, tag: u8) -> Result<Option<String>, ParseError> {
        if self.peek_tag() == Some(tag) {
            return self.string(tag).map(Some);
        }
        Ok(None)
    }

    pub fn u32(&mut self, tag: u8) -> Result<u32, ParseError> {
        self.expect_tag(tag)?;
        self.raw_u32()
    }

    /// Every byte of the body must be consumed.
    pub fn finish(&self) -> Result<(), ParseError> {
        if !self.at_end() {
            return Err(self.error(ParseErrorKind::TrailingBytes {
                count: self.body.len() - self.pos,
            }));
        }
        Ok(())
    }
}
