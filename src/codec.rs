//! Per-table record codecs.
//!
//! Each table type implements [`Writable`] and [`Readable`]; version
//! dispatch stays inside each implementation because tables are versioned
//! independently. [`decode_any`] picks the codec from the table name in the
//! header.

use crate::binary::{Header, RecordReader, TableFile, TableWriter};
use crate::consts::{
    CLASS_BYTE, CLASS_SOURCE_BYTE, INTERFACE_BYTE, MODIFIERS_BYTE, NAME_BYTE, PACKAGE_BYTE,
    POLICY_BYTE, SIGNATURE_BYTE, STAMP_BYTE, SUPERCLASS_BYTE,
};
use crate::error::{DecodeError, EncodeError, ParseError, ParseErrorKind};
use crate::model::{
    AnnotationTarget, ClassRecord, ClassTargets, ClassesTable, ContainerEntry, ContainerTable,
    ReferencesTable, ScanPolicy, StampTable, Table, TableKind, TableVersion, TargetKind,
    TargetsTable,
};

/// Why a record could not be added to the table.
#[derive(Debug)]
pub enum RecordError {
    /// The record is malformed; skip it and keep going.
    Parse(ParseError),
    /// The record proves the whole table undecodable.
    Table(DecodeError),
}

impl From<ParseError> for RecordError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

pub trait Writable {
    fn write_records(&self, writer: &mut TableWriter) -> Result<(), EncodeError>;
}

pub trait Readable: Default {
    /// Decode one record into `table`. A failed record must leave `table`
    /// untouched.
    fn read_record(
        version: TableVersion,
        record: &mut RecordReader<'_>,
        table: &mut Self,
    ) -> Result<(), RecordError>;
}

/// Ties a table type to the kinds of file that hold it.
pub trait TableType: Readable + Writable {
    const KINDS: &'static [TableKind];
    /// Exact record count a well-formed file holds, when fixed.
    const RECORDS: Option<usize> = None;
}

/// Best-effort result of decoding one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<T> {
    pub header: Header,
    pub version: TableVersion,
    pub table: T,
    pub errors: Vec<ParseError>,
}

impl<T> Decoded<T> {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        Decoded {
            header: self.header,
            version: self.version,
            table: f(self.table),
            errors: self.errors,
        }
    }
}

pub fn encode<T: TableType>(
    kind: TableKind,
    table: &T,
    version: TableVersion,
    timestamp: u64,
) -> Result<Vec<u8>, EncodeError> {
    if !T::KINDS.contains(&kind) {
        return Err(EncodeError::KindMismatch { kind });
    }
    if !kind.supports(version) {
        return Err(EncodeError::UnsupportedVersion {
            table: kind,
            version,
        });
    }
    let mut writer = TableWriter::new(kind, version, timestamp);
    table.write_records(&mut writer)?;
    writer.finish()
}

pub fn encode_latest<T: TableType>(
    kind: TableKind,
    table: &T,
    timestamp: u64,
) -> Result<Vec<u8>, EncodeError> {
    encode(kind, table, kind.latest(), timestamp)
}

pub fn encode_table(
    table: &Table,
    version: TableVersion,
    timestamp: u64,
) -> Result<Vec<u8>, EncodeError> {
    let kind = table.kind();
    match table {
        Table::Stamp(t) => encode(kind, t, version, timestamp),
        Table::Classes(t) => encode(kind, t, version, timestamp),
        Table::Targets(t) => encode(kind, t, version, timestamp),
        Table::Container(t) => encode(kind, t, version, timestamp),
        Table::ResolvedRefs(t) | Table::UnresolvedRefs(t) => encode(kind, t, version, timestamp),
    }
}

pub fn decode<T: TableType>(kind: TableKind, bytes: &[u8]) -> Result<Decoded<T>, DecodeError> {
    let file = TableFile::parse(bytes)?;
    decode_file(kind, &file)
}

/// Decode a file of any table kind, selected by its header.
pub fn decode_any(bytes: &[u8]) -> Result<Decoded<Table>, DecodeError> {
    let file = TableFile::parse(bytes)?;
    let kind = TableKind::from_name(&file.header.table)
        .ok_or_else(|| DecodeError::UnknownTable(file.header.table.clone()))?;
    Ok(match kind {
        TableKind::Stamp => decode_file(kind, &file)?.map(Table::Stamp),
        TableKind::Classes => decode_file(kind, &file)?.map(Table::Classes),
        TableKind::Targets => decode_file(kind, &file)?.map(Table::Targets),
        TableKind::Container => decode_file(kind, &file)?.map(Table::Container),
        TableKind::ResolvedRefs => decode_file(kind, &file)?.map(Table::ResolvedRefs),
        TableKind::UnresolvedRefs => decode_file(kind, &file)?.map(Table::UnresolvedRefs),
    })
}

fn decode_file<T: TableType>(
    kind: TableKind,
    file: &TableFile<'_>,
) -> Result<Decoded<T>, DecodeError> {
    let version = check_header(&file.header, kind)?;
    if let Some(expected) = T::RECORDS
        && file.record_count() != expected
    {
        return Err(DecodeError::RecordCount {
            table: kind,
            expected,
            found: file.record_count(),
        });
    }

    let mut table = T::default();
    let mut errors = Vec::new();
    for mut record in file.records() {
        match T::read_record(version, &mut record, &mut table) {
            Ok(()) => {}
            Err(RecordError::Parse(err)) => errors.push(err),
            Err(RecordError::Table(err)) => return Err(err),
        }
    }

    Ok(Decoded {
        header: file.header.clone(),
        version,
        table,
        errors,
    })
}

fn check_header(header: &Header, kind: TableKind) -> Result<TableVersion, DecodeError> {
    if header.table != kind.name() {
        return Err(DecodeError::WrongTable {
            expected: kind,
            found: header.table.clone(),
        });
    }
    TableVersion::parse(&header.version)
        .filter(|v| kind.supports(*v))
        .ok_or_else(|| DecodeError::UnsupportedVersion {
            table: kind,
            version: header.version.clone(),
        })
}

impl Writable for StampTable {
    fn write_records(&self, writer: &mut TableWriter) -> Result<(), EncodeError> {
        writer.record(|r| {
            r.string(NAME_BYTE, &self.name)?;
            r.string(STAMP_BYTE, &self.stamp)
        })
    }
}

impl Readable for StampTable {
    fn read_record(
        _version: TableVersion,
        record: &mut RecordReader<'_>,
        table: &mut Self,
    ) -> Result<(), RecordError> {
        let name = record.string(NAME_BYTE)?;
        let stamp = record.string(STAMP_BYTE)?;
        record.finish()?;
        *table = StampTable { name, stamp };
        Ok(())
    }
}

impl TableType for StampTable {
    const KINDS: &'static [TableKind] = &[TableKind::Stamp];
    const RECORDS: Option<usize> = Some(1);
}

impl Writable for ClassesTable {
    fn write_records(&self, writer: &mut TableWriter) -> Result<(), EncodeError> {
        for package in &self.packages {
            writer.record(|r| r.string(PACKAGE_BYTE, package))?;
        }
        for class in &self.classes {
            writer.record(|r| {
                r.string(CLASS_BYTE, &class.name)?;
                r.string(PACKAGE_BYTE, &class.package)?;
                r.optional_string(CLASS_SOURCE_BYTE, class.source.as_deref())?;
                r.optional_string(SUPERCLASS_BYTE, class.superclass.as_deref())?;
                r.count(class.interfaces.len())?;
                for interface in &class.interfaces {
                    r.string(INTERFACE_BYTE, interface)?;
                }
                r.u32(MODIFIERS_BYTE, class.modifiers);
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl Readable for ClassesTable {
    fn read_record(
        _version: TableVersion,
        record: &mut RecordReader<'_>,
        table: &mut Self,
    ) -> Result<(), RecordError> {
        match record.next_tag()? {
            PACKAGE_BYTE => {
                let package = record.string_ref()?;
                record.finish()?;
                table.packages.push(package);
            }
            CLASS_BYTE => {
                let class = read_class(record)?;
                table.classes.push(class);
            }
            other => return Err(record.error(ParseErrorKind::UnknownTag(other)).into()),
        }
        Ok(())
    }
}

fn read_class(record: &mut RecordReader<'_>) -> Result<ClassRecord, ParseError> {
    let name = record.string_ref()?;
    let package = record.string(PACKAGE_BYTE)?;
    let source = record.optional_string(CLASS_SOURCE_BYTE)?;
    let superclass = record.optional_string(SUPERCLASS_BYTE)?;
    let count = record.raw_u32()?;
    let mut interfaces = Vec::new();
    for _ in 0..count {
        interfaces.push(record.string(INTERFACE_BYTE)?);
    }
    // Same tag value as INTERFACE_BYTE; position makes it the modifiers.
    let modifiers = record.u32(MODIFIERS_BYTE)?;
    record.finish()?;
    Ok(ClassRecord {
        package,
        name,
        source,
        superclass,
        interfaces,
        modifiers,
    })
}

impl TableType for ClassesTable {
    const KINDS: &'static [TableKind] = &[TableKind::Classes];
}

impl Writable for TargetsTable {
    fn write_records(&self, writer: &mut TableWriter) -> Result<(), EncodeError> {
        for class in &self.classes {
            writer.record(|r| {
                r.string(CLASS_BYTE, &class.class_name)?;
                r.count(class.annotations.len())?;
                for target in &class.annotations {
                    r.string(target.kind.tag(), &target.annotation)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl Readable for TargetsTable {
    fn read_record(
        _version: TableVersion,
        record: &mut RecordReader<'_>,
        table: &mut Self,
    ) -> Result<(), RecordError> {
        let class_name = record.string(CLASS_BYTE)?;
        let count = record.raw_u32()?;
        let mut annotations = Vec::new();
        for _ in 0..count {
            let tag = record.next_tag()?;
            let kind = TargetKind::from_tag(tag)
                .ok_or_else(|| record.error(ParseErrorKind::UnknownTag(tag)))?;
            let annotation = record.string_ref()?;
            annotations.push(AnnotationTarget { kind, annotation });
        }
        record.finish()?;
        table.classes.push(ClassTargets {
            class_name,
            annotations,
        });
        Ok(())
    }
}

impl TableType for TargetsTable {
    const KINDS: &'static [TableKind] = &[TableKind::Targets];
}

impl Writable for ContainerTable {
    fn write_records(&self, writer: &mut TableWriter) -> Result<(), EncodeError> {
        let version = writer.version();
        for entry in &self.entries {
            if version == TableVersion::V1_0 && entry.signature.is_some() {
                return Err(EncodeError::FieldNotInVersion {
                    table: TableKind::Container,
                    version,
                    field: "signature",
                });
            }
            writer.record(|r| {
                r.string(NAME_BYTE, &entry.name)?;
                r.string(POLICY_BYTE, entry.policy.as_str())?;
                r.optional_string(SIGNATURE_BYTE, entry.signature.as_deref())
            })?;
        }
        Ok(())
    }
}

impl Readable for ContainerTable {
    fn read_record(
        version: TableVersion,
        record: &mut RecordReader<'_>,
        table: &mut Self,
    ) -> Result<(), RecordError> {
        let name = record.string(NAME_BYTE)?;
        let raw_policy = record.string(POLICY_BYTE)?;
        let policy = ScanPolicy::parse(&raw_policy).ok_or_else(|| {
            record.error(ParseErrorKind::InvalidValue {
                field: "policy",
                value: raw_policy.clone(),
            })
        })?;

        let signature = match version {
            TableVersion::V1_0 => {
                if record.peek_tag() == Some(SIGNATURE_BYTE) {
                    return Err(RecordError::Table(DecodeError::VersionMismatch {
                        table: TableKind::Container,
                        declared: version,
                        detail: "signature fields introduced in 2.0",
                    }));
                }
                None
            }
            TableVersion::V2_0 => record.optional_string(SIGNATURE_BYTE)?,
        };
        record.finish()?;

        table.entries.push(ContainerEntry {
            name,
            policy,
            signature,
        });
        Ok(())
    }
}

impl TableType for ContainerTable {
    const KINDS: &'static [TableKind] = &[TableKind::Container];
}

impl Writable for ReferencesTable {
    fn write_records(&self, writer: &mut TableWriter) -> Result<(), EncodeError> {
        for name in &self.names {
            writer.record(|r| r.string(CLASS_BYTE, name))?;
        }
        Ok(())
    }
}

impl Readable for ReferencesTable {
    fn read_record(
        _version: TableVersion,
        record: &mut RecordReader<'_>,
        table: &mut Self,
    ) -> Result<(), RecordError> {
        let name = record.string(CLASS_BYTE)?;
        record.finish()?;
        table.names.push(name);
        Ok(())
    }
}

impl TableType for ReferencesTable {
    const KINDS: &'static [TableKind] = &[TableKind::ResolvedRefs, TableKind::UnresolvedRefs];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{HEADER_WIDTH, MAGIC_BEGIN_BYTES, MAGIC_END_BYTES};
    use crate::error::FormatError;

    const TS: u64 = 1_700_000_000_000;

    fn foo_record() -> ClassRecord {
        ClassRecord {
            package: "com.acme".to_string(),
            name: "Foo".to_string(),
            source: None,
            superclass: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
            modifiers: 0x21,
        }
    }

    fn sample_classes() -> ClassesTable {
        ClassesTable {
            packages: vec!["com.acme".to_string()],
            classes: vec![
                foo_record(),
                ClassRecord {
                    package: "com.acme".to_string(),
                    name: "Bar".to_string(),
                    source: Some("lib/acme.jar".to_string()),
                    superclass: Some("com.acme.Foo".to_string()),
                    interfaces: vec![
                        "java.io.Serializable".to_string(),
                        "java.lang.Comparable".to_string(),
                    ],
                    modifiers: 0x411,
                },
            ],
        }
    }

    fn sample_targets() -> TargetsTable {
        TargetsTable {
            classes: vec![
                ClassTargets {
                    class_name: "com.acme.package-info".to_string(),
                    annotations: vec![AnnotationTarget {
                        kind: TargetKind::Package,
                        annotation: "jakarta.xml.bind.annotation.XmlSchema".to_string(),
                    }],
                },
                ClassTargets {
                    class_name: "com.acme.Foo".to_string(),
                    annotations: vec![
                        AnnotationTarget {
                            kind: TargetKind::Class,
                            annotation: "jakarta.ejb.Stateless".to_string(),
                        },
                        AnnotationTarget {
                            kind: TargetKind::Field,
                            annotation: "jakarta.inject.Inject".to_string(),
                        },
                        AnnotationTarget {
                            kind: TargetKind::Method,
                            annotation: "jakarta.annotation.PostConstruct".to_string(),
                        },
                    ],
                },
            ],
        }
    }

    fn sample_containers(signed: bool) -> ContainerTable {
        let signature = |s: &str| signed.then(|| s.to_string());
        ContainerTable {
            entries: vec![
                ContainerEntry {
                    name: "WEB-INF/classes".to_string(),
                    policy: ScanPolicy::Seed,
                    signature: signature("c0ffee"),
                },
                ContainerEntry {
                    name: "WEB-INF/lib/util.jar".to_string(),
                    policy: ScanPolicy::Partial,
                    signature: signature("beef"),
                },
            ],
        }
    }

    #[test]
    fn classes_scenario_round_trips_with_no_errors() {
        let table = ClassesTable {
            packages: Vec::new(),
            classes: vec![foo_record()],
        };
        let bytes = encode(TableKind::Classes, &table, TableVersion::V1_0, TS).unwrap();
        let decoded = decode::<ClassesTable>(TableKind::Classes, &bytes).unwrap();
        assert_eq!(decoded.table.classes, vec![foo_record()]);
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.version, TableVersion::V1_0);
        assert_eq!(decoded.header.timestamp, TS);
    }

    #[test]
    fn every_supported_version_of_every_table_round_trips() {
        let tables = [
            Table::Stamp(StampTable {
                name: "app/web.war".to_string(),
                stamp: "abc123".to_string(),
            }),
            Table::Classes(sample_classes()),
            Table::Targets(sample_targets()),
            Table::ResolvedRefs(ReferencesTable {
                names: vec!["java.lang.Object".to_string()],
            }),
            Table::UnresolvedRefs(ReferencesTable {
                names: vec!["org.missing.Thing".to_string()],
            }),
        ];
        for table in tables {
            for &version in table.kind().versions() {
                let bytes = encode_table(&table, version, TS).unwrap();
                let decoded = decode_any(&bytes).unwrap();
                assert_eq!(decoded.table, table, "{} {version}", table.kind());
                assert!(decoded.errors.is_empty());
            }
        }

        let v1 = Table::Container(sample_containers(false));
        let v2 = Table::Container(sample_containers(true));
        for (table, version) in [(&v1, TableVersion::V1_0), (&v1, TableVersion::V2_0), (&v2, TableVersion::V2_0)] {
            let bytes = encode_table(table, version, TS).unwrap();
            assert_eq!(&decode_any(&bytes).unwrap().table, table);
        }
    }

    #[test]
    fn empty_tables_are_valid_files() {
        let bytes = encode(TableKind::Targets, &TargetsTable::default(), TableVersion::V1_0, TS)
            .unwrap();
        let decoded = decode::<TargetsTable>(TableKind::Targets, &bytes).unwrap();
        assert!(decoded.table.classes.is_empty());
        assert!(decoded.is_clean());
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode(TableKind::Classes, &sample_classes(), TableVersion::V1_0, TS).unwrap();
        let b = encode(TableKind::Classes, &sample_classes(), TableVersion::V1_0, TS).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn flipping_any_magic_byte_is_corruption() {
        let bytes = encode(TableKind::Classes, &sample_classes(), TableVersion::V1_0, TS).unwrap();
        let end = bytes.len() - MAGIC_END_BYTES.len();
        let positions = (0..MAGIC_BEGIN_BYTES.len()).chain(end..bytes.len());
        for pos in positions {
            let mut damaged = bytes.clone();
            damaged[pos] ^= 0xFF;
            let err = decode::<ClassesTable>(TableKind::Classes, &damaged).unwrap_err();
            assert!(err.is_corruption(), "byte {pos}: {err}");
            let expected = if pos < 4 {
                FormatError::BadMagicBegin
            } else {
                FormatError::BadMagicEnd
            };
            assert_eq!(err, DecodeError::Corrupt(expected));
        }
    }

    #[test]
    fn one_bad_string_index_costs_exactly_one_record() {
        let table = ReferencesTable {
            names: vec!["a.A".to_string(), "b.B".to_string(), "c.C".to_string()],
        };
        let mut bytes = encode(TableKind::ResolvedRefs, &table, TableVersion::V1_0, TS).unwrap();

        // Second record: skip magic, header, data prefix and the first record
        // (u32 length + tag + u32 index), then that record's length and tag.
        let first_record = 4 + 1 + 4 * HEADER_WIDTH + 1 + 8;
        let index_at = first_record + (4 + 5) + 4 + 1;
        bytes[index_at..index_at + 4].copy_from_slice(&99u32.to_be_bytes());

        let decoded = decode::<ReferencesTable>(TableKind::ResolvedRefs, &bytes).unwrap();
        assert_eq!(decoded.table.names, vec!["a.A".to_string(), "c.C".to_string()]);
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.errors[0].record, 1);
        assert_eq!(
            decoded.errors[0].kind,
            ParseErrorKind::StringIndexOutOfRange { index: 99, len: 3 }
        );
    }

    #[test]
    fn container_two_point_oh_data_under_one_point_oh_header_is_a_version_mismatch() {
        let bytes = encode(TableKind::Container, &sample_containers(true), TableVersion::V2_0, TS)
            .unwrap();

        // Rewrite the VERSION entry in place; "1.0" and "2.0" have equal width.
        let version_value = 4 + 1 + 2 * HEADER_WIDTH + 2;
        let mut forged = bytes.clone();
        forged[version_value..version_value + 3].copy_from_slice(b"1.0");

        let err = decode::<ContainerTable>(TableKind::Container, &forged).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::VersionMismatch {
                table: TableKind::Container,
                declared: TableVersion::V1_0,
                ..
            }
        ));
        assert!(!err.is_corruption());

        let classes = encode(TableKind::Classes, &sample_classes(), TableVersion::V1_0, TS).unwrap();
        let sibling = decode::<ClassesTable>(TableKind::Classes, &classes).unwrap();
        assert_eq!(sibling.table, sample_classes());
    }

    #[test]
    fn signatures_cannot_be_written_as_version_one() {
        let err = encode(TableKind::Container, &sample_containers(true), TableVersion::V1_0, TS)
            .unwrap_err();
        assert!(matches!(err, EncodeError::FieldNotInVersion { field: "signature", .. }));
    }

    #[test]
    fn unknown_version_is_distinct_from_corruption() {
        let bytes = encode(TableKind::Classes, &sample_classes(), TableVersion::V1_0, TS).unwrap();
        let version_value = 4 + 1 + 2 * HEADER_WIDTH + 2;
        let mut forged = bytes.clone();
        forged[version_value..version_value + 3].copy_from_slice(b"2.0");

        let err = decode::<ClassesTable>(TableKind::Classes, &forged).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnsupportedVersion {
                table: TableKind::Classes,
                version: "2.0".to_string(),
            }
        );
    }

    #[test]
    fn stamp_file_must_hold_exactly_one_record() {
        let empty = TableWriter::new(TableKind::Stamp, TableVersion::V1_0, TS)
            .finish()
            .unwrap();
        let err = decode::<StampTable>(TableKind::Stamp, &empty).unwrap_err();
        assert_eq!(
            err,
            DecodeError::RecordCount {
                table: TableKind::Stamp,
                expected: 1,
                found: 0,
            }
        );
        assert!(err.is_corruption());

        let mut writer = TableWriter::new(TableKind::Stamp, TableVersion::V1_0, TS);
        for stamp in ["s1", "s2"] {
            writer
                .record(|r| {
                    r.string(NAME_BYTE, "lib/a.jar")?;
                    r.string(STAMP_BYTE, stamp)
                })
                .unwrap();
        }
        let twice = writer.finish().unwrap();
        assert!(matches!(
            decode_any(&twice).unwrap_err(),
            DecodeError::RecordCount { found: 2, .. }
        ));

        let stamp = StampTable {
            name: "lib/a.jar".to_string(),
            stamp: "s1".to_string(),
        };
        let one = encode(TableKind::Stamp, &stamp, TableVersion::V1_0, TS).unwrap();
        assert_eq!(decode::<StampTable>(TableKind::Stamp, &one).unwrap().table, stamp);
    }

    #[test]
    fn reading_the_wrong_table_is_rejected() {
        let bytes = encode(TableKind::ResolvedRefs, &ReferencesTable::default(), TableVersion::V1_0, TS)
            .unwrap();
        let err = decode::<ReferencesTable>(TableKind::UnresolvedRefs, &bytes).unwrap_err();
        assert!(matches!(err, DecodeError::WrongTable { expected: TableKind::UnresolvedRefs, .. }));

        let err = encode(TableKind::Targets, &ReferencesTable::default(), TableVersion::V1_0, TS)
            .unwrap_err();
        assert_eq!(err, EncodeError::KindMismatch { kind: TableKind::Targets });
    }

    #[test]
    fn modifiers_follow_interfaces_despite_the_shared_tag() {
        let table = sample_classes();
        let bytes = encode(TableKind::Classes, &table, TableVersion::V1_0, TS).unwrap();
        let decoded = decode::<ClassesTable>(TableKind::Classes, &bytes).unwrap();
        let bar = &decoded.table.classes[1];
        assert_eq!(bar.interfaces.len(), 2);
        assert_eq!(bar.modifiers, 0x411);
    }
}
