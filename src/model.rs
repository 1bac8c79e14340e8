//! In-memory model of the cache tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::consts::{
    CLASS_ANNOTATION_BYTE, CLASSES_TABLE_NAME, CONTAINER_TABLE_NAME, FIELD_ANNOTATION_BYTE,
    METHOD_ANNOTATION_BYTE, PACKAGE_ANNOTATION_BYTE, RESOLVED_REFS_TABLE_NAME, STAMP_TABLE_NAME,
    TARGETS_TABLE_NAME, UNRESOLVED_REFS_TABLE_NAME, VERSION_10, VERSION_20,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableVersion {
    V1_0,
    V2_0,
}

impl TableVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1_0 => VERSION_10,
            Self::V2_0 => VERSION_20,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            VERSION_10 => Some(Self::V1_0),
            VERSION_20 => Some(Self::V2_0),
            _ => None,
        }
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of tables a cache file can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableKind {
    Stamp,
    Classes,
    Targets,
    Container,
    ResolvedRefs,
    UnresolvedRefs,
}

impl TableKind {
    pub const ALL: [TableKind; 6] = [
        Self::Stamp,
        Self::Classes,
        Self::Targets,
        Self::Container,
        Self::ResolvedRefs,
        Self::UnresolvedRefs,
    ];

    /// Data tables, in the order they are written; the stamp goes last.
    pub const DATA: [TableKind; 5] = [
        Self::Classes,
        Self::Targets,
        Self::Container,
        Self::ResolvedRefs,
        Self::UnresolvedRefs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Stamp => STAMP_TABLE_NAME,
            Self::Classes => CLASSES_TABLE_NAME,
            Self::Targets => TARGETS_TABLE_NAME,
            Self::Container => CONTAINER_TABLE_NAME,
            Self::ResolvedRefs => RESOLVED_REFS_TABLE_NAME,
            Self::UnresolvedRefs => UNRESOLVED_REFS_TABLE_NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn versions(self) -> &'static [TableVersion] {
        match self {
            Self::Container => &[TableVersion::V1_0, TableVersion::V2_0],
            _ => &[TableVersion::V1_0],
        }
    }

    pub fn supports(self, version: TableVersion) -> bool {
        self.versions().contains(&version)
    }

    pub fn latest(self) -> TableVersion {
        // Every kind lists at least one version.
        self.versions()
            .last()
            .copied()
            .unwrap_or(TableVersion::V1_0)
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Stamp => "stamp.bin",
            Self::Classes => "classes.bin",
            Self::Targets => "targets.bin",
            Self::Container => "container.bin",
            Self::ResolvedRefs => "resolved.bin",
            Self::UnresolvedRefs => "unresolved.bin",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StampTable {
    pub name: String,
    pub stamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassRecord {
    pub package: String,
    pub name: String,
    pub source: Option<String>,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub modifiers: u32,
}

impl ClassRecord {
    pub fn qualified_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassesTable {
    pub packages: Vec<String>,
    pub classes: Vec<ClassRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    Package,
    Class,
    Field,
    Method,
}

impl TargetKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Package => PACKAGE_ANNOTATION_BYTE,
            Self::Class => CLASS_ANNOTATION_BYTE,
            Self::Field => FIELD_ANNOTATION_BYTE,
            Self::Method => METHOD_ANNOTATION_BYTE,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            PACKAGE_ANNOTATION_BYTE => Some(Self::Package),
            CLASS_ANNOTATION_BYTE => Some(Self::Class),
            FIELD_ANNOTATION_BYTE => Some(Self::Field),
            METHOD_ANNOTATION_BYTE => Some(Self::Method),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationTarget {
    pub kind: TargetKind,
    pub annotation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassTargets {
    pub class_name: String,
    pub annotations: Vec<AnnotationTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetsTable {
    pub classes: Vec<ClassTargets>,
}

impl TargetsTable {
    /// Classes carrying `annotation` as a target of `kind`.
    pub fn classes_with(&self, kind: TargetKind, annotation: &str) -> Vec<&str> {
        self.classes
            .iter()
            .filter(|c| {
                c.annotations
                    .iter()
                    .any(|a| a.kind == kind && a.annotation == annotation)
            })
            .map(|c| c.class_name.as_str())
            .collect()
    }
}

/// How a container takes part in a module's scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanPolicy {
    Seed,
    Partial,
    Excluded,
    External,
}

impl ScanPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seed => "SEED",
            Self::Partial => "PARTIAL",
            Self::Excluded => "EXCLUDED",
            Self::External => "EXTERNAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SEED" => Some(Self::Seed),
            "PARTIAL" => Some(Self::Partial),
            "EXCLUDED" => Some(Self::Excluded),
            "EXTERNAL" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub name: String,
    pub policy: ScanPolicy,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerTable {
    pub entries: Vec<ContainerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferencesTable {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "table", content = "data")]
pub enum Table {
    Stamp(StampTable),
    Classes(ClassesTable),
    Targets(TargetsTable),
    Container(ContainerTable),
    ResolvedRefs(ReferencesTable),
    UnresolvedRefs(ReferencesTable),
}

impl Table {
    pub fn kind(&self) -> TableKind {
        match self {
            Self::Stamp(_) => TableKind::Stamp,
            Self::Classes(_) => TableKind::Classes,
            Self::Targets(_) => TableKind::Targets,
            Self::Container(_) => TableKind::Container,
            Self::ResolvedRefs(_) => TableKind::ResolvedRefs,
            Self::UnresolvedRefs(_) => TableKind::UnresolvedRefs,
        }
    }
}

/// The data tables of one container's file set.
///
/// `None` means the table is not part of the set, which is different from a
/// present table with zero records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CacheTables {
    pub classes: Option<ClassesTable>,
    pub targets: Option<TargetsTable>,
    pub containers: Option<ContainerTable>,
    pub resolved: Option<ReferencesTable>,
    pub unresolved: Option<ReferencesTable>,
}

impl CacheTables {
    pub fn kinds(&self) -> Vec<TableKind> {
        let mut kinds = Vec::new();
        if self.classes.is_some() {
            kinds.push(TableKind::Classes);
        }
        if self.targets.is_some() {
            kinds.push(TableKind::Targets);
        }
        if self.containers.is_some() {
            kinds.push(TableKind::Container);
        }
        if self.resolved.is_some() {
            kinds.push(TableKind::ResolvedRefs);
        }
        if self.unresolved.is_some() {
            kinds.push(TableKind::UnresolvedRefs);
        }
        kinds
    }
}

/// Deduplicating string table built during one write pass.
///
/// Indices are assigned in first-use order, which keeps the encoding
/// deterministic for a given table.
#[derive(Debug, Default)]
pub struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value`, interning it on first use. `None` once the pool is
    /// full.
    pub fn intern(&mut self, value: &str) -> Option<u32> {
        if let Some(&idx) = self.index.get(value) {
            return Some(idx);
        }
        let idx = u32::try_from(self.strings.len()).ok()?;
        self.strings.push(value.to_string());
        self.index.insert(value.to_string(), idx);
        Some(idx)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip_through_the_registry() {
        for kind in TableKind::ALL {
            assert_eq!(TableKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(TableKind::from_name("Annotation Targets"), Some(TableKind::Targets));
        assert_eq!(TableKind::from_name("annotation targets"), None);
    }

    #[test]
    fn only_the_container_table_has_a_second_version() {
        assert_eq!(TableKind::Container.latest(), TableVersion::V2_0);
        assert!(TableKind::Container.supports(TableVersion::V1_0));
        for kind in TableKind::ALL {
            if kind != TableKind::Container {
                assert_eq!(kind.versions(), &[TableVersion::V1_0]);
            }
        }
    }

    #[test]
    fn string_pool_dedupes_in_first_use_order() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern("com.acme"), Some(0));
        assert_eq!(pool.intern("Foo"), Some(1));
        assert_eq!(pool.intern("com.acme"), Some(0));
        assert_eq!(pool.strings(), &["com.acme".to_string(), "Foo".to_string()]);
    }

    #[test]
    fn empty_and_absent_tables_are_distinct() {
        let absent = CacheTables::default();
        let empty = CacheTables {
            classes: Some(ClassesTable::default()),
            ..CacheTables::default()
        };
        assert!(absent.kinds().is_empty());
        assert_eq!(empty.kinds(), vec![TableKind::Classes]);
        assert_ne!(absent, empty);
    }

    #[test]
    fn classes_with_filters_by_kind() {
        let table = TargetsTable {
            classes: vec![ClassTargets {
                class_name: "com.acme.Foo".to_string(),
                annotations: vec![AnnotationTarget {
                    kind: TargetKind::Method,
                    annotation: "jakarta.annotation.PostConstruct".to_string(),
                }],
            }],
        };
        assert_eq!(
            table.classes_with(TargetKind::Method, "jakarta.annotation.PostConstruct"),
            vec!["com.acme.Foo"]
        );
        assert!(
            table
                .classes_with(TargetKind::Class, "jakarta.annotation.PostConstruct")
                .is_empty()
        );
    }
}
