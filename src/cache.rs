//! Cache orchestrator.
//!
//! One directory per container key holds a stamp file plus one file per data
//! table. Reads check the stamp before anything else and degrade per table;
//! writes replace the whole set atomically under the key's write lock.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{self, Decoded, TableType};
use crate::config::CacheOptions;
use crate::consts::MAX_FILE_BYTES;
use crate::container::ContainerKey;
use crate::error::{CacheError, DecodeError, FormatError, ParseError, Result};
use crate::lock::KeyLocks;
use crate::model::{
    CacheTables, ClassesTable, ContainerTable, ReferencesTable, StampTable, TableKind,
    TargetsTable,
};
use crate::registry::{ContainerRegistry, RegistryRow};
use crate::stamp::{self, StampState, StampValidator, Stampable};
use crate::store::{self, Loaded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MissReason {
    /// Caching is turned off.
    Disabled,
    /// No stamp on disk: never written, or invalidated.
    Missing,
    /// The stamp file exists but cannot be trusted.
    Corrupt,
    /// The container changed since the set was written.
    Invalid,
}

/// Outcome of loading one data table.
#[derive(Debug)]
pub enum TableSlot<T> {
    Absent,
    Loaded(Decoded<T>),
    Failed(DecodeError),
}

impl<T> TableSlot<T> {
    pub fn table(&self) -> Option<&T> {
        match self {
            Self::Loaded(decoded) => Some(&decoded.table),
            _ => None,
        }
    }

    /// The table, only if every record decoded.
    pub fn clean_table(&self) -> Option<&T> {
        match self {
            Self::Loaded(decoded) if decoded.is_clean() => Some(&decoded.table),
            _ => None,
        }
    }

    pub fn errors(&self) -> &[ParseError] {
        match self {
            Self::Loaded(decoded) => &decoded.errors,
            _ => &[],
        }
    }

    pub fn failure(&self) -> Option<&DecodeError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

#[derive(Debug)]
pub struct CachedTables {
    pub stamp: StampTable,
    /// Header timestamp of the stamp file.
    pub written_at: u64,
    pub classes: TableSlot<ClassesTable>,
    pub targets: TableSlot<TargetsTable>,
    pub containers: TableSlot<ContainerTable>,
    pub resolved: TableSlot<ReferencesTable>,
    pub unresolved: TableSlot<ReferencesTable>,
}

impl CachedTables {
    /// Tables that decoded without any error. Everything else must be
    /// rebuilt by the caller.
    pub fn clean_tables(&self) -> CacheTables {
        CacheTables {
            classes: self.classes.clean_table().cloned(),
            targets: self.targets.clean_table().cloned(),
            containers: self.containers.clean_table().cloned(),
            resolved: self.resolved.clean_table().cloned(),
            unresolved: self.unresolved.clean_table().cloned(),
        }
    }

    /// Kinds that were present on disk but could not be used as-is.
    pub fn degraded(&self) -> Vec<TableKind> {
        let mut kinds = Vec::new();
        let mut check = |kind, failed: bool, errors: usize| {
            if failed || errors > 0 {
                kinds.push(kind);
            }
        };
        check(
            TableKind::Classes,
            self.classes.failure().is_some(),
            self.classes.errors().len(),
        );
        check(
            TableKind::Targets,
            self.targets.failure().is_some(),
            self.targets.errors().len(),
        );
        check(
            TableKind::Container,
            self.containers.failure().is_some(),
            self.containers.errors().len(),
        );
        check(
            TableKind::ResolvedRefs,
            self.resolved.failure().is_some(),
            self.resolved.errors().len(),
        );
        check(
            TableKind::UnresolvedRefs,
            self.unresolved.failure().is_some(),
            self.unresolved.errors().len(),
        );
        kinds
    }
}

#[derive(Debug)]
pub enum CacheReadResult {
    Miss(MissReason),
    Hit(CachedTables),
}

impl CacheReadResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn miss_reason(&self) -> Option<MissReason> {
        match self {
            Self::Miss(reason) => Some(*reason),
            Self::Hit(_) => None,
        }
    }

    pub fn into_hit(self) -> Option<CachedTables> {
        match self {
            Self::Hit(tables) => Some(tables),
            Self::Miss(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub resolved: Vec<String>,
    pub still_unresolved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: String,
    pub containers: u64,
    pub bytes: u64,
    pub registered: Option<u64>,
    pub disabled: bool,
    pub read_only: bool,
    pub always_valid: bool,
}

#[derive(Debug)]
pub struct AnnotationCache {
    options: CacheOptions,
    locks: KeyLocks,
    registry: Option<ContainerRegistry>,
}

impl AnnotationCache {
    pub fn open(options: CacheOptions) -> Result<Self> {
        if !options.disabled {
            std::fs::create_dir_all(&options.dir).map_err(|e| CacheError::io(&options.dir, e))?;
            let swept = store::sweep_stale(&options.dir)?;
            if swept > 0 {
                tracing::debug!(
                    target: "anno_cache",
                    dir = %options.dir.display(),
                    swept,
                    "removed stale staging directories"
                );
            }
        }
        Ok(Self {
            options,
            locks: KeyLocks::new(),
            registry: None,
        })
    }

    /// Keep `registry` in step with every write and invalidation.
    pub fn with_registry(mut self, registry: ContainerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    pub fn registry(&self) -> Option<&ContainerRegistry> {
        self.registry.as_ref()
    }

    pub fn set_dir(&self, key: &ContainerKey) -> PathBuf {
        self.options.dir.join(key.dir_name())
    }

    pub fn read(&self, key: &ContainerKey, live: &dyn Stampable) -> Result<CacheReadResult> {
        if self.options.disabled {
            return Ok(CacheReadResult::Miss(MissReason::Disabled));
        }

        let lock = self.locks.for_key(key.as_str());
        let _guard = lock.read().unwrap_or_else(PoisonError::into_inner);
        self.load(key, live)
    }

    /// [`read`](Self::read) without locking; the caller holds the key's lock.
    fn load(&self, key: &ContainerKey, live: &dyn Stampable) -> Result<CacheReadResult> {
        let dir = self.set_dir(key);

        let stamp = match read_slot::<StampTable>(&dir, TableKind::Stamp)? {
            TableSlot::Absent => return Ok(self.miss(key, MissReason::Missing)),
            TableSlot::Failed(err) => {
                tracing::debug!(
                    target: "anno_cache",
                    key = %key,
                    error = %err,
                    "stamp table unreadable"
                );
                return Ok(self.miss(key, MissReason::Corrupt));
            }
            TableSlot::Loaded(decoded) if !decoded.is_clean() => {
                tracing::debug!(
                    target: "anno_cache",
                    key = %key,
                    errors = decoded.errors.len(),
                    "stamp table has malformed records"
                );
                return Ok(self.miss(key, MissReason::Corrupt));
            }
            TableSlot::Loaded(decoded) => decoded,
        };

        let mut validator = if self.options.always_valid {
            StampValidator::always_valid()
        } else {
            StampValidator::new()
        };
        validator.validate(Some(&stamp.table), live);
        match validator.consume() {
            StampState::Valid => {}
            StampState::Missing => return Ok(self.miss(key, MissReason::Missing)),
            StampState::Invalid | StampState::NotChecked => {
                return Ok(self.miss(key, MissReason::Invalid));
            }
        }

        let tables = CachedTables {
            written_at: stamp.header.timestamp,
            stamp: stamp.table,
            classes: read_slot(&dir, TableKind::Classes)?,
            targets: read_slot(&dir, TableKind::Targets)?,
            containers: read_slot(&dir, TableKind::Container)?,
            resolved: read_slot(&dir, TableKind::ResolvedRefs)?,
            unresolved: read_slot(&dir, TableKind::UnresolvedRefs)?,
        };
        tracing::debug!(
            target: "anno_cache",
            key = %key,
            degraded = ?tables.degraded(),
            "cache hit"
        );
        Ok(CacheReadResult::Hit(tables))
    }

    /// Stamp `live` now and store `tables` under that stamp.
    pub fn write(&self, key: &ContainerKey, live: &dyn Stampable, tables: &CacheTables) -> Result<()> {
        if self.writes_disabled(key) {
            return Ok(());
        }
        let stamp = stamp::current_stamp(live).map_err(|source| CacheError::Stamp {
            name: live.name(),
            source,
        })?;
        self.write_with_stamp(key, &stamp, tables)
    }

    /// Store `tables` under a stamp taken earlier, typically before the scan
    /// that produced them, so changes made during the scan invalidate it.
    pub fn write_with_stamp(
        &self,
        key: &ContainerKey,
        stamp: &StampTable,
        tables: &CacheTables,
    ) -> Result<()> {
        if self.writes_disabled(key) {
            return Ok(());
        }

        let timestamp = now_millis();
        let files = encode_set(stamp, tables, timestamp)?;
        {
            let lock = self.locks.for_key(key.as_str());
            let _guard = lock.write().unwrap_or_else(PoisonError::into_inner);
            store::write_file_set(&self.options.dir, &key.dir_name(), &files)?;
        }
        tracing::debug!(
            target: "anno_cache",
            key = %key,
            files = files.len(),
            "cache entry written"
        );
        self.record(key, timestamp, tables);
        Ok(())
    }

    /// Drop the file set of `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &ContainerKey) -> Result<bool> {
        if self.options.disabled {
            return Ok(false);
        }
        let removed = {
            let lock = self.locks.for_key(key.as_str());
            let _guard = lock.write().unwrap_or_else(PoisonError::into_inner);
            store::remove_file_set(&self.options.dir, &key.dir_name())?
        };
        if let Some(registry) = &self.registry
            && let Err(err) = registry.remove(key)
        {
            tracing::warn!(
                target: "anno_cache",
                key = %key,
                error = %err,
                "failed to remove registry row"
            );
        }
        tracing::debug!(target: "anno_cache", key = %key, removed, "cache entry invalidated");
        Ok(removed)
    }

    /// Drop every file set. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        if self.options.disabled {
            return Ok(0);
        }
        let mut removed = 0usize;
        for (dir_name, _) in store::list_sets(&self.options.dir)? {
            if store::remove_file_set(&self.options.dir, &dir_name)? {
                removed += 1;
            }
        }
        store::sweep_stale(&self.options.dir)?;
        if let Some(registry) = &self.registry
            && let Err(err) = registry.clear()
        {
            tracing::warn!(
                target: "anno_cache",
                error = %err,
                "failed to clear container registry"
            );
        }
        tracing::info!(target: "anno_cache", removed, "cache cleared");
        Ok(removed)
    }

    /// Move unresolved names that `resolve` now accepts into the resolved
    /// table and rewrite the set under its stored stamp.
    ///
    /// Returns `None` when there is no usable unresolved table to retry.
    pub fn retry_unresolved(
        &self,
        key: &ContainerKey,
        live: &dyn Stampable,
        resolve: impl Fn(&str) -> bool,
    ) -> Result<Option<RetryOutcome>> {
        if self.options.disabled {
            return Ok(None);
        }
        let timestamp = now_millis();
        let lock = self.locks.for_key(key.as_str());
        // Held from the read through the rewrite so concurrent retries and
        // writes of this key never interleave.
        let guard = lock.write().unwrap_or_else(PoisonError::into_inner);

        let Some(cached) = self.load(key, live)?.into_hit() else {
            return Ok(None);
        };
        let Some(unresolved) = cached.unresolved.clean_table() else {
            return Ok(None);
        };

        let (now_resolved, still): (Vec<String>, Vec<String>) = unresolved
            .names
            .iter()
            .cloned()
            .partition(|name| resolve(name));
        let outcome = RetryOutcome {
            still_unresolved: still.len(),
            resolved: now_resolved.clone(),
        };
        if now_resolved.is_empty() || self.writes_disabled(key) {
            return Ok(Some(outcome));
        }

        let mut tables = cached.clean_tables();
        let mut resolved = tables.resolved.take().unwrap_or_default();
        for name in now_resolved {
            if !resolved.names.contains(&name) {
                resolved.names.push(name);
            }
        }
        tables.resolved = Some(resolved);
        tables.unresolved = Some(ReferencesTable { names: still });

        let files = encode_set(&cached.stamp, &tables, timestamp)?;
        store::write_file_set(&self.options.dir, &key.dir_name(), &files)?;
        drop(guard);

        self.record(key, timestamp, &tables);
        tracing::debug!(
            target: "anno_cache",
            key = %key,
            resolved = outcome.resolved.len(),
            remaining = outcome.still_unresolved,
            "retried unresolved references"
        );
        Ok(Some(outcome))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let sets = store::list_sets(&self.options.dir)?;
        let registered = match &self.registry {
            Some(registry) => match registry.len() {
                Ok(n) => Some(n),
                Err(err) => {
                    tracing::warn!(target: "anno_cache", error = %err, "failed to count registry rows");
                    None
                }
            },
            None => None,
        };
        Ok(CacheStats {
            cache_dir: self.options.dir.to_string_lossy().to_string(),
            containers: sets.len() as u64,
            bytes: sets.iter().map(|(_, bytes)| bytes).sum(),
            registered,
            disabled: self.options.disabled,
            read_only: self.options.read_only,
            always_valid: self.options.always_valid,
        })
    }

    fn writes_disabled(&self, key: &ContainerKey) -> bool {
        if self.options.disabled || self.options.read_only {
            tracing::trace!(target: "anno_cache", key = %key, "write skipped");
            return true;
        }
        false
    }

    fn record(&self, key: &ContainerKey, timestamp: u64, tables: &CacheTables) {
        if let Some(registry) = &self.registry
            && let Err(err) = registry.record(key, &RegistryRow::new(key, timestamp, &tables.kinds()))
        {
            tracing::warn!(
                target: "anno_cache",
                key = %key,
                error = %err,
                "failed to update container registry"
            );
        }
    }

    fn miss(&self, key: &ContainerKey, reason: MissReason) -> CacheReadResult {
        tracing::debug!(target: "anno_cache", key = %key, reason = ?reason, "cache miss");
        CacheReadResult::Miss(reason)
    }
}

fn read_slot<T: TableType>(dir: &Path, kind: TableKind) -> Result<TableSlot<T>> {
    let path = dir.join(kind.file_name());
    let bytes = match store::read_file(&path)? {
        Loaded::Missing => return Ok(TableSlot::Absent),
        Loaded::Oversize { len } => {
            tracing::debug!(target: "anno_cache", path = %path.display(), len, "table file too large");
            return Ok(TableSlot::Failed(DecodeError::Corrupt(FormatError::TooLarge {
                limit: MAX_FILE_BYTES,
            })));
        }
        Loaded::Bytes(bytes) => bytes,
    };
    match codec::decode::<T>(kind, &bytes) {
        Ok(decoded) => {
            if !decoded.is_clean() {
                tracing::debug!(
                    target: "anno_cache",
                    table = %kind,
                    skipped = decoded.errors.len(),
                    "skipped malformed records"
                );
            }
            Ok(TableSlot::Loaded(decoded))
        }
        Err(err) => {
            tracing::debug!(target: "anno_cache", table = %kind, error = %err, "table rejected");
            Ok(TableSlot::Failed(err))
        }
    }
}

/// Data tables first, the stamp last, so a set is never published with a
/// stamp but no data.
fn encode_set(
    stamp: &StampTable,
    tables: &CacheTables,
    timestamp: u64,
) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let mut files = Vec::with_capacity(TableKind::ALL.len());
    if let Some(t) = &tables.classes {
        files.push(encode_file(TableKind::Classes, t, timestamp)?);
    }
    if let Some(t) = &tables.targets {
        files.push(encode_file(TableKind::Targets, t, timestamp)?);
    }
    if let Some(t) = &tables.containers {
        files.push(encode_file(TableKind::Container, t, timestamp)?);
    }
    if let Some(t) = &tables.resolved {
        files.push(encode_file(TableKind::ResolvedRefs, t, timestamp)?);
    }
    if let Some(t) = &tables.unresolved {
        files.push(encode_file(TableKind::UnresolvedRefs, t, timestamp)?);
    }
    files.push(encode_file(TableKind::Stamp, stamp, timestamp)?);
    Ok(files)
}

fn encode_file<T: TableType>(
    kind: TableKind,
    table: &T,
    timestamp: u64,
) -> Result<(&'static str, Vec<u8>)> {
    let bytes = codec::encode_latest(kind, table, timestamp)
        .map_err(|source| CacheError::Encode { table: kind, source })?;
    Ok((kind.file_name(), bytes))
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
