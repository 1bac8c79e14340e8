//! Advisory index of cached containers.
//!
//! LMDB (via heed) maps a container key to a small JSON row describing its
//! file set. The file sets on disk stay authoritative; a stale or missing row
//! never changes what a read returns.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::container::ContainerKey;
use crate::model::TableKind;

pub const CONTAINERS_DB: &str = "containers";

const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRow {
    pub dir_name: String,
    pub last_write_millis: u64,
    pub tables: Vec<String>,
}

impl RegistryRow {
    pub fn new(key: &ContainerKey, last_write_millis: u64, tables: &[TableKind]) -> Self {
        Self {
            dir_name: key.dir_name(),
            last_write_millis,
            tables: tables.iter().map(|t| t.name().to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub key: String,
    #[serde(flatten)]
    pub row: RegistryRow,
}

#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    env: Arc<Env>,
    db_path: PathBuf,
    containers: StrDb,
}

impl ContainerRegistry {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }

        let env = Arc::new(open_env(db_path)?);
        let mut wtxn = env.write_txn()?;
        let containers = env.create_database::<Str, Str>(&mut wtxn, Some(CONTAINERS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path: db_path.to_path_buf(),
            containers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn record(&self, key: &ContainerKey, row: &RegistryRow) -> Result<()> {
        let json = serde_json::to_string(row)?;
        let mut wtxn = self.env.write_txn()?;
        self.containers.put(&mut wtxn, key.as_str(), json.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &ContainerKey) -> Result<Option<RegistryRow>> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.containers.get(&rtxn, key.as_str())? else {
            return Ok(None);
        };
        let row = serde_json::from_str(raw)
            .with_context(|| format!("Failed to parse registry row for: {key}"))?;
        Ok(Some(row))
    }

    pub fn remove(&self, key: &ContainerKey) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.containers.delete(&mut wtxn, key.as_str())?;
        wtxn.commit()?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.containers.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    /// All rows in key order. Rows that fail to parse are skipped.
    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.containers.iter(&rtxn)? {
            let (key, raw) = item?;
            match serde_json::from_str::<RegistryRow>(raw) {
                Ok(row) => out.push(RegistryEntry {
                    key: key.to_string(),
                    row,
                }),
                Err(err) => tracing::debug!(
                    target: "anno_cache",
                    key,
                    error = %err,
                    "skipping unreadable registry row"
                ),
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.containers.len(&rtxn)?)
    }
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: default LMDB locking stays on; NO_SUB_DIR keeps the index as a
    // single file next to the file sets.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open registry: {}", db_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "anno_cache_test_{}_{}_{}.lmdb",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn cleanup(db_path: &Path) {
        let _ = std::fs::remove_file(db_path);
        let mut lock = db_path.as_os_str().to_owned();
        lock.push("-lock");
        let _ = std::fs::remove_file(PathBuf::from(lock));
    }

    #[test]
    fn rows_are_recorded_replaced_and_removed() -> Result<()> {
        let db_path = temp_db_path("registry_rows");
        let registry = ContainerRegistry::open(&db_path)?;

        let a = ContainerKey::new("app/lib/a.jar");
        let b = ContainerKey::new("app/lib/b.jar");
        registry.record(&a, &RegistryRow::new(&a, 10, &[TableKind::Classes]))?;
        registry.record(&b, &RegistryRow::new(&b, 20, &[]))?;
        registry.record(
            &a,
            &RegistryRow::new(&a, 30, &[TableKind::Classes, TableKind::Targets]),
        )?;

        let row = registry.get(&a)?.unwrap();
        assert_eq!(row.last_write_millis, 30);
        assert_eq!(row.tables, vec!["Classes", "Annotation Targets"]);
        assert_eq!(row.dir_name, a.dir_name());
        assert_eq!(registry.len()?, 2);

        let keys: Vec<String> = registry.entries()?.into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["app/lib/a.jar", "app/lib/b.jar"]);

        assert!(registry.remove(&a)?);
        assert!(!registry.remove(&a)?);
        assert!(registry.get(&a)?.is_none());

        registry.clear()?;
        assert_eq!(registry.len()?, 0);

        drop(registry);
        cleanup(&db_path);
        Ok(())
    }
}
