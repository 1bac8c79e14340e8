//! Container discovery and the source-level scan driver.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::cache::{AnnotationCache, CacheReadResult};
use crate::catalog::{self, SourceEntry};
use crate::container::Container;
use crate::model::{
    CacheTables, ClassesTable, ContainerEntry, ContainerTable, ReferencesTable, ScanPolicy,
    StampTable, TargetsTable,
};
use crate::queue::{WriteJob, WriteQueue};
use crate::stamp::{self, StampKind, Stampable};
use crate::structure::{self, SourceScan};

const ARCHIVE_EXTENSIONS: &[&str] = &["jar", "war", "ear", "rar"];

/// Archives anywhere under `root`, plus top-level directories holding Java
/// sources. Sorted.
pub fn discover_containers(root: &Path) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let (tx, rx) = mpsc::channel();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if entry.file_type().is_some_and(|t| t.is_file()) && is_archive(path) {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });
    drop(tx);
    let mut containers: Vec<PathBuf> = rx.iter().collect();

    let entries = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read scan root: {}", root.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && has_java_sources(&path) {
            containers.push(path);
        }
    }

    containers.sort();
    containers.dedup();
    Ok(containers)
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ARCHIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn has_java_sources(dir: &Path) -> bool {
    WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(false)
        .build()
        .flatten()
        .any(|e| {
            e.file_type().is_some_and(|t| t.is_file())
                && e.path().extension().is_some_and(|x| x == "java")
        })
}

/// Produce the tables for one container. `stamp` is the container's stamp,
/// recorded as its signature.
pub fn scan_container(container: &Container, stamp: &StampTable) -> Result<CacheTables> {
    let sources = catalog::source_entries(container)?;
    Ok(build_tables(container, stamp, &sources))
}

fn build_tables(container: &Container, stamp: &StampTable, sources: &[SourceEntry]) -> CacheTables {
    let scans: Vec<SourceScan> = sources
        .par_iter()
        .filter_map(|entry| structure::scan_source(&entry.text, entry.file_name()))
        .collect();

    let mut classes = ClassesTable::default();
    let mut targets = TargetsTable::default();
    let mut raw_references: Vec<String> = Vec::new();
    for scan in scans {
        if !scan.package.is_empty() && !classes.packages.contains(&scan.package) {
            classes.packages.push(scan.package);
        }
        classes.classes.extend(scan.classes);
        targets.classes.extend(scan.targets);
        raw_references.extend(scan.references);
    }

    // Another unit may name a nested type in source form (`Outer.Inner`).
    let binary_names: HashMap<String, String> = classes
        .classes
        .iter()
        .map(|c| c.qualified_name())
        .filter(|q| q.contains('$'))
        .map(|q| (q.replace('$', "."), q))
        .collect();
    let to_binary = |name: &mut String| {
        if let Some(binary) = binary_names.get(name.as_str()) {
            *name = binary.clone();
        }
    };
    for class in &mut classes.classes {
        if let Some(superclass) = class.superclass.as_mut() {
            to_binary(superclass);
        }
        class.interfaces.iter_mut().for_each(to_binary);
    }
    for class in &mut targets.classes {
        for target in &mut class.annotations {
            to_binary(&mut target.annotation);
        }
    }
    let mut references: Vec<String> = Vec::new();
    let mut seen_refs = HashSet::new();
    for mut name in raw_references {
        to_binary(&mut name);
        if seen_refs.insert(name.clone()) {
            references.push(name);
        }
    }

    let declared: HashSet<String> = classes.classes.iter().map(|c| c.qualified_name()).collect();
    let (mut resolved, mut unresolved): (Vec<String>, Vec<String>) =
        references.into_iter().partition(|name| declared.contains(name));
    resolved.sort();
    unresolved.sort();

    let name = container
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| container.path().to_string_lossy().to_string());

    CacheTables {
        classes: Some(classes),
        targets: Some(targets),
        containers: Some(ContainerTable {
            entries: vec![ContainerEntry {
                name,
                policy: ScanPolicy::Seed,
                signature: Some(stamp.stamp.clone()),
            }],
        }),
        resolved: Some(ReferencesTable { names: resolved }),
        unresolved: Some(ReferencesTable { names: unresolved }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    pub key: String,
    pub path: String,
    /// `hit`, `error`, or the reason the container was rescanned.
    pub outcome: String,
    pub classes: usize,
    pub annotated_classes: usize,
    pub unresolved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerReport {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Serve each container from the cache, rescanning and queueing a write for
/// anything that misses or comes back degraded. Containers are handled in
/// parallel; reports keep the order of `paths`.
///
/// A container that cannot be stamped or read gets an `error` report and
/// does not stop the others.
pub fn scan_containers(
    cache: &AnnotationCache,
    queue: &WriteQueue,
    paths: &[PathBuf],
    stamp_kind: StampKind,
) -> Vec<ContainerReport> {
    paths
        .par_iter()
        .map(|path| scan_one(cache, queue, path, stamp_kind))
        .collect()
}

fn scan_one(
    cache: &AnnotationCache,
    queue: &WriteQueue,
    path: &Path,
    stamp_kind: StampKind,
) -> ContainerReport {
    let container = match Container::open(path, stamp_kind) {
        Ok(container) => container,
        Err(err) => return failed(&path.to_string_lossy(), path, "failed to open container", &err),
    };
    let key = container.key();

    let outcome = match cache.read(&key, &container) {
        Ok(CacheReadResult::Hit(hit)) => {
            let degraded = hit.degraded();
            let tables = hit.clean_tables();
            if degraded.is_empty() && tables.classes.is_some() && tables.targets.is_some() {
                return report(key.as_str(), path, "hit".to_string(), &tables);
            }
            "degraded".to_string()
        }
        Ok(CacheReadResult::Miss(reason)) => format!("miss:{reason:?}").to_ascii_lowercase(),
        Err(err) => {
            tracing::warn!(
                target: "anno_cache",
                key = %key,
                error = %err,
                "cache read failed; scanning without the cache"
            );
            "miss:io".to_string()
        }
    };

    // Stamp before reading sources so edits made mid-scan invalidate the
    // entry on the next run.
    let stamp = match stamp::current_stamp(&container) {
        Ok(stamp) => stamp,
        Err(err) => return failed(key.as_str(), path, "failed to stamp container", &err),
    };
    let tables = match scan_container(&container, &stamp) {
        Ok(tables) => tables,
        Err(err) => return failed(key.as_str(), path, "failed to scan container", &err),
    };
    tracing::debug!(
        target: "anno_cache",
        key = %key,
        outcome = %outcome,
        classes = tables.classes.as_ref().map_or(0, |c| c.classes.len()),
        "container scanned"
    );
    let report = report(key.as_str(), path, outcome, &tables);
    queue.enqueue(WriteJob { key, stamp, tables });
    report
}

fn report(key: &str, path: &Path, outcome: String, tables: &CacheTables) -> ContainerReport {
    ContainerReport {
        key: key.to_string(),
        path: path.to_string_lossy().to_string(),
        outcome,
        classes: tables.classes.as_ref().map_or(0, |c| c.classes.len()),
        annotated_classes: tables.targets.as_ref().map_or(0, |t| t.classes.len()),
        unresolved: tables.unresolved.as_ref().map_or(0, |u| u.names.len()),
        error: None,
    }
}

fn failed(key: &str, path: &Path, what: &str, err: &dyn std::fmt::Display) -> ContainerReport {
    tracing::warn!(
        target: "anno_cache",
        container = %path.display(),
        error = %err,
        "{what}; skipping"
    );
    ContainerReport {
        key: key.to_string(),
        path: path.to_string_lossy().to_string(),
        outcome: "error".to_string(),
        classes: 0,
        annotated_classes: 0,
        unresolved: 0,
        error: Some(format!("{what}: {err:#}")),
    }
}
