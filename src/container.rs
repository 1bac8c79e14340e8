//! Scannable containers and the keys that name their cache entries.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::stamp::{StampKind, Stampable, file_metadata, hash_reader};

const DIR_NAME_PREFIX_MAX: usize = 48;

/// Logical identity of one scan unit, e.g. `app/module/WEB-INF/lib/x.jar`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContainerKey(String);

impl ContainerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_segments(segments: &[&str]) -> Self {
        Self(segments.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory that owns this key's file set.
    ///
    /// A readable prefix for humans plus a hash of the full key, so two keys
    /// that sanitise to the same prefix still get distinct directories.
    pub fn dir_name(&self) -> String {
        let mut prefix: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(DIR_NAME_PREFIX_MAX)
            .collect();
        if prefix.is_empty() {
            prefix.push('_');
        }

        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{prefix}-{}", &digest[..16])
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    Jar,
    Directory,
}

#[derive(Debug, Clone)]
pub struct Container {
    path: PathBuf,
    kind: ContainerKind,
    stamp_kind: StampKind,
}

impl Container {
    pub fn open(path: &Path, stamp_kind: StampKind) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat container: {}", path.display()))?;
        let kind = if meta.is_dir() {
            ContainerKind::Directory
        } else {
            ContainerKind::Jar
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            stamp_kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn key(&self) -> ContainerKey {
        ContainerKey::new(self.path.to_string_lossy())
    }

    fn jar_stamp(&self) -> io::Result<String> {
        match self.stamp_kind {
            StampKind::Metadata => {
                let (len, nanos) = file_metadata(&self.path)?;
                Ok(format!("m:{len}:{nanos}"))
            }
            StampKind::Content => {
                let file = std::fs::File::open(&self.path)?;
                Ok(format!("c:{}", hash_reader(file)?))
            }
        }
    }

    fn directory_stamp(&self) -> io::Result<String> {
        let files = list_files(&self.path)?;
        let mut hasher = Sha256::new();
        for (rel, path) in &files {
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            match self.stamp_kind {
                StampKind::Metadata => {
                    let (len, nanos) = file_metadata(path)?;
                    hasher.update(len.to_be_bytes());
                    hasher.update(nanos.to_be_bytes());
                }
                StampKind::Content => {
                    let file = std::fs::File::open(path)?;
                    hasher.update(hash_reader(file)?.as_bytes());
                }
            }
        }
        let tag = match self.stamp_kind {
            StampKind::Metadata => "m",
            StampKind::Content => "c",
        };
        Ok(format!("{tag}:{}:{}", files.len(), hex::encode(hasher.finalize())))
    }
}

impl Stampable for Container {
    fn name(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn stamp(&self) -> io::Result<String> {
        match self.kind {
            ContainerKind::Jar => self.jar_stamp(),
            ContainerKind::Directory => self.directory_stamp(),
        }
    }
}

/// Regular files under `root`, as `(relative path, path)` sorted by relative
/// path.
pub fn list_files(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| io::Error::other(err.to_string()))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.into_path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        files.push((rel, path));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
