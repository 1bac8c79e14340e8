use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::cli::Cli;

pub const CACHE_DIR_ENV: &str = "ANNO_CACHE_DIR";
pub const DISABLED_ENV: &str = "ANNO_CACHE_DISABLED";
pub const READ_ONLY_ENV: &str = "ANNO_CACHE_READ_ONLY";
pub const ALWAYS_VALID_ENV: &str = "ANNO_CACHE_ALWAYS_VALID";
pub const WRITE_THREADS_ENV: &str = "ANNO_CACHE_WRITE_THREADS";
pub const LOG_ENV: &str = "ANNO_CACHE_LOG";

const REGISTRY_FILE: &str = "index.lmdb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub dir: PathBuf,
    /// Reads always miss and writes are dropped.
    pub disabled: bool,
    /// Reads work, writes are dropped.
    pub read_only: bool,
    /// Skip the stamp comparison; only the container name must match.
    pub always_valid: bool,
    /// Background writer threads; 0 writes inline.
    pub write_threads: usize,
}

impl CacheOptions {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            disabled: false,
            read_only: false,
            always_valid: false,
            write_threads: 0,
        }
    }

    /// Options for `dir`, with flags taken from the environment.
    pub fn from_env(dir: PathBuf) -> Result<Self> {
        Ok(Self {
            dir,
            disabled: env_flag(DISABLED_ENV)?,
            read_only: env_flag(READ_ONLY_ENV)?,
            always_valid: env_flag(ALWAYS_VALID_ENV)?,
            write_threads: env_usize(WRITE_THREADS_ENV)?.unwrap_or(0),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        registry_path(&self.dir)
    }
}

pub fn resolve_cache_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.cache_dir.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(CACHE_DIR_ENV)
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    Ok(anno_cache_home()?.join("targets"))
}

pub fn resolve_options(cli: &Cli) -> Result<CacheOptions> {
    let mut options = CacheOptions::from_env(resolve_cache_dir(cli)?)?;
    if cli.read_only {
        options.read_only = true;
    }
    if cli.always_valid {
        options.always_valid = true;
    }
    if let Some(n) = cli.write_threads {
        options.write_threads = n;
    }
    Ok(options)
}

pub fn registry_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(REGISTRY_FILE)
}

/// Install the stderr log subscriber. Directives come from `ANNO_CACHE_LOG`,
/// then `RUST_LOG`; the default is `warn`.
pub fn init_logging() {
    let directives = env::var(LOG_ENV)
        .ok()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| env::var("RUST_LOG").ok().filter(|d| !d.trim().is_empty()));
    let filter = directives
        .and_then(|d| tracing_subscriber::EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
        });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn anno_cache_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("anno-cache"))
}

fn env_flag(name: &str) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => parse_flag(&raw).with_context(|| format!("Invalid value for {name}: {raw:?}")),
        Err(env::VarError::NotPresent) => Ok(false),
        Err(err) => Err(err).with_context(|| format!("Failed to read {name}")),
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .with_context(|| format!("Invalid value for {name}: {raw:?}")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {name}")),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        _ => anyhow::bail!("expected a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(parse_flag(" yes ").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(!parse_flag("").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn registry_lives_inside_the_cache_dir() {
        let options = CacheOptions::new(PathBuf::from("/tmp/anno"));
        assert_eq!(options.registry_path(), PathBuf::from("/tmp/anno/index.lmdb"));
        assert!(!options.disabled && !options.read_only && !options.always_valid);
    }
}
