use anyhow::{Context, Result};
use anno_cache::cache::{AnnotationCache, CacheReadResult, TableSlot};
use anno_cache::cli::{Cli, Commands, OutputFormat};
use anno_cache::codec::decode_any;
use anno_cache::config::{CacheOptions, init_logging, resolve_options};
use anno_cache::container::{Container, ContainerKey};
use anno_cache::queue::{QueueStats, WriteQueue};
use anno_cache::registry::ContainerRegistry;
use anno_cache::scan::{ContainerReport, discover_containers, scan_containers};
use anno_cache::stamp::StampKind;
use clap::Parser;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<()> {
    init_logging();
    let cli = parse_cli()?;
    let options = resolve_options(&cli)?;

    match cli.command.clone() {
        Commands::Scan {
            path,
            format,
            content_stamp,
        } => {
            let cache = Arc::new(open_cache(options)?);
            let result = scan(&cache, &path, stamp_kind(content_stamp))?;
            write_scan_output(&result, format)?;
        }
        Commands::Show {
            container,
            content_stamp,
        } => {
            let cache = open_cache(options)?;
            let output = show(&cache, &container, stamp_kind(content_stamp))?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Dump { file } => {
            let output = dump(&file)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Retry {
            container,
            resolved,
            content_stamp,
        } => {
            let cache = open_cache(options)?;
            let path = canonical(&container);
            let live = Container::open(&path, stamp_kind(content_stamp))?;
            let outcome =
                cache.retry_unresolved(&live.key(), &live, |name| resolved.iter().any(|r| r == name))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "container": path.to_string_lossy(),
                    "retried": outcome.is_some(),
                    "outcome": outcome,
                }))?
            );
        }
        Commands::Invalidate { container } => {
            let cache = open_cache(options)?;
            let key = ContainerKey::new(canonical(&container).to_string_lossy());
            let removed = cache.invalidate(&key)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "key": key, "removed": removed }))?
            );
        }
        Commands::List => {
            let cache = open_cache(options)?;
            let entries = match cache.registry() {
                Some(registry) => registry.entries()?,
                None => Vec::new(),
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Stats => {
            let cache = open_cache(options)?;
            let stats = cache.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Clear => {
            let cache = open_cache(options)?;
            let removed = cache.clear()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "removed": removed }))?
            );
        }
    }

    Ok(())
}

fn parse_cli() -> Result<Cli> {
    let args: Vec<String> = std::env::args().collect();
    Ok(Cli::parse_from(rewrite_args_for_implicit_scan(args)))
}

/// `anno-cache <path>` is shorthand for `anno-cache scan <path>`.
fn rewrite_args_for_implicit_scan(mut args: Vec<String>) -> Vec<String> {
    if args.len() <= 1 {
        return args;
    }

    let subcommands = [
        "scan",
        "show",
        "dump",
        "retry",
        "invalidate",
        "list",
        "stats",
        "clear",
        "help",
    ];

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }

        if a == "--cache-dir" || a == "--write-threads" {
            idx += 2;
            continue;
        }

        if a.starts_with('-') {
            idx += 1;
            continue;
        }

        break;
    }

    if idx < args.len() {
        let token = args[idx].as_str();
        if !subcommands.contains(&token) {
            args.insert(idx, "scan".to_string());
        }
    }

    args
}

fn open_cache(options: CacheOptions) -> Result<AnnotationCache> {
    let registry_path = options.registry_path();
    let disabled = options.disabled;
    let cache = AnnotationCache::open(options).context("Failed to open cache")?;
    if disabled {
        return Ok(cache);
    }
    match ContainerRegistry::open(&registry_path) {
        Ok(registry) => Ok(cache.with_registry(registry)),
        Err(err) => {
            tracing::warn!(
                target: "anno_cache",
                path = %registry_path.display(),
                error = %err,
                "container registry unavailable"
            );
            Ok(cache)
        }
    }
}

fn stamp_kind(content: bool) -> StampKind {
    if content {
        StampKind::Content
    } else {
        StampKind::Metadata
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Serialize)]
struct ScanResult {
    root: String,
    duration_ms: u64,
    hits: usize,
    scanned: usize,
    errors: usize,
    writes: QueueStats,
    containers: Vec<ContainerReport>,
}

fn scan(cache: &Arc<AnnotationCache>, root: &Path, stamp_kind: StampKind) -> Result<ScanResult> {
    let start = Instant::now();
    let root = canonical(root);
    let paths = discover_containers(&root)?;

    let mut queue = WriteQueue::new(Arc::clone(cache), cache.options().write_threads);
    let containers = scan_containers(cache, &queue, &paths, stamp_kind);
    let writes = queue.shutdown_and_flush();

    let hits = containers.iter().filter(|c| c.outcome == "hit").count();
    let errors = containers.iter().filter(|c| c.is_error()).count();
    Ok(ScanResult {
        root: root.to_string_lossy().to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        hits,
        scanned: containers.len() - hits - errors,
        errors,
        writes,
        containers,
    })
}

fn write_scan_output(result: &ScanResult, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(result)?,
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("root: {}\n", result.root));
            out.push_str(&format!(
                "containers: {} (hits: {}, scanned: {}, errors: {})\n",
                result.containers.len(),
                result.hits,
                result.scanned,
                result.errors
            ));
            out.push_str(&format!("duration_ms: {}\n", result.duration_ms));
            for c in &result.containers {
                if let Some(err) = &c.error {
                    out.push_str(&format!("- {}: error: {err}\n", c.key));
                    continue;
                }
                out.push_str(&format!(
                    "- {}: {}, classes: {}, annotated: {}, unresolved: {}\n",
                    c.key, c.outcome, c.classes, c.annotated_classes, c.unresolved
                ));
            }
            out
        }
    };
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn show(cache: &AnnotationCache, container: &Path, stamp_kind: StampKind) -> Result<Value> {
    let path = canonical(container);
    let live = Container::open(&path, stamp_kind)?;
    let key = live.key();
    let output = match cache.read(&key, &live)? {
        CacheReadResult::Miss(reason) => json!({
            "key": key,
            "hit": false,
            "reason": reason,
        }),
        CacheReadResult::Hit(hit) => json!({
            "key": key,
            "hit": true,
            "dir": cache.set_dir(&key).to_string_lossy(),
            "written_at": hit.written_at,
            "stamp": hit.stamp,
            "degraded": hit.degraded(),
            "tables": {
                "classes": slot_json(&hit.classes)?,
                "targets": slot_json(&hit.targets)?,
                "containers": slot_json(&hit.containers)?,
                "resolved": slot_json(&hit.resolved)?,
                "unresolved": slot_json(&hit.unresolved)?,
            },
        }),
    };
    Ok(output)
}

fn slot_json<T: Serialize>(slot: &TableSlot<T>) -> Result<Value> {
    Ok(match slot {
        TableSlot::Absent => json!({ "status": "absent" }),
        TableSlot::Failed(err) => json!({
            "status": "failed",
            "error": err.to_string(),
        }),
        TableSlot::Loaded(decoded) => json!({
            "status": "loaded",
            "version": decoded.version,
            "timestamp": decoded.header.timestamp,
            "errors": decoded.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            "data": serde_json::to_value(&decoded.table)?,
        }),
    })
}

fn dump(file: &Path) -> Result<Value> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read table file: {}", file.display()))?;
    let decoded = decode_any(&bytes)
        .with_context(|| format!("Failed to decode table file: {}", file.display()))?;
    Ok(json!({
        "file": file.to_string_lossy(),
        "header": decoded.header,
        "errors": decoded.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        "table": decoded.table,
    }))
}
