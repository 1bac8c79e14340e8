use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

use crate::container::{Container, ContainerKind, list_files};

const JAVA_SUFFIX: &str = ".java";

/// One Java compilation unit inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Path inside the container, `/`-separated.
    pub path: String,
    pub text: String,
}

impl SourceEntry {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

pub fn source_entries(container: &Container) -> Result<Vec<SourceEntry>> {
    match container.kind() {
        ContainerKind::Jar => jar_sources(container.path()),
        ContainerKind::Directory => directory_sources(container.path()),
    }
}

/// `.java` entries of a jar, in archive order. Entries that are not UTF-8
/// are skipped.
pub fn jar_sources(jar_path: &Path) -> Result<Vec<SourceEntry>> {
    let file = File::open(jar_path)
        .with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
    // SAFETY: The file is opened read-only and remains valid for the lifetime of the mmap.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))?;
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))?;

    let mut sources = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.is_file() || !entry.name().ends_with(JAVA_SUFFIX) {
            continue;
        }
        let path = entry.name().replace('\\', "/");
        let mut text = String::new();
        if let Err(err) = entry.read_to_string(&mut text) {
            tracing::debug!(
                target: "anno_cache",
                jar = %jar_path.display(),
                entry = %path,
                error = %err,
                "skipping unreadable source entry"
            );
            continue;
        }
        sources.push(SourceEntry { path, text });
    }
    Ok(sources)
}

pub fn directory_sources(root: &Path) -> Result<Vec<SourceEntry>> {
    let files = list_files(root)
        .with_context(|| format!("Failed to list directory: {}", root.display()))?;
    let mut sources = Vec::new();
    for (rel, path) in files {
        if !rel.ends_with(JAVA_SUFFIX) {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => sources.push(SourceEntry { path: rel, text }),
            Err(err) => tracing::debug!(
                target: "anno_cache",
                path = %path.display(),
                error = %err,
                "skipping unreadable source file"
            ),
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::StampKind;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::FileOptions;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "anno_cache_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }

        zip.finish()?;
        Ok(())
    }

    #[test]
    fn jar_sources_reads_java_entries_only() -> Result<()> {
        let jar = temp_path("sources_ok.jar");
        write_jar(
            &jar,
            &[
                ("org/example/A.java", b"class A {}"),
                ("org/example/A.class", b"\xCA\xFE\xBA\xBE"),
                ("org/example/Bad.java", b"\xFF\xFE"),
                ("META-INF/MANIFEST.MF", b""),
            ],
        )?;

        let sources = jar_sources(&jar)?;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].path, "org/example/A.java");
        assert_eq!(sources[0].file_name(), "A.java");
        assert_eq!(sources[0].text, "class A {}");

        let container = Container::open(&jar, StampKind::Metadata)?;
        assert_eq!(source_entries(&container)?, sources);

        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn jar_sources_handles_empty_jar() -> Result<()> {
        let jar = temp_path("sources_empty.jar");
        write_jar(&jar, &[])?;
        assert!(jar_sources(&jar)?.is_empty());
        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn directory_sources_walks_nested_packages() -> Result<()> {
        let dir = temp_path("sources_dir");
        std::fs::create_dir_all(dir.join("com/acme"))?;
        std::fs::write(dir.join("com/acme/B.java"), "class B {}")?;
        std::fs::write(dir.join("com/acme/A.java"), "class A {}")?;
        std::fs::write(dir.join("com/acme/notes.txt"), "x")?;

        let paths: Vec<String> = directory_sources(&dir)?.into_iter().map(|s| s.path).collect();
        assert_eq!(paths, vec!["com/acme/A.java", "com/acme/B.java"]);

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn unreadable_jar_is_an_error() {
        let jar = temp_path("missing.jar");
        assert!(jar_sources(&jar).is_err());
    }
}
