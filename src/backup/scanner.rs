use super::Filters;
use crate::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path below the job's source root
    pub relative: PathBuf,
    pub size: u64,
}

/// Compiled include/exclude lists.
///
/// A pattern matches when it matches the relative path or any single
/// component of it, so `node_modules` and `*.tmp` work at any depth.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl FileFilter {
    pub fn new(filters: &Filters, default_excludes: &[String]) -> Result<Self> {
        let include = if filters.include.is_empty() {
            None
        } else {
            Some(build_set(filters.include.iter())?)
        };
        let exclude = build_set(default_excludes.iter().chain(filters.exclude.iter()))?;
        Ok(Self { include, exclude })
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        matches_any(&self.exclude, relative)
    }

    pub fn is_included(&self, relative: &Path) -> bool {
        match &self.include {
            None => true,
            Some(set) => matches_any(set, relative),
        }
    }
}

fn build_set<'a>(patterns: impl Iterator<Item = &'a String>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::validation(format!("bad filter pattern {:?}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::validation(format!("bad filter set: {}", e)))
}

fn matches_any(set: &GlobSet, relative: &Path) -> bool {
    set.is_match(relative) || relative.components().any(|c| set.is_match(c.as_os_str()))
}

/// Walk `root` and list the regular files the filter lets through, sorted by
/// relative path. Unreadable entries are logged and skipped.
pub async fn scan_source(root: PathBuf, filter: FileFilter) -> Result<Vec<SourceFile>> {
    let meta = tokio::fs::metadata(&root)
        .await
        .map_err(|_| Error::validation(format!("source path does not exist: {}", root.display())))?;
    if !meta.is_dir() {
        return Err(Error::validation(format!(
            "source path is not a directory: {}",
            root.display()
        )));
    }

    info!("Scanning {}", root.display());
    let files = tokio::task::spawn_blocking(move || walk(&root, &filter))
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    debug!("Scan found {} files", files.len());
    Ok(files)
}

fn walk(root: &Path, filter: &FileFilter) -> Vec<SourceFile> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => true,
            Ok(rel) => !filter.is_excluded(rel),
            Err(_) => false,
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if !filter.is_included(relative) {
            continue;
        }
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        files.push(SourceFile {
            path: entry.path().to_path_buf(),
            relative: relative.to_path_buf(),
            size,
        });
    }

    files
}
