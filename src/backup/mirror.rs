use crate::error::{Error, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 256 * 1024;
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Destination already matched the source.
    Unchanged,
    Copied,
    /// Copied after moving the previous version aside.
    Revised { previous: PathBuf },
}

/// Byte-level transfer of one file.
///
/// `on_progress` receives byte deltas as data lands. An implementation must
/// never leave a half-written file at `dest`.
#[async_trait]
pub trait MirrorPrimitive: Send + Sync {
    async fn mirror_file(
        &self,
        source: &Path,
        dest: &Path,
        keep_revision: bool,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<MirrorOutcome>;
}

/// Mirrors onto any mounted filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsMirror;

impl FsMirror {
    pub fn new() -> Self {
        Self
    }

    async fn is_unchanged(source_meta: &std::fs::Metadata, dest: &Path) -> bool {
        let Ok(dest_meta) = fs::metadata(dest).await else {
            return false;
        };
        if !dest_meta.is_file() || dest_meta.len() != source_meta.len() {
            return false;
        }
        match (source_meta.modified(), dest_meta.modified()) {
            (Ok(src), Ok(dst)) => dst >= src,
            _ => false,
        }
    }

    async fn copy_to(
        &self,
        source: &Path,
        partial: &Path,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> std::io::Result<()> {
        let mut reader = fs::File::open(source).await?;
        let mut writer = fs::File::create(partial).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            on_progress(n as u64);
        }

        writer.flush().await?;
        writer.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl MirrorPrimitive for FsMirror {
    async fn mirror_file(
        &self,
        source: &Path,
        dest: &Path,
        keep_revision: bool,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<MirrorOutcome> {
        let shown = source.display().to_string();
        let source_meta = fs::metadata(source)
            .await
            .map_err(|e| Error::transfer(shown.clone(), e))?;

        if Self::is_unchanged(&source_meta, dest).await {
            on_progress(source_meta.len());
            return Ok(MirrorOutcome::Unchanged);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::transfer(parent.display().to_string(), e))?;
        }

        let partial = with_suffix(dest, PARTIAL_SUFFIX);
        if let Err(e) = self.copy_to(source, &partial, on_progress).await {
            let _ = fs::remove_file(&partial).await;
            return Err(Error::transfer(shown, e));
        }

        let mut outcome = MirrorOutcome::Copied;
        if keep_revision && fs::metadata(dest).await.is_ok() {
            let previous = revision_path(dest).await;
            if let Err(e) = fs::rename(dest, &previous).await {
                let _ = fs::remove_file(&partial).await;
                return Err(Error::transfer(dest.display().to_string(), e));
            }
            debug!("Kept previous version as {}", previous.display());
            outcome = MirrorOutcome::Revised { previous };
        }

        let previous = match &outcome {
            MirrorOutcome::Revised { previous } => Some(previous.as_path()),
            _ => None,
        };
        if let Err(e) = commit(&partial, dest, previous).await {
            return Err(Error::transfer(dest.display().to_string(), e));
        }

        Ok(outcome)
    }
}

/// Move the finished copy into place. On failure the revision set aside
/// for this copy goes back to `dest`.
async fn commit(partial: &Path, dest: &Path, previous: Option<&Path>) -> std::io::Result<()> {
    let Err(e) = fs::rename(partial, dest).await else {
        return Ok(());
    };
    let _ = fs::remove_file(partial).await;
    if let Some(previous) = previous {
        if let Err(restore) = fs::rename(previous, dest).await {
            warn!(
                "Could not restore {} from {}: {}",
                dest.display(),
                previous.display(),
                restore
            );
        }
    }
    Err(e)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// `<name>.rev-<YYYYmmddTHHMMSS>`, with a counter if that name is taken.
async fn revision_path(dest: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S").to_string();
    let base = with_suffix(dest, &format!(".rev-{}", stamp));
    let mut candidate = base.clone();
    let mut n = 1;
    while fs::metadata(&candidate).await.is_ok() {
        candidate = with_suffix(&base, &format!("-{}", n));
        n += 1;
    }
    candidate
}
