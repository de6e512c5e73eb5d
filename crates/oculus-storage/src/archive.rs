use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use oculus_core::Marketplace;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Where a raw search page ended up on disk.
#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived for this day and marketplace.
    pub deduplicated: bool,
}

/// Immutable, content-addressed archive of raw marketplace payloads, laid out
/// as `<YYYYMMDD>/<marketplace>/<sha256>.json` under the archive root.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        marketplace: Marketplace,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(marketplace.as_str())
            .join(format!("{content_hash}.json"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        marketplace: Marketplace,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::content_hash(bytes);
        let relative_path = Self::relative_path(fetched_at, marketplace, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let deduplicated = if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            true
        } else {
            write_once(&dir, &absolute_path, bytes).await?
        };

        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Write through a temp file in the target directory and rename into place.
/// Returns `true` when another writer got there first.
async fn write_once(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush().await?;
    drop(file);

    let renamed = fs::rename(&temp_path, target).await;
    if renamed.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    match renamed {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(true),
        Err(err) => Err(err).with_context(|| format!("moving archive into {}", target.display())),
    }
}
