//! Where baseline bytes come from and where they are persisted.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::{debug, warn};

/// Reads baselines from their source location.
pub trait BaselineSource: Send + Sync + 'static {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<Vec<u8>>>;
}

/// Reads baselines from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSource;

impl BaselineSource for FsSource {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        let path = path.to_path_buf();
        Box::pin(async move { tokio::fs::read(path).await })
    }
}

const EXTENSION: &str = "baseline";

/// Persistent cache: one file per baseline id under a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", sanitize(id)))
    }

    /// Cached bytes for `id`, or `None` on a miss.
    ///
    /// Read errors other than "not found" are logged and treated as a miss
    /// so that the caller falls back to the source.
    pub async fn read(&self, id: &str) -> Option<Vec<u8>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(id, path = %path.display(), error = %e, "Unreadable persistent baseline");
                None
            }
        }
    }

    /// Write through. Goes via a temp file so readers never see a partial file.
    pub async fn write(&self, id: &str, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(id);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(id, path = %path.display(), bytes = bytes.len(), "Persisted baseline");
        Ok(())
    }

    /// Remove every persisted baseline. Returns the number of files removed.
    pub async fn clear(&self) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ours = path
                .extension()
                .map(|ext| ext == EXTENSION || ext == "tmp")
                .unwrap_or(false);
            if ours {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
