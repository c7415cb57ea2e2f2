//! Shared-directory remote store.
//!
//! Stores objects as files under a directory that several deployers can see
//! (a network mount, a synced folder, or simply one machine). Version markers
//! are SHA-256 digests of the object body. Conditional writes are serialized
//! with an exclusive-create guard file next to the object.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{BundleError, Result, StateError};

use super::remote::{RemoteObject, RemoteStore, VersionMarker};

/// How long to wait for another writer's guard before giving up.
const GUARD_ATTEMPTS: u32 = 200;

/// Delay between guard acquisition attempts.
const GUARD_RETRY_MS: u64 = 25;

/// Guards older than this belong to a crashed writer.
const GUARD_STALE_SECS: u64 = 30;

/// Directory-backed remote store.
#[derive(Debug, Clone)]
pub struct FsRemoteStore {
    /// Root directory of the store.
    root: PathBuf,
}

/// Exclusive write guard; removed on drop.
struct WriteGuard {
    path: PathBuf,
}

impl FsRemoteStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps an object path to a file under the root.
    fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn digest(bytes: &[u8]) -> VersionMarker {
        VersionMarker::new(hex::encode(Sha256::digest(bytes)))
    }

    async fn read(file: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::backend(format!(
                "Failed to read {}: {e}",
                file.display()
            ))
            .into()),
        }
    }

    async fn lock(file: &Path) -> Result<WriteGuard> {
        let guard_path = file.with_extension("guard");

        if let Some(parent) = guard_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StateError::backend(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        for _ in 0..GUARD_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&guard_path)
                .await
            {
                Ok(_) => {
                    return Ok(WriteGuard { path: guard_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::guard_is_stale(&guard_path).await {
                        warn!("Removing stale write guard: {}", guard_path.display());
                        let _ = fs::remove_file(&guard_path).await;
                        continue;
                    }
                    tokio::time::sleep(Duration::from_millis(GUARD_RETRY_MS)).await;
                }
                Err(e) => {
                    return Err(StateError::backend(format!(
                        "Failed to create write guard {}: {e}",
                        guard_path.display()
                    ))
                    .into());
                }
            }
        }

        Err(StateError::backend(format!(
            "Timed out waiting for write guard {}",
            guard_path.display()
        ))
        .into())
    }

    async fn guard_is_stale(path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .is_some_and(|age| age > Duration::from_secs(GUARD_STALE_SECS))
    }

    fn check(path: &str, current: Option<&[u8]>, expected: Option<&VersionMarker>) -> Result<()> {
        let current = current.map(Self::digest);
        if current.as_ref() == expected {
            Ok(())
        } else {
            Err(BundleError::State(StateError::Conflict {
                path: path.to_string(),
            }))
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl RemoteStore for FsRemoteStore {
    async fn get(&self, path: &str) -> Result<Option<RemoteObject>> {
        let file = self.file_path(path);
        Ok(Self::read(&file).await?.map(|bytes| RemoteObject {
            version: Self::digest(&bytes),
            bytes,
        }))
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<VersionMarker>,
    ) -> Result<VersionMarker> {
        let file = self.file_path(path);
        let _guard = Self::lock(&file).await?;

        let current = Self::read(&file).await?;
        Self::check(path, current.as_deref(), expected.as_ref())?;

        let temp_path = file.with_extension("tmp");
        let mut out = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create {}: {e}", temp_path.display()))
        })?;
        out.write_all(&bytes)
            .await
            .map_err(|e| StateError::backend(format!("Failed to write {path}: {e}")))?;
        out.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync {path}: {e}")))?;
        drop(out);

        fs::rename(&temp_path, &file)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename {path}: {e}")))?;

        debug!("Wrote {} ({} bytes)", file.display(), bytes.len());
        Ok(Self::digest(&bytes))
    }

    async fn head_version(&self, path: &str) -> Result<Option<VersionMarker>> {
        let file = self.file_path(path);
        Ok(Self::read(&file).await?.as_deref().map(Self::digest))
    }

    async fn delete(&self, path: &str, expected: Option<VersionMarker>) -> Result<()> {
        let file = self.file_path(path);
        let _guard = Self::lock(&file).await?;

        let Some(current) = Self::read(&file).await? else {
            return Ok(());
        };
        if expected.is_some() {
            Self::check(path, Some(&current), expected.as_ref())?;
        }

        fs::remove_file(&file)
            .await
            .map_err(|e| StateError::backend(format!("Failed to delete {path}: {e}")))?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "fs"
    }
}
