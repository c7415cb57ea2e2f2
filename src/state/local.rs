//! Local state cache.
//!
//! Each workspace checkout keeps its own snapshot of the last deployment state
//! it saw, together with the remote version marker of that snapshot. The cache
//! is advisory: anything wrong with it just means "no cache".

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::remote::VersionMarker;
use super::types::DeploymentState;

/// Default cache directory name, relative to the bundle root.
pub const CACHE_DIR: &str = ".bundle";

/// Cache file name.
const CACHE_FILE: &str = "deployment.json";

/// A cached state plus the remote version it was saved against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedState {
    /// Remote version marker at the time of the save.
    pub version_marker: Option<VersionMarker>,
    /// The cached state.
    pub state: DeploymentState,
}

/// File-based cache of one target's deployment state.
#[derive(Debug, Clone)]
pub struct LocalStateCache {
    /// Directory holding the cache file.
    base_dir: PathBuf,
    /// Path to the cache file.
    cache_path: PathBuf,
}

impl LocalStateCache {
    /// Creates a cache for `target` under the bundle root directory.
    #[must_use]
    pub fn for_target(bundle_root: impl AsRef<Path>, target: &str) -> Self {
        Self::with_base_dir(bundle_root.as_ref().join(CACHE_DIR).join(target))
    }

    /// Creates a cache with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let cache_path = base_dir.join(CACHE_FILE);
        Self {
            base_dir,
            cache_path,
        }
    }

    /// Path of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    /// Loads the cached state.
    ///
    /// A missing, unreadable or corrupt cache yields `None`.
    pub async fn load(&self) -> Option<CachedState> {
        let content = match fs::read(&self.cache_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No local state cache at {}", self.cache_path.display());
                return None;
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable local state cache {}: {e}",
                    self.cache_path.display()
                );
                return None;
            }
        };

        match serde_json::from_slice::<CachedState>(&content) {
            Ok(cached) => {
                debug!(
                    "Loaded local state cache (serial {}, lineage {})",
                    cached.state.serial, cached.state.lineage
                );
                Some(cached)
            }
            Err(e) => {
                warn!(
                    "Ignoring corrupt local state cache {}: {e}",
                    self.cache_path.display()
                );
                None
            }
        }
    }

    /// Saves a state together with the remote version it corresponds to.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be written.
    pub async fn save(&self, state: &DeploymentState, version: Option<&VersionMarker>) -> Result<()> {
        let cached = CachedState {
            version_marker: version.cloned(),
            state: state.clone(),
        };
        self.write(&cached).await
    }

    /// Writes a cached state atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be written.
    pub async fn write(&self, cached: &CachedState) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StateError::backend(format!("Failed to create cache directory: {e}"))
        })?;

        let content = serde_json::to_vec_pretty(cached).map_err(|e| {
            StateError::serialization(format!("Failed to serialize state cache: {e}"))
        })?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.cache_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create temp cache file: {e}"))
        })?;
        file.write_all(&content)
            .await
            .map_err(|e| StateError::backend(format!("Failed to write cache file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync cache file: {e}")))?;

        fs::rename(&temp_path, &self.cache_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename cache file: {e}")))?;

        debug!("Local state cache saved: {}", self.cache_path.display());
        Ok(())
    }

    /// Removes the cache file.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing cache file cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.cache_path).await {
            Ok(()) => {
                info!("Cleared local state cache: {}", self.cache_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::backend(format!("Failed to remove cache file: {e}")).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{ResourceKey, ResourceRecord};
    use tempfile::TempDir;

    fn create_test_cache() -> (LocalStateCache, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cache = LocalStateCache::for_target(temp_dir.path(), "dev");
        (cache, temp_dir)
    }

    fn sample_state() -> DeploymentState {
        let mut state = DeploymentState::new("my-bundle", "dev");
        state.serial = 3;
        state.set_resource(ResourceRecord::new(
            &ResourceKey::new("job", "nightly"),
            "1001",
            "f00d",
        ));
        state
    }

    #[tokio::test]
    async fn test_save_then_load_returns_same_state() {
        let (cache, _temp) = create_test_cache();
        let state = sample_state();
        let marker = VersionMarker::new("g4");

        cache.save(&state, Some(&marker)).await.expect("save");

        let loaded = cache.load().await.expect("cache should exist");
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.version_marker, Some(marker));
    }

    #[tokio::test]
    async fn test_saving_loaded_cache_is_noop() {
        let (cache, _temp) = create_test_cache();
        cache
            .save(&sample_state(), Some(&VersionMarker::new("g1")))
            .await
            .expect("save");
        let before = std::fs::read(cache.path()).expect("read");

        let loaded = cache.load().await.expect("cache should exist");
        cache.write(&loaded).await.expect("rewrite");

        let after = std::fs::read(cache.path()).expect("read");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_missing_cache_is_absent() {
        let (cache, _temp) = create_test_cache();
        assert!(cache.load().await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_absent() {
        let (cache, _temp) = create_test_cache();
        std::fs::create_dir_all(cache.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(cache.path(), b"{not json").expect("write");

        assert!(cache.load().await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, _temp) = create_test_cache();
        cache.save(&sample_state(), None).await.expect("save");
        cache.clear().await.expect("clear");
        assert!(cache.load().await.is_none());
        cache.clear().await.expect("clearing twice is fine");
    }
}
