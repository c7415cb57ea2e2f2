//! Typed access to the remote deployment state object.
//!
//! The repository turns raw conditional object writes into the serial
//! discipline of deployment state: every persisted write carries the serial
//! that directly follows the one it was based on, and is accepted only if the
//! remote object is still the version that was read.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BundleError, Result, StateError};

use super::remote::{RemoteStore, VersionMarker};
use super::types::{BundleTarget, DeploymentState};

/// Deployment state as last read from, or written to, the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteState {
    /// The state.
    pub state: DeploymentState,
    /// Remote version of the state object.
    pub version: VersionMarker,
}

/// Position in the remote write history that the next persist builds on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistBase {
    /// Version of the remote object the local copy derives from (`None` if absent).
    pub version: Option<VersionMarker>,
    /// Serial of that version (0 if absent).
    pub serial: u64,
}

/// Repository for one target's remote state object.
#[derive(Clone)]
pub struct StateRepository {
    /// Remote store backend.
    store: Arc<dyn RemoteStore>,
    /// Target the state belongs to.
    target: BundleTarget,
}

impl StateRepository {
    /// Creates a repository for a target.
    #[must_use]
    pub fn new(store: Arc<dyn RemoteStore>, target: BundleTarget) -> Self {
        Self { store, target }
    }

    /// The target this repository serves.
    #[must_use]
    pub const fn target(&self) -> &BundleTarget {
        &self.target
    }

    /// The underlying remote store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Fetches only the version marker of the remote state.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote store cannot be reached.
    pub async fn head(&self) -> Result<Option<VersionMarker>> {
        self.store.head_version(&self.target.state_path()).await
    }

    /// Fetches and decodes the full remote state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the object is not a valid state.
    pub async fn fetch(&self) -> Result<Option<RemoteState>> {
        let path = self.target.state_path();
        let Some(object) = self.store.get(&path).await? else {
            debug!("No remote state at {path}");
            return Ok(None);
        };

        let state = DeploymentState::from_bytes(&object.bytes)?;
        info!(
            "Loaded remote state for {} (serial {}, {} resources)",
            self.target,
            state.serial,
            state.resources.len()
        );

        Ok(Some(RemoteState {
            state,
            version: object.version,
        }))
    }

    /// Persists `state` as the successor of `base`.
    ///
    /// On success `state.serial` is `base.serial + 1` and `base` is advanced to
    /// the written version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::PersistConflict`] if the remote object changed since
    /// `base` was read, or a backend error.
    pub async fn persist(
        &self,
        state: &mut DeploymentState,
        base: &mut PersistBase,
    ) -> Result<VersionMarker> {
        let path = self.target.state_path();
        let previous_serial = state.serial;
        state.serial = base.serial + 1;

        let bytes = match state.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                state.serial = previous_serial;
                return Err(e);
            }
        };

        match self.store.put(&path, bytes, base.version.clone()).await {
            Ok(version) => {
                debug!("Persisted state serial {} to {path}", state.serial);
                base.version = Some(version.clone());
                base.serial = state.serial;
                Ok(version)
            }
            Err(BundleError::State(StateError::Conflict { .. })) => {
                warn!(
                    "Remote state at {path} changed underneath serial {}; refusing to overwrite",
                    base.serial
                );
                let attempted = state.serial;
                state.serial = previous_serial;
                Err(StateError::PersistConflict { path, attempted }.into())
            }
            Err(e) => {
                state.serial = previous_serial;
                Err(e)
            }
        }
    }

    /// Deletes the remote state object if it is still at `base`.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the object changed, or a backend error.
    pub async fn delete(&self, base: &PersistBase) -> Result<()> {
        let path = self.target.state_path();
        info!("Deleting remote state {path}");
        self.store.delete(&path, base.version.clone()).await
    }
}

impl PersistBase {
    /// Base for a remote state that has just been read.
    #[must_use]
    pub fn from_remote(remote: &RemoteState) -> Self {
        Self {
            version: Some(remote.version.clone()),
            serial: remote.state.serial,
        }
    }
}

impl std::fmt::Debug for StateRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRepository")
            .field("backend", &self.store.backend_type())
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryRemoteStore;

    fn repository(store: &MemoryRemoteStore) -> StateRepository {
        StateRepository::new(
            Arc::new(store.clone()),
            BundleTarget::new("b", "dev", "/ws/b/dev"),
        )
    }

    #[tokio::test]
    async fn test_persist_increments_serial_by_one() {
        let store = MemoryRemoteStore::new();
        let repo = repository(&store);
        let mut state = DeploymentState::new("b", "dev");
        let mut base = PersistBase::default();

        repo.persist(&mut state, &mut base).await.expect("first persist");
        assert_eq!(state.serial, 1);
        repo.persist(&mut state, &mut base).await.expect("second persist");
        assert_eq!(state.serial, 2);

        let remote = repo.fetch().await.expect("fetch").expect("exists");
        assert_eq!(remote.state.serial, 2);
        assert_eq!(Some(remote.version), base.version);
    }

    #[tokio::test]
    async fn test_persist_from_stale_base_conflicts() {
        let store = MemoryRemoteStore::new();
        let repo = repository(&store);

        let mut first = DeploymentState::new("b", "dev");
        let mut first_base = PersistBase::default();
        repo.persist(&mut first, &mut first_base).await.expect("persist");

        // Two deployers read the same version
        let remote = repo.fetch().await.expect("fetch").expect("exists");
        let mut a = remote.state.clone();
        let mut a_base = PersistBase::from_remote(&remote);
        let mut b = remote.state.clone();
        let mut b_base = PersistBase::from_remote(&remote);

        repo.persist(&mut a, &mut a_base).await.expect("a wins");
        let err = repo
            .persist(&mut b, &mut b_base)
            .await
            .expect_err("b must conflict");

        assert!(matches!(
            err,
            BundleError::State(StateError::PersistConflict { attempted: 2, .. })
        ));
        // The rejected write leaves the in-memory serial untouched
        assert_eq!(b.serial, 1);
        assert_eq!(repo.fetch().await.expect("fetch").expect("exists").state, a);
    }

    #[tokio::test]
    async fn test_head_matches_fetch() {
        let store = MemoryRemoteStore::new();
        let repo = repository(&store);
        assert!(repo.head().await.expect("head").is_none());

        let mut state = DeploymentState::new("b", "dev");
        let version = repo
            .persist(&mut state, &mut PersistBase::default())
            .await
            .expect("persist");
        assert_eq!(repo.head().await.expect("head"), Some(version));
    }
}
