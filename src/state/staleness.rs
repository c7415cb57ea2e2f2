//! Local cache staleness detection.
//!
//! Decides whether the locally cached state can be trusted by comparing the
//! version marker recorded at the last save with the remote object's current
//! marker. Only the marker is fetched, never the full state body.

use std::fmt;
use tracing::debug;

use crate::error::Result;

use super::local::CachedState;
use super::remote::VersionMarker;
use super::store::StateRepository;

/// Outcome of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// The cache matches the remote version and can be used as is.
    Fresh,
    /// The cache must be discarded and the remote state reloaded.
    Stale(StaleReason),
}

/// Why a local cache was found stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// No local cache exists.
    NoLocalState,
    /// The cache was saved without a remote version.
    NoRecordedVersion,
    /// The remote object no longer exists.
    RemoteMissing,
    /// The remote object has a different version than the one cached.
    VersionChanged {
        /// Marker recorded with the cache.
        local: VersionMarker,
        /// Current remote marker.
        remote: VersionMarker,
    },
}

/// Detector comparing local cache markers against the remote store.
#[derive(Debug, Default, Clone, Copy)]
pub struct StalenessDetector;

impl StalenessDetector {
    /// Creates a new detector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classifies a local cache against a known remote version.
    #[must_use]
    pub fn check(local: Option<&CachedState>, remote: Option<&VersionMarker>) -> Staleness {
        let Some(local) = local else {
            return Staleness::Stale(StaleReason::NoLocalState);
        };
        let Some(local_version) = local.version_marker.as_ref() else {
            return Staleness::Stale(StaleReason::NoRecordedVersion);
        };
        let Some(remote) = remote else {
            return Staleness::Stale(StaleReason::RemoteMissing);
        };

        if local_version == remote {
            Staleness::Fresh
        } else {
            Staleness::Stale(StaleReason::VersionChanged {
                local: local_version.clone(),
                remote: remote.clone(),
            })
        }
    }

    /// Checks a local cache against the live remote version.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote version cannot be fetched.
    pub async fn detect(
        &self,
        local: Option<&CachedState>,
        repository: &StateRepository,
    ) -> Result<Staleness> {
        let remote = repository.head().await?;
        let staleness = Self::check(local, remote.as_ref());
        debug!("Local state for {} is {staleness}", repository.target());
        Ok(staleness)
    }

    /// Returns true if the local cache must be discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote version cannot be fetched.
    pub async fn is_stale(
        &self,
        local: Option<&CachedState>,
        repository: &StateRepository,
    ) -> Result<bool> {
        Ok(self.detect(local, repository).await?.is_stale())
    }
}

impl Staleness {
    /// Returns true if the cache must be discarded.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale(reason) => write!(f, "stale ({reason})"),
        }
    }
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLocalState => write!(f, "no local state"),
            Self::NoRecordedVersion => write!(f, "no recorded remote version"),
            Self::RemoteMissing => write!(f, "remote state missing"),
            Self::VersionChanged { local, remote } => {
                write!(f, "remote version {remote} differs from cached {local}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryRemoteStore;
    use crate::state::store::PersistBase;
    use crate::state::types::{BundleTarget, DeploymentState};
    use std::sync::Arc;

    fn cached(marker: Option<&str>) -> CachedState {
        CachedState {
            version_marker: marker.map(VersionMarker::new),
            state: DeploymentState::new("b", "dev"),
        }
    }

    #[test]
    fn test_check_classification() {
        let v1 = VersionMarker::new("v1");
        let v2 = VersionMarker::new("v2");

        assert_eq!(
            StalenessDetector::check(None, Some(&v1)),
            Staleness::Stale(StaleReason::NoLocalState)
        );
        assert_eq!(
            StalenessDetector::check(Some(&cached(None)), Some(&v1)),
            Staleness::Stale(StaleReason::NoRecordedVersion)
        );
        assert_eq!(
            StalenessDetector::check(Some(&cached(Some("v1"))), None),
            Staleness::Stale(StaleReason::RemoteMissing)
        );
        assert!(StalenessDetector::check(Some(&cached(Some("v1"))), Some(&v2)).is_stale());
        assert_eq!(
            StalenessDetector::check(Some(&cached(Some("v1"))), Some(&v1)),
            Staleness::Fresh
        );
    }

    #[tokio::test]
    async fn test_outdated_marker_is_detected_against_remote() {
        let store = MemoryRemoteStore::new();
        let repo = StateRepository::new(
            Arc::new(store),
            BundleTarget::new("b", "dev", "/ws/b/dev"),
        );

        let mut state = DeploymentState::new("b", "dev");
        let mut base = PersistBase::default();
        let first = repo.persist(&mut state, &mut base).await.expect("persist");
        let local = CachedState {
            version_marker: Some(first),
            state: state.clone(),
        };

        let detector = StalenessDetector::new();
        assert!(!detector.is_stale(Some(&local), &repo).await.expect("check"));

        // Another deployer writes a newer version
        repo.persist(&mut state, &mut base).await.expect("persist");
        assert!(detector.is_stale(Some(&local), &repo).await.expect("check"));
    }
}
