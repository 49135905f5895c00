//! Runtime autonomy level: persisted override of the config default.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::info;

use foreman_core::AutonomyLevel;

use crate::store::StateStore;

/// Owns the current autonomy level. The persisted runtime value wins over
/// the config default; changes only happen through [`set`], which is only
/// reachable from operator commands.
///
/// [`set`]: AutonomyState::set
pub struct AutonomyState {
    store: Arc<StateStore>,
    current: RwLock<AutonomyLevel>,
}

impl AutonomyState {
    pub async fn load(store: Arc<StateStore>, config_default: AutonomyLevel) -> Self {
        let level = store
            .read(|doc| doc.runtime_autonomy_level)
            .await
            .unwrap_or(config_default);
        Self {
            store,
            current: RwLock::new(level),
        }
    }

    /// Synchronous read for hot paths (validation, gating).
    pub fn current(&self) -> AutonomyLevel {
        *self.current.read().expect("autonomy level lock poisoned")
    }

    /// Parse and persist a new level. An unknown string errors without
    /// mutating anything. Returns `(old, new)` so callers can report the
    /// transition.
    pub async fn set(&self, raw: &str) -> Result<(AutonomyLevel, AutonomyLevel)> {
        let new_level = AutonomyLevel::from_str(raw)?;
        let old = self.current();
        self.store
            .update(|doc| doc.runtime_autonomy_level = Some(new_level))
            .await;
        *self.current.write().expect("autonomy level lock poisoned") = new_level;
        if old != new_level {
            info!(%old, %new_level, "autonomy level changed");
        }
        Ok((old, new_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_load_returns_the_new_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(StateStore::open(&path));
        let state = AutonomyState::load(store.clone(), AutonomyLevel::Observe).await;

        for raw in ["cautious", "moderate", "full", "observe"] {
            state.set(raw).await.unwrap();
            assert_eq!(state.current().as_str(), raw);

            // a fresh load sees the persisted level, not the config default
            let reloaded = AutonomyState::load(
                Arc::new(StateStore::open(&path)),
                AutonomyLevel::Full,
            )
            .await;
            assert_eq!(reloaded.current().as_str(), raw);
        }
    }

    #[tokio::test]
    async fn unknown_level_errors_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));
        let state = AutonomyState::load(store, AutonomyLevel::Cautious).await;

        assert!(state.set("yolo").await.is_err());
        assert_eq!(state.current(), AutonomyLevel::Cautious);
    }

    #[tokio::test]
    async fn config_default_applies_when_nothing_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));
        let state = AutonomyState::load(store, AutonomyLevel::Moderate).await;
        assert_eq!(state.current(), AutonomyLevel::Moderate);
    }
}
