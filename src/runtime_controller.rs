// =============================================================================
// RuntimeController — current broker mode, persisted across restarts (§4.11)
// =============================================================================
//
// Holds the active `RuntimeMode`. When a `Repository` is connected the mode
// is persisted there and reloaded at startup; otherwise it falls back to
// whatever `RuntimeConfig` specified on disk. A mode switch only takes effect
// on the *next* decision cycle — `DecisionScheduler` reads the controller's
// mode once at the top of each tick and builds a fresh broker from it, so an
// in-flight tick always finishes against the mode it started with.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use crate::repository::Repository;
use crate::types::RuntimeMode;

pub struct RuntimeController {
    mode: RwLock<RuntimeMode>,
    repository: Option<Arc<dyn Repository>>,
}

impl RuntimeController {
    /// `initial` is the mode from `RuntimeConfig`, used when no repository is
    /// connected or the repository has no mode recorded yet.
    pub async fn new(initial: RuntimeMode, repository: Option<Arc<dyn Repository>>) -> Result<Self> {
        let mode = match &repository {
            Some(repo) => repo.load_runtime_mode().await?.unwrap_or(initial),
            None => initial,
        };
        Ok(Self { mode: RwLock::new(mode), repository })
    }

    pub fn current(&self) -> RuntimeMode {
        *self.mode.read()
    }

    /// Switch the active mode, persisting it when a repository is connected.
    /// The new mode is visible to the next `current()` read immediately, but
    /// an already-running decision tick keeps using the mode it started with.
    pub async fn set(&self, mode: RuntimeMode) -> Result<()> {
        if let Some(repo) = &self.repository {
            repo.save_runtime_mode(mode).await?;
        }
        *self.mode.write() = mode;
        info!(%mode, "runtime mode switched");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.repository.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryRepository;

    #[tokio::test]
    async fn falls_back_to_initial_when_no_repository() {
        let controller = RuntimeController::new(RuntimeMode::Paper, None).await.unwrap();
        assert_eq!(controller.current(), RuntimeMode::Paper);
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn loads_persisted_mode_over_initial_when_repository_has_one() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        repo.save_runtime_mode(RuntimeMode::Live).await.unwrap();
        let controller = RuntimeController::new(RuntimeMode::Simulator, Some(repo)).await.unwrap();
        assert_eq!(controller.current(), RuntimeMode::Live);
    }

    #[tokio::test]
    async fn set_persists_and_updates_current() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let controller = RuntimeController::new(RuntimeMode::Simulator, Some(repo.clone())).await.unwrap();
        controller.set(RuntimeMode::Paper).await.unwrap();
        assert_eq!(controller.current(), RuntimeMode::Paper);
        assert_eq!(repo.load_runtime_mode().await.unwrap(), Some(RuntimeMode::Paper));
    }
}
