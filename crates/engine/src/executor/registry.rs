//! Cancellation tokens of live runs, keyed by run id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a run. The token is a child of `parent` when one is given, so cancelling the
    /// parent also cancels the run. Returns `None` when `run_id` is already live.
    pub fn register(&self, run_id: &str, parent: Option<&CancellationToken>) -> Option<RunGuard> {
        let mut runs = self.lock();
        if runs.contains_key(run_id) {
            return None;
        }
        let token = parent.map(CancellationToken::child_token).unwrap_or_default();
        runs.insert(run_id.to_string(), token.clone());
        debug!(run_id = %run_id, "run registered");
        Some(RunGuard {
            registry: self.clone(),
            run_id: run_id.to_string(),
            token,
        })
    }

    /// Cancels a live run. Returns `false` when no run with this id is registered.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                info!(run_id = %run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut run_ids: Vec<String> = self.lock().keys().cloned().collect();
        run_ids.sort();
        run_ids
    }

    fn unregister(&self, run_id: &str) {
        self.lock().remove(run_id);
        debug!(run_id = %run_id, "run unregistered");
    }
}

/// Keeps a run registered until dropped.
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    run_id: String,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.run_id);
    }
}
