//! Cache of live kernel sessions, one per notebook path.
//!
//! Each path owns a slot behind its own async mutex, so a slow kernel start
//! for one notebook never blocks work on another. The outer map lock is only
//! held long enough to look up or insert a slot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::document::KernelSpec;
use crate::error::{NotebookError, Result};
use crate::kernel::{CellRun, KernelBackend, KernelSession, RunOutcome};

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

type Slot = Option<Box<dyn KernelSession>>;

pub struct SessionRegistry {
    backend: Arc<dyn KernelBackend>,
    default_timeout: Duration,
    sessions: Mutex<HashMap<PathBuf, Arc<AsyncMutex<Slot>>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn KernelBackend>, default_timeout: Duration) -> Self {
        Self {
            backend,
            default_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Lock the session for `path`, starting a kernel from `spec` if none is live.
    pub async fn get_or_create(&self, path: &Path, spec: &KernelSpec) -> Result<SessionGuard> {
        let slot = {
            let mut sessions = self.sessions();
            sessions
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            info!("[session] Starting {} kernel for {:?}", spec.name, path);
            let session = self.backend.start(spec).await.map_err(|e| match e {
                NotebookError::ExecutionFailure(_) => e,
                other => NotebookError::ExecutionFailure(format!(
                    "Failed to start {} kernel: {}",
                    spec.name, other
                )),
            })?;
            *guard = Some(session);
        }

        Ok(SessionGuard { guard })
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.sessions().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down and forget the session for `path`. Returns whether one existed.
    pub async fn close_session(&self, path: &Path) -> bool {
        let slot = self.sessions().remove(path);
        match slot {
            Some(slot) => {
                shutdown_slot(path, slot).await;
                true
            }
            None => false,
        }
    }

    /// Shut down every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(PathBuf, Arc<AsyncMutex<Slot>>)> = self.sessions().drain().collect();
        let count = drained.len();
        for (path, slot) in drained {
            shutdown_slot(&path, slot).await;
        }
        count
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<AsyncMutex<Slot>>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn shutdown_slot(path: &Path, slot: Arc<AsyncMutex<Slot>>) {
    let mut guard = slot.lock().await;
    if let Some(mut session) = guard.take() {
        match session.shutdown().await {
            Ok(()) => info!("[session] Closed kernel for {:?}", path),
            Err(e) => warn!("[session] Error shutting down kernel for {:?}: {}", path, e),
        }
    }
}

/// Exclusive access to one notebook's live session.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Slot>,
}

impl SessionGuard {
    pub async fn run(&mut self, code: &str, timeout: Duration) -> CellRun {
        match (*self.guard).as_mut() {
            Some(session) => session.run(code, timeout).await,
            None => closed_run(),
        }
    }

    pub async fn run_all(&mut self, codes: &[String], timeout: Duration) -> Vec<CellRun> {
        match (*self.guard).as_mut() {
            Some(session) => session.run_all(codes, timeout).await,
            None => codes.iter().map(|_| closed_run()).collect(),
        }
    }
}

fn closed_run() -> CellRun {
    CellRun {
        outputs: Vec::new(),
        execution_count: None,
        outcome: RunOutcome::Failed("session is closed".to_string()),
    }
}
