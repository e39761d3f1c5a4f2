//! Bounded per-notebook snapshot history used for undo.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::document::Notebook;
use crate::error::{NotebookError, Result};

pub const DEFAULT_HISTORY_SIZE: usize = 10;

pub struct History {
    capacity: usize,
    stacks: Mutex<HashMap<PathBuf, VecDeque<Notebook>>>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a snapshot, dropping the oldest once over capacity.
    pub fn push(&self, path: &Path, snapshot: &Notebook) {
        let mut stacks = self.stacks();
        let stack = stacks.entry(path.to_path_buf()).or_default();
        stack.push_back(snapshot.clone());
        while stack.len() > self.capacity {
            stack.pop_front();
        }
        debug!("[history] {:?} now has {} snapshots", path, stack.len());
    }

    /// Restore the snapshot below the top via `write`, then pop the top.
    ///
    /// The top stays in place if `write` fails. Callers hold the notebook's
    /// file lock, so nothing else pushes for `path` while `write` runs.
    pub async fn undo<F, Fut>(&self, path: &Path, write: F) -> Result<()>
    where
        F: FnOnce(Notebook) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let previous = {
            let stacks = self.stacks();
            match stacks.get(path) {
                Some(stack) if stack.len() >= 2 => stack[stack.len() - 2].clone(),
                _ => return Err(NotebookError::NoHistory(path.to_path_buf())),
            }
        };

        write(previous).await?;

        if let Some(stack) = self.stacks().get_mut(path) {
            stack.pop_back();
            debug!("[history] Undo on {:?}, {} snapshots left", path, stack.len());
        }
        Ok(())
    }

    pub fn len(&self, path: &Path) -> usize {
        self.stacks().get(path).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, path: &Path) -> bool {
        self.len(path) == 0
    }

    pub fn clear(&self, path: &Path) {
        self.stacks().remove(path);
    }

    fn stacks(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, VecDeque<Notebook>>> {
        self.stacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
