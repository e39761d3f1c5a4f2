//! The notebook operation set.
//!
//! Every mutating operation takes the notebook's file lock, loads the current
//! document, applies its change and saves before the lock is released.
//! Read-only operations load without locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::config::ManagerConfig;
use crate::diff::{self, NotebookDiff};
use crate::document::{
    empty_notebook, with_kernelspec, CellExt, CellType, KernelSpec, Metadata, Notebook,
    NotebookExt, Output, OutputExt,
};
use crate::editor;
use crate::error::{NotebookError, Result};
use crate::executor::{self, ExecutionSummary};
use crate::history::History;
use crate::kernel::KernelBackend;
use crate::lock::{LockGuard, LockManager};
use crate::session::SessionRegistry;
use crate::store::DocumentStore;
use crate::view::{CellOutputs, CellView, NotebookContent, NotebookView};

pub struct NotebookManager {
    config: ManagerConfig,
    locks: LockManager,
    store: DocumentStore,
    sessions: SessionRegistry,
}

impl NotebookManager {
    pub fn new(config: ManagerConfig, backend: Arc<dyn KernelBackend>) -> Self {
        let locks = LockManager::new(config.lock_poll_interval);
        let store = DocumentStore::new(History::new(config.history_size));
        let sessions = SessionRegistry::new(backend, config.execution_timeout);
        Self {
            config,
            locks,
            store,
            sessions,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Create a new notebook bound to `kernel`.
    pub async fn create(&self, path: &Path, kernel: &KernelSpec) -> Result<Notebook> {
        let key = notebook_key(path)?;
        if exists(&key).await? {
            return Err(NotebookError::AlreadyExists(key));
        }
        ensure_parent(&key).await?;

        let _guard = self.lock(&key).await?;
        if exists(&key).await? {
            return Err(NotebookError::AlreadyExists(key));
        }

        let notebook = with_kernelspec(kernel);
        self.store.save(&notebook, &key).await?;
        info!("[manager] Created {:?} with kernel {}", key, kernel.name);
        Ok(notebook)
    }

    pub async fn read(&self, path: &Path, include_outputs: bool) -> Result<NotebookView> {
        let notebook = self.load_for_read(path).await?;
        Ok(NotebookView::from_notebook(
            &path.display().to_string(),
            &notebook,
            include_outputs,
        ))
    }

    pub async fn read_cell(&self, path: &Path, cell_id: &str) -> Result<CellView> {
        let notebook = self.load_for_read(path).await?;
        let index = editor::locate(&notebook, cell_id)?;
        Ok(CellView::from_cell(&notebook.cells[index], true))
    }

    /// Processed text of each output of a cell. Empty for non-code cells.
    pub async fn read_outputs(&self, path: &Path, cell_id: &str) -> Result<Vec<String>> {
        let notebook = self.load_for_read(path).await?;
        let index = editor::locate(&notebook, cell_id)?;
        Ok(notebook.cells[index]
            .outputs()
            .iter()
            .map(OutputExt::text)
            .collect())
    }

    /// Outputs of every code cell that has any, in notebook order.
    pub async fn read_notebook_outputs(&self, path: &Path) -> Result<Vec<CellOutputs>> {
        let notebook = self.load_for_read(path).await?;
        Ok(notebook
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_code() && !cell.outputs().is_empty())
            .map(|(index, cell)| CellOutputs::from_cell(index, cell))
            .collect())
    }

    /// All `.ipynb` files under `dir`, recursively, sorted.
    pub async fn list_notebooks(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let root = notebook_key(dir)?;
        let mut pending = vec![root];
        let mut found = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(NotebookError::NotFound(dir))
                }
                Err(e) => return Err(NotebookError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| NotebookError::io(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| NotebookError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "ipynb") {
                    found.push(path);
                }
            }
        }

        found.sort();
        debug!("[manager] Found {} notebooks", found.len());
        Ok(found)
    }

    /// Replace a notebook's cells and metadata.
    pub async fn write(&self, path: &Path, content: &NotebookContent) -> Result<Notebook> {
        let key = notebook_key(path)?;

        let metadata: Metadata =
            serde_json::from_value(serde_json::Value::Object(content.metadata.clone())).map_err(
                |e| NotebookError::InvalidArgument(format!("Invalid notebook metadata: {}", e)),
            )?;
        let mut notebook = Notebook {
            metadata,
            ..empty_notebook()
        };
        for cell in &content.cells {
            let cell_type = match cell.cell_type.as_deref() {
                Some(name) => name.parse::<CellType>()?,
                None => CellType::Code,
            };
            editor::add_cell(
                &mut notebook,
                &cell.content,
                cell_type,
                -1,
                cell.id.as_deref(),
            );
        }

        ensure_parent(&key).await?;
        let _guard = self.lock(&key).await?;
        self.store.save(&notebook, &key).await?;
        info!("[manager] Wrote {} cells to {:?}", notebook.cells.len(), key);
        Ok(notebook)
    }

    pub async fn add_cell(
        &self,
        path: &Path,
        content: &str,
        cell_type: CellType,
        position: i64,
    ) -> Result<(Notebook, String)> {
        self.mutate(path, |notebook| {
            Ok(editor::add_cell(notebook, content, cell_type, position, None))
        })
        .await
    }

    pub async fn edit_cell(&self, path: &Path, cell_id: &str, content: &str) -> Result<Notebook> {
        let (notebook, ()) = self
            .mutate(path, |notebook| editor::edit_cell(notebook, cell_id, content))
            .await?;
        Ok(notebook)
    }

    pub async fn delete_cell(&self, path: &Path, cell_id: &str) -> Result<Notebook> {
        let (notebook, _) = self
            .mutate(path, |notebook| editor::delete_cell(notebook, cell_id))
            .await?;
        Ok(notebook)
    }

    /// Run one cell and persist its outputs.
    ///
    /// Exceptions raised by the code are returned as error outputs. A timeout
    /// or lost kernel still persists what was captured, then fails the call.
    pub async fn execute_cell(
        &self,
        path: &Path,
        cell_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Output>> {
        let key = notebook_key(path)?;
        let timeout = timeout.unwrap_or_else(|| self.sessions.default_timeout());

        let _guard = self.lock(&key).await?;
        let mut notebook = self.store.load(&key).await?;
        let index = editor::locate(&notebook, cell_id)?;
        if !notebook.cells[index].is_code() {
            debug!("[manager] Cell {} is not code, nothing to run", cell_id);
            return Ok(Vec::new());
        }

        let spec = self.kernel_spec(&notebook);
        let mut session = self.sessions.get_or_create(&key, &spec).await?;
        let run = executor::run_cell(&mut notebook.cells[index], &mut session, timeout).await;
        self.store.save(&notebook, &key).await?;
        drop(session);

        match executor::failure_reason(&run.outcome, timeout) {
            Some(reason) => Err(NotebookError::ExecutionFailure(reason)),
            None => Ok(run.outputs),
        }
    }

    /// Run every code cell in order and persist once at the end.
    pub async fn execute_all(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<ExecutionSummary> {
        let key = notebook_key(path)?;
        let timeout = timeout.unwrap_or_else(|| self.sessions.default_timeout());

        let _guard = self.lock(&key).await?;
        let mut notebook = self.store.load(&key).await?;
        let spec = self.kernel_spec(&notebook);
        let mut session = self.sessions.get_or_create(&key, &spec).await?;
        let summary = executor::run_all(&mut notebook, &mut session, timeout).await;
        self.store.save(&notebook, &key).await?;
        drop(session);

        info!(
            "[manager] Ran {:?}: {} executed, {} failed",
            key, summary.executed, summary.failed
        );
        Ok(summary)
    }

    /// Restore the notebook to its state before the last save.
    pub async fn undo(&self, path: &Path) -> Result<()> {
        let key = notebook_key(path)?;
        let _guard = self.lock(&key).await?;
        self.store.undo(&key).await?;
        info!("[manager] Undid last operation on {:?}", key);
        Ok(())
    }

    pub async fn diff(&self, a: &Path, b: &Path, include_outputs: bool) -> Result<NotebookDiff> {
        let notebook_a = self.store.load(&notebook_key(a)?).await?;
        let notebook_b = self.store.load(&notebook_key(b)?).await?;
        Ok(diff::compare(&notebook_a, &notebook_b, include_outputs))
    }

    /// Shut down the kernel for `path`, if one is running.
    pub async fn close_session(&self, path: &Path) -> Result<bool> {
        let key = notebook_key(path)?;
        Ok(self.sessions.close_session(&key).await)
    }

    pub async fn close_all_sessions(&self) -> usize {
        let closed = self.sessions.close_all().await;
        if closed > 0 {
            info!("[manager] Closed {} kernels", closed);
        }
        closed
    }

    async fn mutate<T, F>(&self, path: &Path, change: F) -> Result<(Notebook, T)>
    where
        F: FnOnce(&mut Notebook) -> Result<T>,
    {
        let key = notebook_key(path)?;
        let _guard = self.lock(&key).await?;
        let mut notebook = self.store.load(&key).await?;
        let value = change(&mut notebook)?;
        self.store.save(&notebook, &key).await?;
        Ok((notebook, value))
    }

    /// Load for a read-only view, creating a starter notebook if the path is
    /// missing and that is enabled.
    async fn load_for_read(&self, path: &Path) -> Result<Notebook> {
        let key = notebook_key(path)?;
        match self.store.load(&key).await {
            Err(NotebookError::NotFound(_)) if self.config.create_missing_on_read => {
                self.create_starter(&key).await
            }
            other => other,
        }
    }

    async fn create_starter(&self, key: &Path) -> Result<Notebook> {
        ensure_parent(key).await?;
        let _guard = self.lock(key).await?;
        if exists(key).await? {
            return self.store.load(key).await;
        }

        let spec = KernelSpec::from_name(&self.config.default_kernel);
        let mut notebook = with_kernelspec(&spec);
        editor::add_cell(&mut notebook, "# New Notebook", CellType::Markdown, -1, None);
        editor::add_cell(&mut notebook, "# Your code here", CellType::Code, -1, None);
        self.store.save(&notebook, key).await?;
        info!("[manager] Created missing notebook {:?}", key);
        Ok(notebook)
    }

    async fn lock(&self, key: &Path) -> Result<LockGuard<'_>> {
        if let Some(parent) = key.parent() {
            if !exists(parent).await? {
                return Err(NotebookError::NotFound(key.to_path_buf()));
            }
        }
        self.locks.lock(key, self.config.lock_timeout).await
    }

    fn kernel_spec(&self, notebook: &Notebook) -> KernelSpec {
        KernelSpec::from_name(notebook.kernel_name().unwrap_or(&self.config.default_kernel))
    }
}

/// Absolute lexical form of `path`, used as the key for locks, history and
/// sessions.
pub fn notebook_key(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| NotebookError::io(path, e))
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| NotebookError::io(path, e))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| NotebookError::io(parent, e))?;
    }
    Ok(())
}
