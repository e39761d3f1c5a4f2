//! nbkeep: lock-guarded notebook storage with per-notebook kernels.
//!
//! The [`NotebookManager`] serializes every operation on a notebook through an
//! OS-level lock file, persists with atomic replace, keeps a bounded undo
//! history and routes execution to one kernel session per notebook.

pub mod config;
pub mod diff;
pub mod document;
pub mod editor;
pub mod error;
pub mod executor;
pub mod history;
pub mod jupyter;
pub mod kernel;
pub mod lock;
pub mod manager;
pub mod server;
pub mod session;
pub mod store;
pub mod view;

pub use config::{ManagerConfig, Settings};
pub use diff::{CellDiff, NotebookDiff};
pub use document::{Cell, CellExt, CellType, KernelSpec, Notebook, NotebookExt, Output, OutputExt};
pub use error::{ErrorKind, NotebookError, Result};
pub use executor::ExecutionSummary;
pub use kernel::{CellRun, KernelBackend, KernelSession, RunOutcome};
pub use manager::NotebookManager;
pub use server::RpcServer;
pub use view::{CellOutputs, CellView, NotebookContent, NotebookView};
