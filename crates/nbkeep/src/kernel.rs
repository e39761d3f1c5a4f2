//! Execution engine abstraction.
//!
//! A [`KernelBackend`] starts sessions; a [`KernelSession`] runs code and
//! hands back captured outputs. The Jupyter implementation lives in
//! [`crate::jupyter`]; tests plug in scripted fakes.

use std::time::Duration;

use async_trait::async_trait;

use crate::document::{KernelSpec, Output, OutputExt};
use crate::error::Result;

/// How a single run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The kernel finished the request. Cell-level exceptions still count as
    /// completed and show up as error outputs.
    Completed,
    /// No idle status arrived within the timeout.
    TimedOut,
    /// The kernel connection failed mid-run.
    Failed(String),
}

/// Result of running one cell.
#[derive(Debug, Clone)]
pub struct CellRun {
    pub outputs: Vec<Output>,
    pub execution_count: Option<i32>,
    pub outcome: RunOutcome,
}

impl CellRun {
    pub fn completed(outputs: Vec<Output>, execution_count: Option<i32>) -> Self {
        Self {
            outputs,
            execution_count,
            outcome: RunOutcome::Completed,
        }
    }

    pub fn has_error(&self) -> bool {
        self.outputs.iter().any(OutputExt::is_error)
    }
}

#[async_trait]
pub trait KernelSession: Send {
    async fn run(&mut self, code: &str, timeout: Duration) -> CellRun;

    /// Run several cells in order, one [`CellRun`] per input.
    async fn run_all(&mut self, codes: &[String], timeout: Duration) -> Vec<CellRun> {
        let mut runs = Vec::with_capacity(codes.len());
        for code in codes {
            runs.push(self.run(code, timeout).await);
        }
        runs
    }

    async fn shutdown(&mut self) -> Result<()>;
}

#[async_trait]
pub trait KernelBackend: Send + Sync {
    async fn start(&self, spec: &KernelSpec) -> Result<Box<dyn KernelSession>>;
}
