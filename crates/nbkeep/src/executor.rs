//! Running cells against a session and recording what they produced.

use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::document::{error_output, Cell, CellExt, Notebook, Output};
use crate::kernel::{CellRun, RunOutcome};
use crate::session::SessionGuard;

/// Counts reported by a whole-notebook run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Human-readable reason a run did not complete, if it didn't.
pub fn failure_reason(outcome: &RunOutcome, timeout: Duration) -> Option<String> {
    match outcome {
        RunOutcome::Completed => None,
        RunOutcome::TimedOut => Some(format!(
            "Cell execution timed out after {} seconds",
            timeout.as_secs()
        )),
        RunOutcome::Failed(reason) => Some(reason.clone()),
    }
}

fn failure_output(outcome: &RunOutcome, timeout: Duration) -> Option<Output> {
    let ename = match outcome {
        RunOutcome::Completed => return None,
        RunOutcome::TimedOut => "ExecutionTimeout",
        RunOutcome::Failed(_) => "KernelError",
    };
    let evalue = failure_reason(outcome, timeout).unwrap_or_default();
    Some(error_output(ename, &evalue, Vec::new()))
}

/// Run a single code cell, replacing its outputs and execution count.
///
/// Whatever the kernel produced before a timeout or failure is kept on the
/// cell. Non-code cells are left untouched and yield an empty completed run.
pub async fn run_cell(cell: &mut Cell, session: &mut SessionGuard, timeout: Duration) -> CellRun {
    if !cell.is_code() {
        debug!("[executor] Skipping {} cell {}", cell.cell_type(), cell.id_str());
        return CellRun::completed(Vec::new(), None);
    }

    cell.set_execution(Vec::new(), None);
    let run = session.run(&cell.source_text(), timeout).await;
    cell.set_execution(run.outputs.clone(), run.execution_count);

    if let Some(reason) = failure_reason(&run.outcome, timeout) {
        warn!("[executor] Cell {} did not complete: {}", cell.id_str(), reason);
    }
    run
}

/// Run every code cell in order.
///
/// Cells whose run did not complete get a synthesized error output and the
/// run carries on with the next cell. A cell counts as failed when it ends up
/// with at least one error output.
pub async fn run_all(
    notebook: &mut Notebook,
    session: &mut SessionGuard,
    timeout: Duration,
) -> ExecutionSummary {
    let indices: Vec<usize> = notebook
        .cells
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell.is_code())
        .map(|(i, _)| i)
        .collect();
    let codes: Vec<String> = indices
        .iter()
        .map(|&i| notebook.cells[i].source_text())
        .collect();

    for &i in &indices {
        notebook.cells[i].set_execution(Vec::new(), None);
    }

    let mut runs = session.run_all(&codes, timeout).await.into_iter();
    let mut summary = ExecutionSummary::default();

    for &i in &indices {
        let mut run = runs.next().unwrap_or_else(|| CellRun {
            outputs: Vec::new(),
            execution_count: None,
            outcome: RunOutcome::Failed("No result from kernel".to_string()),
        });

        if let Some(output) = failure_output(&run.outcome, timeout) {
            run.outputs.push(output);
        }

        let failed = run.has_error();
        notebook.cells[i].set_execution(run.outputs, run.execution_count);

        summary.executed += 1;
        if failed {
            summary.failed += 1;
        } else {
            summary.succeeded += 1;
        }
    }

    debug!(
        "[executor] Ran {} cells: {} succeeded, {} failed",
        summary.executed, summary.succeeded, summary.failed
    );
    summary
}
