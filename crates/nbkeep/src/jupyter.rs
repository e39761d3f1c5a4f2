//! Jupyter kernel backend built on `runtimelib`.
//!
//! Each session launches its own kernel process from an installed kernelspec,
//! talks to it over ZeroMQ and converts iopub traffic into document outputs.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, InterruptRequest, JupyterMessage,
    JupyterMessageContent, KernelInfoRequest, ShutdownRequest, Status,
};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::document::{KernelSpec, Output};
use crate::lock::deadline_after;
use crate::error::{NotebookError, Result};
use crate::kernel::{CellRun, KernelBackend, KernelSession, RunOutcome};

const STARTUP_GRACE: Duration = Duration::from_millis(500);

fn kernel_error(context: &str, err: impl std::fmt::Display) -> NotebookError {
    NotebookError::ExecutionFailure(format!("{}: {}", context, err))
}

/// Starts kernels found through the standard Jupyter kernelspec search path.
pub struct JupyterBackend {
    startup_timeout: Duration,
}

impl Default for JupyterBackend {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl JupyterBackend {
    pub fn new(startup_timeout: Duration) -> Self {
        Self { startup_timeout }
    }
}

#[async_trait]
impl KernelBackend for JupyterBackend {
    async fn start(&self, spec: &KernelSpec) -> Result<Box<dyn KernelSession>> {
        let session = JupyterSession::launch(&spec.name, self.startup_timeout).await?;
        Ok(Box::new(session))
    }
}

pub struct JupyterSession {
    kernel_id: String,
    session_id: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    shell: runtimelib::ClientShellConnection,
    iopub_rx: mpsc::UnboundedReceiver<JupyterMessage>,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
    _process: tokio::process::Child,
}

impl JupyterSession {
    pub async fn launch(kernel_name: &str, startup_timeout: Duration) -> Result<Self> {
        let kernelspec = runtimelib::find_kernelspec(kernel_name)
            .await
            .map_err(|e| kernel_error(&format!("Kernel {} not found", kernel_name), e))?;

        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5)
            .await
            .map_err(|e| kernel_error("Failed to reserve kernel ports", e))?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernel_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir)
            .await
            .map_err(|e| NotebookError::io(&runtime_dir, e))?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("nbkeep-kernel-{}.json", kernel_id));
        let connection_json = serde_json::to_string_pretty(&connection_info)
            .map_err(|e| kernel_error("Failed to encode connection info", e))?;
        tokio::fs::write(&connection_file, connection_json)
            .await
            .map_err(|e| NotebookError::io(&connection_file, e))?;

        info!(
            "[kernel] Starting {} kernel {} at {:?}",
            kernel_name, kernel_id, connection_file
        );

        let process = kernelspec
            .command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))
            .map_err(|e| kernel_error("Failed to build kernel command", e))?
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| kernel_error("Failed to spawn kernel", e))?;

        tokio::time::sleep(STARTUP_GRACE).await;

        let session_id = Uuid::new_v4().to_string();

        let mut iopub = runtimelib::create_client_iopub_connection(&connection_info, "", &session_id)
            .await
            .map_err(|e| kernel_error("Failed to connect iopub", e))?;
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        if iopub_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[kernel] iopub read error: {}", e);
                        break;
                    }
                }
            }
        });

        let identity = runtimelib::peer_identity_for_session(&session_id)
            .map_err(|e| kernel_error("Failed to derive shell identity", e))?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await
        .map_err(|e| kernel_error("Failed to connect shell", e))?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell
            .send(request)
            .await
            .map_err(|e| kernel_error("Failed to send kernel_info_request", e))?;

        match tokio::time::timeout(startup_timeout, shell.read()).await {
            Ok(Ok(msg)) => info!("[kernel] Kernel alive: got {} reply", msg.header.msg_type),
            Ok(Err(e)) => {
                iopub_task.abort();
                tokio::fs::remove_file(&connection_file).await.ok();
                return Err(kernel_error("Kernel did not respond", e));
            }
            Err(_) => {
                iopub_task.abort();
                tokio::fs::remove_file(&connection_file).await.ok();
                return Err(NotebookError::ExecutionFailure(format!(
                    "Kernel did not respond within {}s",
                    startup_timeout.as_secs()
                )));
            }
        }

        Ok(Self {
            kernel_id,
            session_id,
            connection_info,
            connection_file,
            shell,
            iopub_rx,
            iopub_task: Some(iopub_task),
            _process: process,
        })
    }

    async fn interrupt(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await
                .map_err(|e| kernel_error("Failed to connect control", e))?;
        let request: JupyterMessage = InterruptRequest {}.into();
        control
            .send(request)
            .await
            .map_err(|e| kernel_error("Failed to send interrupt_request", e))?;
        info!("[kernel] Sent interrupt_request to {}", self.kernel_id);
        Ok(())
    }

    async fn collect(&mut self, message_id: &str, deadline: Instant, run: &mut CellRun) {
        loop {
            tokio::select! {
                received = self.iopub_rx.recv() => {
                    let Some(msg) = received else {
                        run.outcome = RunOutcome::Failed("Kernel iopub channel closed".to_string());
                        return;
                    };
                    let is_ours = msg
                        .parent_header
                        .as_ref()
                        .map(|h| h.msg_id.as_str())
                        == Some(message_id);
                    if !is_ours {
                        continue;
                    }
                    match &msg.content {
                        JupyterMessageContent::Status(Status { execution_state }) => {
                            if *execution_state == ExecutionState::Idle {
                                return;
                            }
                        }
                        JupyterMessageContent::ExecuteInput(input) => {
                            run.execution_count = Some(input.execution_count.0 as i32);
                        }
                        JupyterMessageContent::ClearOutput(_) => run.outputs.clear(),
                        content => {
                            if let Some(output) = convert_output(content) {
                                run.outputs.push(output);
                            }
                        }
                    }
                }
                result = self.shell.read() => {
                    match result {
                        Ok(msg) => debug!("[kernel] shell reply: {}", msg.header.msg_type),
                        Err(e) => {
                            run.outcome = RunOutcome::Failed(format!("Kernel shell channel failed: {}", e));
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    run.outcome = RunOutcome::TimedOut;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl KernelSession for JupyterSession {
    async fn run(&mut self, code: &str, timeout: Duration) -> CellRun {
        let mut run = CellRun::completed(Vec::new(), None);
        let deadline = deadline_after(timeout);

        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let message_id = message.header.msg_id.clone();
        if let Err(e) = self.shell.send(message).await {
            run.outcome = RunOutcome::Failed(format!("Failed to send execute_request: {}", e));
            return run;
        }
        debug!("[kernel] Sent execute_request {} to {}", message_id, self.kernel_id);

        self.collect(&message_id, deadline, &mut run).await;

        if run.outcome == RunOutcome::TimedOut {
            warn!(
                "[kernel] execute_request {} timed out after {:?}",
                message_id, timeout
            );
            if let Err(e) = self.interrupt().await {
                warn!("[kernel] Interrupt failed: {}", e);
            }
        }
        run
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }

        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await
                .map_err(|e| kernel_error("Failed to connect control", e))?;
        let request: JupyterMessage = ShutdownRequest { restart: false }.into();
        control.send(request).await.ok();

        tokio::fs::remove_file(&self.connection_file).await.ok();
        info!("[kernel] Shut down kernel {}", self.kernel_id);
        Ok(())
    }
}

/// nbformat JSON for an iopub message that produces a cell output.
fn message_content_to_nbformat(content: &JupyterMessageContent) -> Option<Value> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => Some(json!({
            "output_type": "display_data",
            "data": data.data,
            "metadata": data.metadata
        })),
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

fn convert_output(content: &JupyterMessageContent) -> Option<Output> {
    let value = message_content_to_nbformat(content)?;
    match serde_json::from_value(value) {
        Ok(output) => Some(output),
        Err(e) => {
            warn!("[kernel] Dropping unconvertible output: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::OutputExt;

    #[test]
    fn test_nbformat_json_parses_as_output() {
        let stream = json!({"output_type": "stream", "name": "stdout", "text": "hi\n"});
        let output: Output = serde_json::from_value(stream).unwrap();
        assert!(matches!(&output, Output::Stream { name, .. } if name == "stdout"));
        assert_eq!(output.text(), "hi\n");

        let result = json!({
            "output_type": "execute_result",
            "data": {"text/plain": "3"},
            "metadata": {},
            "execution_count": 2
        });
        let output: Output = serde_json::from_value(result).unwrap();
        assert_eq!(output.text(), "3");
    }

    #[test]
    fn test_non_output_messages_are_skipped() {
        let message: JupyterMessage = ShutdownRequest { restart: false }.into();
        assert!(message_content_to_nbformat(&message.content).is_none());
        assert!(convert_output(&message.content).is_none());
    }
}
