//! Newline-delimited JSON-RPC 2.0 over stdio.
//!
//! Each request line gets exactly one response line. Stdout carries nothing
//! but responses; logs go to stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::document::{CellType, KernelSpec, OutputExt};
use crate::error::NotebookError;
use crate::manager::NotebookManager;
use crate::view::NotebookContent;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Request ID: integer, string, or null.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    #[default]
    Null,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<NotebookError> for RpcError {
    fn from(err: NotebookError) -> Self {
        let code = match &err {
            NotebookError::InvalidArgument(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        RpcError {
            code,
            message: err.to_string(),
            data: Some(json!({ "kind": err.kind() })),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cell_type() -> String {
    "code".to_string()
}

fn default_position() -> i64 {
    -1
}

#[derive(Deserialize)]
struct PathParams {
    notebook_path: String,
}

#[derive(Deserialize)]
struct CreateParams {
    notebook_path: String,
    #[serde(default)]
    kernel_name: Option<String>,
}

#[derive(Deserialize)]
struct ReadParams {
    notebook_path: String,
    #[serde(default = "default_true")]
    include_outputs: bool,
}

#[derive(Deserialize)]
struct CellParams {
    notebook_path: String,
    cell_id: String,
}

#[derive(Deserialize)]
struct WriteParams {
    notebook_path: String,
    content: NotebookContent,
}

#[derive(Deserialize)]
struct AddCellParams {
    notebook_path: String,
    cell_content: String,
    #[serde(default = "default_cell_type")]
    cell_type: String,
    #[serde(default = "default_position")]
    position: i64,
}

#[derive(Deserialize)]
struct EditCellParams {
    notebook_path: String,
    cell_id: String,
    new_content: String,
}

#[derive(Deserialize)]
struct ExecuteCellParams {
    notebook_path: String,
    cell_id: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct RunAllParams {
    notebook_path: String,
    #[serde(default)]
    timeout: Option<u64>,
}

fn default_directory() -> String {
    ".".to_string()
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_directory")]
    directory: String,
}

#[derive(Deserialize)]
struct DiffParams {
    notebook_path_a: String,
    notebook_path_b: String,
    #[serde(default)]
    include_outputs: bool,
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value) => value,
    };
    serde_json::from_value(value)
        .map_err(|e| RpcError::new(INVALID_PARAMS, format!("Invalid params: {}", e)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

pub struct RpcServer {
    manager: NotebookManager,
    workspace: PathBuf,
}

impl RpcServer {
    pub fn new(manager: NotebookManager, workspace: PathBuf) -> Self {
        Self { manager, workspace }
    }

    pub fn manager(&self) -> &NotebookManager {
        &self.manager
    }

    /// Relative paths resolve against the workspace directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Serve requests until `reader` hits EOF, then close every kernel.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        info!("[rpc] Serving on stdio, workspace {:?}", self.workspace);

        while let Some(line) = lines.next_line().await? {
            let Some(response) = self.handle_line(&line).await else {
                continue;
            };
            let mut payload = match serde_json::to_string(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("[rpc] Failed to encode response: {}", e);
                    continue;
                }
            };
            payload.push('\n');
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await?;
        }

        info!("[rpc] Input closed, shutting down");
        self.manager.close_all_sessions().await;
        Ok(())
    }

    /// Handle one request line. Blank lines produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("[rpc] Parse error: {}", e);
                return Some(Response::error(
                    RequestId::Null,
                    RpcError::new(PARSE_ERROR, format!("Parse error: {}", e)),
                ));
            }
        };

        let request: Request = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(e) => {
                let id = value
                    .get("id")
                    .and_then(|id| serde_json::from_value(id.clone()).ok())
                    .unwrap_or_default();
                return Some(Response::error(
                    id,
                    RpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e)),
                ));
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(Response::error(
                request.id,
                RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ));
        }

        debug!("[rpc] {} ({:?})", request.method, request.id);
        let response = match self.dispatch(&request.method, request.params).await {
            Ok(result) => Response::success(request.id, result),
            Err(err) => {
                if err.code != METHOD_NOT_FOUND {
                    warn!("[rpc] {} failed: {}", request.method, err.message);
                }
                Response::error(request.id, err)
            }
        };
        Some(response)
    }

    pub async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "create_notebook" => {
                let p: CreateParams = parse_params(params)?;
                let kernel_name = p
                    .kernel_name
                    .unwrap_or_else(|| self.manager.config().default_kernel.clone());
                let path = self.resolve(&p.notebook_path);
                self.manager
                    .create(&path, &KernelSpec::from_name(&kernel_name))
                    .await?;
                Ok(json!({
                    "success": true,
                    "message": format!("Created new notebook at {}", p.notebook_path),
                    "notebook_path": p.notebook_path,
                    "kernel_name": kernel_name,
                }))
            }
            "read_notebook" => {
                let p: ReadParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let mut view = self.manager.read(&path, p.include_outputs).await?;
                view.notebook_path = p.notebook_path;
                to_value(&view)
            }
            "list_notebooks" => {
                let p: ListParams = parse_params(params)?;
                let notebooks = self.manager.list_notebooks(&self.resolve(&p.directory)).await?;
                let notebooks: Vec<String> = notebooks
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                Ok(json!({
                    "success": true,
                    "directory": p.directory,
                    "notebooks": notebooks,
                }))
            }
            "read_notebook_outputs" => {
                let p: PathParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let outputs = self.manager.read_notebook_outputs(&path).await?;
                Ok(json!({
                    "success": true,
                    "notebook_path": p.notebook_path,
                    "outputs": to_value(&outputs)?,
                }))
            }
            "read_cell" => {
                let p: CellParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let cell = self.manager.read_cell(&path, &p.cell_id).await?;
                Ok(json!({
                    "success": true,
                    "notebook_path": p.notebook_path,
                    "cell": to_value(&cell)?,
                }))
            }
            "write_notebook" => {
                let p: WriteParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                self.manager.write(&path, &p.content).await?;
                Ok(json!({
                    "success": true,
                    "message": format!("Notebook saved to {}", p.notebook_path),
                    "notebook_path": p.notebook_path,
                }))
            }
            "add_cell" => {
                let p: AddCellParams = parse_params(params)?;
                let cell_type: CellType = p.cell_type.parse()?;
                let path = self.resolve(&p.notebook_path);
                let (_, cell_id) = self
                    .manager
                    .add_cell(&path, &p.cell_content, cell_type, p.position)
                    .await?;
                let position = if p.position >= 0 {
                    p.position.to_string()
                } else {
                    "end".to_string()
                };
                Ok(json!({
                    "success": true,
                    "message": format!("Added {} cell at position {}", cell_type, position),
                    "cell_id": cell_id,
                    "notebook_path": p.notebook_path,
                }))
            }
            "edit_cell" => {
                let p: EditCellParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                self.manager
                    .edit_cell(&path, &p.cell_id, &p.new_content)
                    .await?;
                Ok(json!({
                    "success": true,
                    "message": format!("Updated cell {}", p.cell_id),
                    "cell_id": p.cell_id,
                    "notebook_path": p.notebook_path,
                }))
            }
            "delete_cell" => {
                let p: CellParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                self.manager.delete_cell(&path, &p.cell_id).await?;
                Ok(json!({
                    "success": true,
                    "message": format!("Deleted cell {}", p.cell_id),
                    "notebook_path": p.notebook_path,
                }))
            }
            "execute_cell" => {
                let p: ExecuteCellParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let outputs = self
                    .manager
                    .execute_cell(&path, &p.cell_id, p.timeout.map(Duration::from_secs))
                    .await?;
                let texts: Vec<String> = outputs.iter().map(|o| o.text()).collect();
                Ok(json!({
                    "success": true,
                    "cell_id": p.cell_id,
                    "notebook_path": p.notebook_path,
                    "outputs": texts,
                }))
            }
            "get_outputs" => {
                let p: CellParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let outputs = self.manager.read_outputs(&path, &p.cell_id).await?;
                Ok(json!({
                    "success": true,
                    "cell_id": p.cell_id,
                    "notebook_path": p.notebook_path,
                    "outputs": outputs,
                }))
            }
            "run_all_cells" => {
                let p: RunAllParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let summary = self
                    .manager
                    .execute_all(&path, p.timeout.map(Duration::from_secs))
                    .await?;
                Ok(json!({
                    "success": true,
                    "notebook_path": p.notebook_path,
                    "cells_executed": summary.executed,
                    "successful_cells": summary.succeeded,
                    "failed_cells": summary.failed,
                }))
            }
            "undo_last_operation" => {
                let p: PathParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                self.manager.undo(&path).await?;
                Ok(json!({
                    "success": true,
                    "message": "Last operation undone successfully",
                    "notebook_path": p.notebook_path,
                }))
            }
            "notebook_diff" => {
                let p: DiffParams = parse_params(params)?;
                let diff = self
                    .manager
                    .diff(
                        &self.resolve(&p.notebook_path_a),
                        &self.resolve(&p.notebook_path_b),
                        p.include_outputs,
                    )
                    .await?;
                Ok(json!({
                    "success": true,
                    "notebook_a": p.notebook_path_a,
                    "notebook_b": p.notebook_path_b,
                    "cell_count_diff": diff.cell_count_diff,
                    "differences": to_value(&diff.differences)?,
                    "metadata_diff": diff.metadata_diff,
                    "total_differences": diff.differences.len(),
                }))
            }
            "close_kernel" => {
                let p: PathParams = parse_params(params)?;
                let path = self.resolve(&p.notebook_path);
                let closed = self.manager.close_session(&path).await?;
                let message = if closed {
                    format!("Closed kernel for {}", p.notebook_path)
                } else {
                    format!("No active kernel for {}", p.notebook_path)
                };
                Ok(json!({
                    "success": true,
                    "message": message,
                    "notebook_path": p.notebook_path,
                }))
            }
            "close_all_kernels" => {
                let closed = self.manager.close_all_sessions().await;
                Ok(json!({
                    "success": true,
                    "message": format!("Closed {} kernels", closed),
                }))
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::jupyter::JupyterBackend;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> RpcServer {
        let manager = NotebookManager::new(ManagerConfig::default(), Arc::new(JupyterBackend::default()));
        RpcServer::new(manager, dir.path().to_path_buf())
    }

    async fn call(server: &RpcServer, request: Value) -> Response {
        server.handle_line(&request.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn test_parse_error_has_null_id() {
        let dir = TempDir::new().unwrap();
        let response = server(&dir).handle_line("{nope").await.unwrap();
        assert_eq!(response.id, RequestId::Null);
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_blank_lines_are_ignored() {
        let dir = TempDir::new().unwrap();
        assert!(server(&dir).handle_line("   ").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dir = TempDir::new().unwrap();
        let response = call(
            &server(&dir),
            json!({"jsonrpc": "2.0", "id": 7, "method": "list_tools"}),
        )
        .await;
        assert_eq!(response.id, RequestId::Number(7));
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_params_are_invalid() {
        let dir = TempDir::new().unwrap();
        let response = call(
            &server(&dir),
            json!({"jsonrpc": "2.0", "id": "a", "method": "edit_cell", "params": {"notebook_path": "x.ipynb"}}),
        )
        .await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_add_and_read_through_rpc() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let created = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 1, "method": "create_notebook", "params": {"notebook_path": "a.ipynb"}}),
        )
        .await;
        assert_eq!(created.result.unwrap()["kernel_name"], "python3");
        assert!(dir.path().join("a.ipynb").exists());

        let added = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 2, "method": "add_cell", "params": {
                "notebook_path": "a.ipynb", "cell_content": "# Title", "cell_type": "markdown"
            }}),
        )
        .await;
        let result = added.result.unwrap();
        assert_eq!(result["message"], "Added markdown cell at position end");
        let cell_id = result["cell_id"].as_str().unwrap().to_string();

        let read = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 3, "method": "read_notebook", "params": {"notebook_path": "a.ipynb"}}),
        )
        .await;
        let view = read.result.unwrap();
        assert_eq!(view["notebook_path"], "a.ipynb");
        assert_eq!(view["cells"][0]["id"], cell_id.as_str());
        assert_eq!(view["cells"][0]["type"], "markdown");
        assert_eq!(view["metadata"]["kernelspec"]["name"], "python3");
    }

    #[tokio::test]
    async fn test_operation_errors_carry_kind() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        call(
            &server,
            json!({"jsonrpc": "2.0", "id": 1, "method": "create_notebook", "params": {"notebook_path": "a.ipynb"}}),
        )
        .await;

        let response = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 2, "method": "undo_last_operation", "params": {"notebook_path": "a.ipynb"}}),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.data.unwrap()["kind"], "no_history");

        let response = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 3, "method": "add_cell", "params": {
                "notebook_path": "a.ipynb", "cell_content": "x", "cell_type": "sql"
            }}),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.data.unwrap()["kind"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_serve_writes_one_line_per_request() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let input = concat!(
            "{\"jsonrpc\": \"2.0\", \"id\": 1, \"method\": \"close_all_kernels\"}\n",
            "\n",
            "not json\n",
        );
        let mut output = Vec::new();
        server.serve(input.as_bytes(), &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Response = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.result.unwrap()["success"], true);
        let second: Response = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_list_and_read_outputs_through_rpc() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        for path in ["a.ipynb", "sub/b.ipynb"] {
            call(
                &server,
                json!({"jsonrpc": "2.0", "id": 1, "method": "create_notebook", "params": {"notebook_path": path}}),
            )
            .await;
        }

        let listed = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 2, "method": "list_notebooks"}),
        )
        .await;
        let result = listed.result.unwrap();
        let notebooks: Vec<String> = serde_json::from_value(result["notebooks"].clone()).unwrap();
        assert_eq!(notebooks.len(), 2);
        assert!(notebooks[0].ends_with("a.ipynb"));
        assert!(notebooks[1].ends_with("b.ipynb"));

        let outputs = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 3, "method": "read_notebook_outputs", "params": {"notebook_path": "a.ipynb"}}),
        )
        .await;
        assert_eq!(outputs.result.unwrap()["outputs"], json!([]));

        let missing = call(
            &server,
            json!({"jsonrpc": "2.0", "id": 4, "method": "list_notebooks", "params": {"directory": "nope"}}),
        )
        .await;
        assert_eq!(missing.error.unwrap().data.unwrap()["kind"], "not_found");
        assert_eq!(server.manager().config().default_kernel, "python3");
    }

    #[test]
    fn test_resolve_against_workspace() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        assert_eq!(server.resolve("a.ipynb"), dir.path().join("a.ipynb"));
        let absolute = dir.path().join("b.ipynb");
        assert_eq!(server.resolve(absolute.to_str().unwrap()), absolute);
    }
}
