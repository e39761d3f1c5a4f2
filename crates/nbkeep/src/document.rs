//! Notebook documents, modelled with the `nbformat` crate's v4 types.
//!
//! Adds what the manager needs on top: cell id repair on load, kernel
//! selection from metadata and a plain-text rendering of outputs.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use jupyter_protocol::media::MediaType;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use nbformat::v4::{Cell, CellId, CellMetadata, Metadata, Notebook, Output};
use nbformat::v4::{ErrorOutput, MultilineString};

use crate::error::NotebookError;

pub const NBFORMAT: i32 = 4;
pub const NBFORMAT_MINOR: i32 = 5;

/// Kernel selection recorded in `metadata.kernelspec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub display_name: String,
    pub language: Option<String>,
}

impl KernelSpec {
    /// Build a spec from a kernel name, filling display fields for the
    /// well-known kernels.
    pub fn from_name(name: &str) -> Self {
        let (display_name, language) = match name {
            "python3" | "python" => ("Python 3", Some("python")),
            "deno" => ("Deno", Some("typescript")),
            "ir" => ("R", Some("R")),
            "julia" => ("Julia", Some("julia")),
            other => (other, None),
        };
        KernelSpec {
            name: name.to_string(),
            display_name: display_name.to_string(),
            language: language.map(str::to_string),
        }
    }

    fn to_metadata(&self) -> nbformat::v4::KernelSpec {
        nbformat::v4::KernelSpec {
            display_name: self.display_name.clone(),
            name: self.name.clone(),
            language: self.language.clone(),
            additional: HashMap::new(),
        }
    }
}

impl Default for KernelSpec {
    fn default() -> Self {
        KernelSpec::from_name(crate::config::DEFAULT_KERNEL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Raw => "raw",
        }
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellType {
    type Err = NotebookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            other => Err(NotebookError::InvalidArgument(format!(
                "Invalid cell type: {}. Must be 'code', 'markdown' or 'raw'",
                other
            ))),
        }
    }
}

/// An empty format 4.5 notebook.
pub fn empty_notebook() -> Notebook {
    Notebook {
        metadata: Metadata::default(),
        nbformat: NBFORMAT,
        nbformat_minor: NBFORMAT_MINOR,
        cells: Vec::new(),
    }
}

/// An empty notebook bound to the given kernel.
pub fn with_kernelspec(spec: &KernelSpec) -> Notebook {
    let mut notebook = empty_notebook();
    notebook.set_kernelspec(spec);
    notebook
}

pub fn empty_cell_metadata() -> CellMetadata {
    CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

pub fn new_cell(cell_type: CellType, id: CellId, source: &str) -> Cell {
    let source = source_to_lines(source);
    match cell_type {
        CellType::Code => Cell::Code {
            id,
            metadata: empty_cell_metadata(),
            execution_count: None,
            source,
            outputs: Vec::new(),
        },
        CellType::Markdown => Cell::Markdown {
            id,
            metadata: empty_cell_metadata(),
            source,
            attachments: None,
        },
        CellType::Raw => Cell::Raw {
            id,
            metadata: empty_cell_metadata(),
            source,
        },
    }
}

/// Generate a fresh cell id.
pub fn new_cell_id() -> CellId {
    CellId::from(Uuid::new_v4())
}

/// Split source text into nbformat lines, each keeping its newline.
pub fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

pub fn stream_output(name: &str, text: &str) -> Output {
    Output::Stream {
        name: name.to_string(),
        text: MultilineString(text.to_string()),
    }
}

pub fn error_output(ename: &str, evalue: &str, traceback: Vec<String>) -> Output {
    Output::Error(ErrorOutput {
        ename: ename.to_string(),
        evalue: evalue.to_string(),
        traceback,
    })
}

pub trait NotebookExt {
    fn set_kernelspec(&mut self, spec: &KernelSpec);

    /// Kernel name recorded in `metadata.kernelspec.name`, if any.
    fn kernel_name(&self) -> Option<&str>;

    fn find_cell_index(&self, cell_id: &str) -> Option<usize>;

    fn contains_cell(&self, cell_id: &str) -> bool {
        self.find_cell_index(cell_id).is_some()
    }
}

impl NotebookExt for Notebook {
    fn set_kernelspec(&mut self, spec: &KernelSpec) {
        self.metadata.kernelspec = Some(spec.to_metadata());
    }

    fn kernel_name(&self) -> Option<&str> {
        self.metadata
            .kernelspec
            .as_ref()
            .map(|spec| spec.name.as_str())
            .filter(|name| !name.is_empty())
    }

    fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id().as_str() == cell_id)
    }
}

pub trait CellExt {
    fn id_str(&self) -> &str;
    fn cell_type(&self) -> CellType;
    /// Source joined back into one string.
    fn source_text(&self) -> String;
    fn set_source(&mut self, source: &str);
    /// Outputs of a code cell; empty for other cell types.
    fn outputs(&self) -> &[Output];
    fn execution_count(&self) -> Option<i32>;
    /// Replace outputs and execution count. No-op for non-code cells.
    fn set_execution(&mut self, outputs: Vec<Output>, count: Option<i32>);

    fn is_code(&self) -> bool {
        self.cell_type() == CellType::Code
    }
}

impl CellExt for Cell {
    fn id_str(&self) -> &str {
        self.id().as_str()
    }

    fn cell_type(&self) -> CellType {
        match self {
            Cell::Code { .. } => CellType::Code,
            Cell::Markdown { .. } => CellType::Markdown,
            Cell::Raw { .. } => CellType::Raw,
        }
    }

    fn source_text(&self) -> String {
        self.source().join("")
    }

    fn set_source(&mut self, new_source: &str) {
        let lines = source_to_lines(new_source);
        match self {
            Cell::Code { source, .. } | Cell::Markdown { source, .. } | Cell::Raw { source, .. } => {
                *source = lines
            }
        }
    }

    fn outputs(&self) -> &[Output] {
        match self {
            Cell::Code { outputs, .. } => outputs,
            _ => &[],
        }
    }

    fn execution_count(&self) -> Option<i32> {
        match self {
            Cell::Code {
                execution_count, ..
            } => *execution_count,
            _ => None,
        }
    }

    fn set_execution(&mut self, new_outputs: Vec<Output>, count: Option<i32>) {
        if let Cell::Code {
            outputs,
            execution_count,
            ..
        } = self
        {
            *outputs = new_outputs;
            *execution_count = count;
        }
    }
}

pub trait OutputExt {
    fn is_error(&self) -> bool;

    /// Plain-text rendering used for read views and output comparison.
    fn text(&self) -> String;
}

impl OutputExt for Output {
    fn is_error(&self) -> bool {
        matches!(self, Output::Error(_))
    }

    fn text(&self) -> String {
        match self {
            Output::Stream { text, .. } => text.0.clone(),
            Output::ExecuteResult(result) => plain_text(&result.data).unwrap_or_default(),
            Output::DisplayData(display) => plain_text(&display.data).unwrap_or_default(),
            Output::Error(error) => format!("{}: {}", error.ename, error.evalue),
        }
    }
}

/// The `text/plain` entry of a rich output, if it has one.
pub fn plain_text(data: &jupyter_protocol::media::Media) -> Option<String> {
    data.content.iter().find_map(|media| match media {
        MediaType::Plain(text) => Some(text.clone()),
        _ => None,
    })
}

fn is_valid_id(id: &str) -> bool {
    CellId::new(id).is_ok()
}

/// Give every cell in raw notebook JSON a unique, valid id.
///
/// The first cell carrying a given valid id keeps it. Cells without one, or
/// with a duplicate or malformed id, get an id derived from their position
/// that avoids every id already present, so repeated loads of an unchanged
/// file agree. Returns true if anything was repaired.
pub fn repair_cell_ids(value: &mut Value) -> bool {
    let Some(cells) = value.get_mut("cells").and_then(Value::as_array_mut) else {
        return false;
    };

    let ids: Vec<Option<String>> = cells
        .iter()
        .map(|cell| {
            cell.get("id")
                .and_then(Value::as_str)
                .filter(|id| is_valid_id(id))
                .map(str::to_string)
        })
        .collect();

    let mut taken: HashSet<String> = HashSet::new();
    let keep: Vec<bool> = ids
        .iter()
        .map(|id| id.as_ref().is_some_and(|id| taken.insert(id.clone())))
        .collect();

    let mut repaired = false;
    for (index, cell) in cells.iter_mut().enumerate() {
        if keep[index] {
            continue;
        }
        let Some(fields) = cell.as_object_mut() else {
            continue;
        };

        let base = match &ids[index] {
            Some(duplicate) => {
                warn!("[document] Duplicate cell id {}, re-identifying", duplicate);
                format!("{}-{}", duplicate, index)
            }
            None => format!("cell-{}", index),
        };
        let base = if is_valid_id(&base) {
            base
        } else {
            format!("cell-{}", index)
        };

        let mut candidate = base.clone();
        let mut suffix = 1;
        while taken.contains(&candidate) || !is_valid_id(&candidate) {
            candidate = if base.len() + 8 <= 64 {
                format!("{}-{}", base, suffix)
            } else {
                format!("cell-{}-{}", index, suffix)
            };
            suffix += 1;
        }

        fields.insert("id".to_string(), Value::String(candidate.clone()));
        taken.insert(candidate);
        repaired = true;
    }
    repaired
}

/// Parse notebook JSON, repairing cell ids first.
///
/// Anything other than format 4 is rejected. Documents older than 4.5 are
/// upgraded. Returns the notebook and whether any id was repaired.
pub fn parse_notebook(content: &str) -> Result<(Notebook, bool), String> {
    let mut value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    match value.get("nbformat").and_then(Value::as_i64) {
        Some(4) => {}
        Some(other) => return Err(format!("unsupported nbformat version {}", other)),
        None => return Err("missing nbformat version".to_string()),
    }

    let repaired = repair_cell_ids(&mut value);
    let notebook = match nbformat::parse_notebook(&value.to_string()).map_err(|e| e.to_string())? {
        nbformat::Notebook::V4(notebook) => notebook,
        nbformat::Notebook::Legacy(legacy) => {
            nbformat::upgrade_legacy_notebook(legacy).map_err(|e| e.to_string())?
        }
        _ => return Err("unsupported nbformat version".to_string()),
    };
    Ok((notebook, repaired))
}

/// Serialize a notebook with the reference writer: one-space indent, sorted
/// keys, trailing newline.
pub fn serialize_notebook(notebook: &Notebook) -> Result<String, String> {
    let notebook = nbformat::Notebook::V4(notebook.clone());
    nbformat::serialize_notebook(&notebook).map_err(|e| e.to_string())
}
