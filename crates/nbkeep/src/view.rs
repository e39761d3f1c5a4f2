//! Read-only projections of a notebook returned to callers, and the content
//! description accepted when replacing a notebook wholesale.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{plain_text, Cell, CellExt, CellType, Notebook, Output, OutputExt};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotebookView {
    pub notebook_path: String,
    pub cells: Vec<CellView>,
    pub metadata: MetadataView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataView {
    pub kernelspec: Value,
    pub language_info: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellView {
    pub id: String,
    #[serde(rename = "type")]
    pub cell_type: CellType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputView>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputView {
    Stream { text: String },
    Result { text: String },
    Display { text: String },
    Error { ename: String, evalue: String },
}

impl OutputView {
    /// Rich outputs without a `text/plain` entry have no view.
    pub fn from_output(output: &Output) -> Option<Self> {
        match output {
            Output::Stream { text, .. } => Some(OutputView::Stream {
                text: text.0.clone(),
            }),
            Output::ExecuteResult(result) => {
                plain_text(&result.data).map(|text| OutputView::Result { text })
            }
            Output::DisplayData(display) => {
                plain_text(&display.data).map(|text| OutputView::Display { text })
            }
            Output::Error(error) => Some(OutputView::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
            }),
        }
    }
}

impl CellView {
    pub fn from_cell(cell: &Cell, include_outputs: bool) -> Self {
        let outputs = (include_outputs && cell.is_code())
            .then(|| cell.outputs().iter().filter_map(OutputView::from_output).collect());
        CellView {
            id: cell.id_str().to_string(),
            cell_type: cell.cell_type(),
            content: cell.source_text(),
            outputs,
        }
    }
}

impl NotebookView {
    pub fn from_notebook(path: &str, notebook: &Notebook, include_outputs: bool) -> Self {
        NotebookView {
            notebook_path: path.to_string(),
            cells: notebook
                .cells
                .iter()
                .map(|cell| CellView::from_cell(cell, include_outputs))
                .collect(),
            metadata: MetadataView {
                kernelspec: section(&notebook.metadata.kernelspec),
                language_info: section(&notebook.metadata.language_info),
            },
        }
    }
}

/// A metadata section as JSON, `{}` when absent.
fn section<T: Serialize>(value: &Option<T>) -> Value {
    value
        .as_ref()
        .and_then(|value| serde_json::to_value(value).ok())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Processed outputs of one code cell, as listed for a whole notebook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellOutputs {
    pub cell_index: usize,
    pub cell_id: String,
    pub outputs: Vec<String>,
}

impl CellOutputs {
    pub fn from_cell(index: usize, cell: &Cell) -> Self {
        CellOutputs {
            cell_index: index,
            cell_id: cell.id_str().to_string(),
            outputs: cell.outputs().iter().map(OutputExt::text).collect(),
        }
    }
}

/// Replacement content for a notebook.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotebookContent {
    #[serde(default)]
    pub cells: Vec<CellContent>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CellContent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub cell_type: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{
        empty_notebook, error_output, new_cell, stream_output, with_kernelspec, CellId,
        KernelSpec,
    };
    use jupyter_protocol::media::{Media, MediaType};
    use nbformat::v4::DisplayData;
    use serde_json::json;

    fn notebook() -> Notebook {
        let mut nb = empty_notebook();
        let mut code = new_cell(CellType::Code, CellId::new("c1").unwrap(), "1 + 1");
        code.set_execution(
            vec![
                stream_output("stdout", "hi\n"),
                Output::DisplayData(DisplayData {
                    data: Media::new(vec![MediaType::Png("iVBOR".into())]),
                    metadata: Map::new(),
                }),
                error_output("NameError", "x", vec![]),
            ],
            Some(1),
        );
        nb.cells
            .push(new_cell(CellType::Markdown, CellId::new("m1").unwrap(), "# t"));
        nb.cells.push(code);
        nb
    }

    #[test]
    fn test_notebook_view_shape() {
        let view = NotebookView::from_notebook("a.ipynb", &notebook(), true);
        let value = serde_json::to_value(&view).unwrap();

        assert_eq!(value["notebook_path"], "a.ipynb");
        assert_eq!(value["cells"][0], json!({"id": "m1", "type": "markdown", "content": "# t"}));
        assert_eq!(
            value["cells"][1]["outputs"],
            json!([
                {"type": "stream", "text": "hi\n"},
                {"type": "error", "ename": "NameError", "evalue": "x"}
            ])
        );
        assert_eq!(value["metadata"], json!({"kernelspec": {}, "language_info": {}}));
    }

    #[test]
    fn test_outputs_omitted_when_not_requested() {
        let view = NotebookView::from_notebook("a.ipynb", &notebook(), false);
        assert!(view.cells.iter().all(|c| c.outputs.is_none()));
    }

    #[test]
    fn test_kernelspec_section() {
        let nb = with_kernelspec(&KernelSpec::from_name("python3"));
        let view = NotebookView::from_notebook("a.ipynb", &nb, false);
        assert_eq!(view.metadata.kernelspec["name"], "python3");
        assert_eq!(view.metadata.kernelspec["display_name"], "Python 3");
        assert_eq!(view.metadata.language_info, json!({}));
    }

    #[test]
    fn test_content_deserialize_defaults() {
        let content: NotebookContent = serde_json::from_value(json!({
            "cells": [{"content": "x = 1"}, {"id": "m", "type": "markdown"}]
        }))
        .unwrap();
        assert_eq!(content.cells[0].cell_type, None);
        assert_eq!(content.cells[1].id.as_deref(), Some("m"));
        assert_eq!(content.cells[1].content, "");
        assert!(content.metadata.is_empty());
    }
}
