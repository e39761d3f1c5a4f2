//! Positional comparison of two notebooks.
//!
//! Cells are paired by index, not by id, so an insertion near the top shows up
//! as a change to every following cell.

use serde::Serialize;

use crate::document::{Cell, CellExt, CellType, Notebook, OutputExt};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "diff_type", rename_all = "snake_case")]
pub enum CellDiff {
    CellType {
        index: usize,
        a_type: CellType,
        b_type: CellType,
    },
    Content {
        index: usize,
        a_id: String,
        b_id: String,
    },
    Outputs {
        index: usize,
        a_id: String,
        b_id: String,
    },
    MissingCell {
        index: usize,
        in_a: bool,
        in_b: bool,
    },
}

impl CellDiff {
    pub fn index(&self) -> usize {
        match self {
            CellDiff::CellType { index, .. }
            | CellDiff::Content { index, .. }
            | CellDiff::Outputs { index, .. }
            | CellDiff::MissingCell { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotebookDiff {
    /// `len(a) - len(b)`
    pub cell_count_diff: i64,
    pub differences: Vec<CellDiff>,
    pub metadata_diff: bool,
}

impl NotebookDiff {
    pub fn is_empty(&self) -> bool {
        self.cell_count_diff == 0 && self.differences.is_empty() && !self.metadata_diff
    }
}

pub fn compare(a: &Notebook, b: &Notebook, include_outputs: bool) -> NotebookDiff {
    let longest = a.cells.len().max(b.cells.len());
    let mut differences = Vec::new();

    for index in 0..longest {
        match (a.cells.get(index), b.cells.get(index)) {
            (Some(cell_a), Some(cell_b)) => {
                compare_cells(index, cell_a, cell_b, include_outputs, &mut differences)
            }
            (cell_a, cell_b) => differences.push(CellDiff::MissingCell {
                index,
                in_a: cell_a.is_some(),
                in_b: cell_b.is_some(),
            }),
        }
    }

    NotebookDiff {
        cell_count_diff: a.cells.len() as i64 - b.cells.len() as i64,
        differences,
        metadata_diff: metadata_value(a) != metadata_value(b),
    }
}

fn metadata_value(notebook: &Notebook) -> serde_json::Value {
    serde_json::to_value(&notebook.metadata).unwrap_or_default()
}

fn compare_cells(
    index: usize,
    a: &Cell,
    b: &Cell,
    include_outputs: bool,
    differences: &mut Vec<CellDiff>,
) {
    if a.cell_type() != b.cell_type() {
        differences.push(CellDiff::CellType {
            index,
            a_type: a.cell_type(),
            b_type: b.cell_type(),
        });
    }

    if a.source() != b.source() {
        differences.push(CellDiff::Content {
            index,
            a_id: a.id_str().to_string(),
            b_id: b.id_str().to_string(),
        });
    }

    if include_outputs && a.is_code() && b.is_code() && output_texts(a) != output_texts(b) {
        differences.push(CellDiff::Outputs {
            index,
            a_id: a.id_str().to_string(),
            b_id: b.id_str().to_string(),
        });
    }
}

fn output_texts(cell: &Cell) -> Vec<String> {
    cell.outputs().iter().map(OutputExt::text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{empty_notebook, new_cell, stream_output, CellId};
    use serde_json::json;

    fn notebook(cells: &[(CellType, &str)]) -> Notebook {
        let mut nb = empty_notebook();
        for (i, (cell_type, source)) in cells.iter().enumerate() {
            let id = CellId::new(&format!("id-{}", i)).unwrap();
            nb.cells.push(new_cell(*cell_type, id, source));
        }
        nb
    }

    #[test]
    fn test_identical_notebooks() {
        let a = notebook(&[(CellType::Code, "1"), (CellType::Markdown, "# hi")]);
        let diff = compare(&a, &a.clone(), true);
        assert!(diff.is_empty());
        assert_eq!(diff.cell_count_diff, 0);
    }

    #[test]
    fn test_extra_cell_in_b() {
        let a = notebook(&[(CellType::Code, "1"), (CellType::Code, "2")]);
        let mut b = a.clone();
        b.cells
            .push(new_cell(CellType::Code, CellId::new("extra").unwrap(), "3"));

        let diff = compare(&a, &b, false);
        assert_eq!(diff.cell_count_diff, -1);
        assert_eq!(
            diff.differences,
            vec![CellDiff::MissingCell {
                index: 2,
                in_a: false,
                in_b: true
            }]
        );
    }

    #[test]
    fn test_type_and_content_changes() {
        let a = notebook(&[(CellType::Code, "x"), (CellType::Code, "same")]);
        let b = notebook(&[(CellType::Markdown, "y"), (CellType::Code, "same")]);

        let diff = compare(&a, &b, false);
        assert_eq!(diff.differences.len(), 2);
        assert!(matches!(
            diff.differences[0],
            CellDiff::CellType {
                index: 0,
                a_type: CellType::Code,
                b_type: CellType::Markdown
            }
        ));
        assert!(matches!(diff.differences[1], CellDiff::Content { index: 0, .. }));
    }

    #[test]
    fn test_outputs_only_when_requested() {
        let a = notebook(&[(CellType::Code, "print(1)")]);
        let mut b = a.clone();
        b.cells[0].set_execution(vec![stream_output("stdout", "1\n")], Some(1));

        assert!(compare(&a, &b, false).differences.is_empty());
        let diff = compare(&a, &b, true);
        assert_eq!(
            diff.differences,
            vec![CellDiff::Outputs {
                index: 0,
                a_id: "id-0".into(),
                b_id: "id-0".into()
            }]
        );
    }

    #[test]
    fn test_metadata_difference() {
        let a = notebook(&[]);
        let mut b = a.clone();
        b.metadata
            .additional
            .insert("title".into(), json!("other"));
        let diff = compare(&a, &b, false);
        assert!(diff.metadata_diff);
        assert!(diff.differences.is_empty());
    }

    #[test]
    fn test_diff_serializes_with_tag() {
        let diff = CellDiff::MissingCell {
            index: 1,
            in_a: true,
            in_b: false,
        };
        assert_eq!(
            serde_json::to_value(&diff).unwrap(),
            json!({"diff_type": "missing_cell", "index": 1, "in_a": true, "in_b": false})
        );
        assert_eq!(diff.index(), 1);
    }
}
