//! Structural edits on a notebook's cell list.
//!
//! These functions only touch the in-memory document; the manager handles
//! locking and persistence around them.

use log::warn;

use crate::document::{new_cell, new_cell_id, Cell, CellExt, CellId, CellType, Notebook, NotebookExt};
use crate::error::{NotebookError, Result};

/// Resolve a possibly negative insert position into `[0, len]`.
///
/// `-1` appends, `-2` inserts before the last cell, and so on.
pub fn resolve_position(len: usize, position: i64) -> usize {
    let len = len as i64;
    let resolved = if position < 0 {
        len + position + 1
    } else {
        position
    };
    resolved.clamp(0, len) as usize
}

/// Insert a new cell and return its id.
pub fn add_cell(
    notebook: &mut Notebook,
    content: &str,
    cell_type: CellType,
    position: i64,
    id: Option<&str>,
) -> String {
    let cell_id = match id.filter(|id| !id.is_empty()) {
        Some(id) if notebook.contains_cell(id) => {
            warn!("[editor] Cell id {} already in use, generating a new one", id);
            fresh_id(notebook)
        }
        Some(id) => CellId::new(id).unwrap_or_else(|_| {
            warn!("[editor] Cell id {:?} is not a valid id, generating a new one", id);
            fresh_id(notebook)
        }),
        None => fresh_id(notebook),
    };

    let index = resolve_position(notebook.cells.len(), position);
    let result = cell_id.to_string();
    notebook
        .cells
        .insert(index, new_cell(cell_type, cell_id, content));
    result
}

fn fresh_id(notebook: &Notebook) -> CellId {
    loop {
        let id = new_cell_id();
        if !notebook.contains_cell(id.as_str()) {
            return id;
        }
    }
}

/// Replace the source of a cell. Outputs and execution count are left as is.
pub fn edit_cell(notebook: &mut Notebook, cell_id: &str, content: &str) -> Result<()> {
    let index = locate(notebook, cell_id)?;
    notebook.cells[index].set_source(content);
    Ok(())
}

pub fn delete_cell(notebook: &mut Notebook, cell_id: &str) -> Result<Cell> {
    let index = locate(notebook, cell_id)?;
    Ok(notebook.cells.remove(index))
}

/// Index of the cell with `cell_id`.
pub fn locate(notebook: &Notebook, cell_id: &str) -> Result<usize> {
    notebook
        .find_cell_index(cell_id)
        .ok_or_else(|| NotebookError::CellNotFound(cell_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{empty_notebook, stream_output, OutputExt};

    fn three_cells() -> Notebook {
        let mut nb = empty_notebook();
        for id in ["a", "b", "c"] {
            let cell_id = CellId::new(id).unwrap();
            nb.cells.push(new_cell(CellType::Code, cell_id, id));
        }
        nb
    }

    fn ids(nb: &Notebook) -> Vec<&str> {
        nb.cells.iter().map(|c| c.id_str()).collect()
    }

    #[test]
    fn test_resolve_position() {
        assert_eq!(resolve_position(3, -1), 3);
        assert_eq!(resolve_position(3, -2), 2);
        assert_eq!(resolve_position(3, -10), 0);
        assert_eq!(resolve_position(3, 0), 0);
        assert_eq!(resolve_position(3, 99), 3);
        assert_eq!(resolve_position(0, -1), 0);
    }

    #[test]
    fn test_add_cell_positions() {
        let mut nb = three_cells();
        let appended = add_cell(&mut nb, "x", CellType::Code, -1, Some("d"));
        assert_eq!(appended, "d");
        assert_eq!(ids(&nb), vec!["a", "b", "c", "d"]);

        let mut nb = three_cells();
        add_cell(&mut nb, "x", CellType::Markdown, -2, Some("new"));
        assert_eq!(ids(&nb), vec!["a", "b", "new", "c"]);
        assert_eq!(nb.cells[2].cell_type(), CellType::Markdown);

        let mut nb = three_cells();
        add_cell(&mut nb, "x", CellType::Code, 0, Some("first"));
        assert_eq!(ids(&nb)[0], "first");
    }

    #[test]
    fn test_add_cell_replaces_colliding_id() {
        let mut nb = three_cells();
        let id = add_cell(&mut nb, "x", CellType::Code, -1, Some("a"));
        assert_ne!(id, "a");
        assert_eq!(nb.cells.len(), 4);
        assert_eq!(nb.cells[3].id_str(), id);

        let generated = add_cell(&mut nb, "y", CellType::Raw, -1, None);
        assert!(!generated.is_empty());
        assert_ne!(generated, id);

        let invalid = add_cell(&mut nb, "z", CellType::Raw, -1, Some("not valid!"));
        assert_ne!(invalid, "not valid!");
        assert!(CellId::new(&invalid).is_ok());
    }

    #[test]
    fn test_edit_keeps_outputs() {
        let mut nb = three_cells();
        nb.cells[1].set_execution(vec![stream_output("stdout", "old")], Some(4));

        edit_cell(&mut nb, "b", "new source").unwrap();
        assert_eq!(nb.cells[1].source_text(), "new source");
        assert_eq!(nb.cells[1].outputs().len(), 1);
        assert_eq!(nb.cells[1].outputs()[0].text(), "old");
        assert_eq!(nb.cells[1].execution_count(), Some(4));
        assert_eq!(ids(&nb), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_cell_errors() {
        let mut nb = three_cells();
        assert!(matches!(
            edit_cell(&mut nb, "zzz", "x"),
            Err(NotebookError::CellNotFound(_))
        ));
        assert!(matches!(
            delete_cell(&mut nb, "zzz"),
            Err(NotebookError::CellNotFound(_))
        ));
        assert_eq!(nb.cells.len(), 3);
    }

    #[test]
    fn test_delete_cell() {
        let mut nb = three_cells();
        let removed = delete_cell(&mut nb, "b").unwrap();
        assert_eq!(removed.id_str(), "b");
        assert_eq!(ids(&nb), vec!["a", "c"]);
        assert_eq!(locate(&nb, "c").unwrap(), 1);
    }
}
