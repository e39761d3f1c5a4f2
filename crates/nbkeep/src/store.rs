//! On-disk notebook persistence.
//!
//! Writes go to a temp file in the destination directory and are renamed into
//! place, so readers never observe a partially written notebook.

use std::io;
use std::path::Path;

use log::{debug, info, warn};

use crate::document::{parse_notebook, serialize_notebook, Notebook};
use crate::error::{NotebookError, Result};
use crate::history::History;

pub struct DocumentStore {
    history: History,
}

impl DocumentStore {
    pub fn new(history: History) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Read and parse the notebook at `path`.
    pub async fn load(&self, path: &Path) -> Result<Notebook> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(NotebookError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(NotebookError::io(path, e)),
        };

        let (notebook, repaired) =
            parse_notebook(&content).map_err(|reason| NotebookError::Corrupt {
                path: path.to_path_buf(),
                reason,
            })?;

        if repaired {
            info!("[store] Assigned missing or duplicate cell ids in {:?}", path);
        }
        Ok(notebook)
    }

    /// Persist atomically and record the result in history.
    pub async fn save(&self, notebook: &Notebook, path: &Path) -> Result<()> {
        self.write_atomic(notebook, path).await?;
        self.history.push(path, notebook);
        Ok(())
    }

    /// Persist atomically without touching history.
    pub async fn write_atomic(&self, notebook: &Notebook, path: &Path) -> Result<()> {
        let content = serialize_notebook(notebook)
            .map_err(|e| NotebookError::io(path, io::Error::new(io::ErrorKind::Other, e)))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| NotebookError::io(&dir, e))?;

        let tmp = dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        if let Err(e) = async {
            tokio::fs::write(&tmp, content.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await
        {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("[store] Failed to remove temp file {:?}: {}", tmp, cleanup);
                }
            }
            return Err(NotebookError::io(path, e));
        }

        debug!("[store] Wrote {:?} ({} bytes)", path, content.len());
        Ok(())
    }

    /// Rewrite the previous snapshot to disk and drop the latest one.
    pub async fn undo(&self, path: &Path) -> Result<()> {
        self.history
            .undo(path, |previous| async move {
                self.write_atomic(&previous, path).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{empty_notebook, new_cell, CellExt, CellId, CellType};
    use tempfile::TempDir;

    fn store() -> DocumentStore {
        DocumentStore::new(History::default())
    }

    fn notebook(sources: &[&str]) -> Notebook {
        let mut nb = empty_notebook();
        for (i, source) in sources.iter().enumerate() {
            let id = CellId::new(&format!("cell-{}", i)).unwrap();
            nb.cells.push(new_cell(CellType::Code, id, source));
        }
        nb
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store().load(&dir.path().join("nope.ipynb")).await.unwrap_err();
        assert!(matches!(err, NotebookError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ipynb");
        std::fs::write(&path, "{\"hello\": ").unwrap();
        let err = store().load(&path).await.unwrap_err();
        assert!(matches!(err, NotebookError::Corrupt { .. }));

        std::fs::write(&path, "{\"hello\": \"world\"}").unwrap();
        let err = store().load(&path).await.unwrap_err();
        assert!(matches!(err, NotebookError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_save_load_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nb.ipynb");
        let store = store();

        store.save(&notebook(&["x = 1\n", "print(x)"]), &path).await.unwrap();
        let first = store.load(&path).await.unwrap();
        let bytes = std::fs::read(&path).unwrap();

        store.save(&first, &path).await.unwrap();
        let second = store.load(&path).await.unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
        assert_eq!(bytes, std::fs::read(&path).unwrap());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("nb.ipynb");
        store().save(&notebook(&["1"]), &path).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["nb.ipynb".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_original() {
        let dir = TempDir::new().unwrap();
        // Renaming a file over a non-empty directory fails
        let path = dir.path().join("taken");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner"), "x").unwrap();
        let store = store();

        let err = store.save(&notebook(&["1"]), &path).await.unwrap_err();
        assert!(matches!(err, NotebookError::Io { .. }));
        assert_eq!(store.history().len(&path), 0);

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".tmp.")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_undo_restores_previous_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nb.ipynb");
        let store = store();

        store.save(&notebook(&["first"]), &path).await.unwrap();
        assert!(matches!(
            store.undo(&path).await.unwrap_err(),
            NotebookError::NoHistory(_)
        ));

        store.save(&notebook(&["second"]), &path).await.unwrap();
        store.undo(&path).await.unwrap();
        let restored = store.load(&path).await.unwrap();
        assert_eq!(restored.cells[0].source_text(), "first");
        assert_eq!(store.history().len(&path), 1);
    }

    #[tokio::test]
    async fn test_load_repairs_missing_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.ipynb");
        std::fs::write(
            &path,
            r#"{"cells": [{"cell_type": "markdown", "metadata": {}, "source": "hi"}],
                "metadata": {}, "nbformat": 4, "nbformat_minor": 2}"#,
        )
        .unwrap();

        let nb = store().load(&path).await.unwrap();
        assert_eq!(nb.cells[0].id_str(), "cell-0");
        assert_eq!(nb.nbformat_minor, 5);
    }

    #[tokio::test]
    async fn test_load_keeps_explicit_id_over_generated_one() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mixed.ipynb");
        std::fs::write(
            &path,
            r##"{"cells": [
                  {"cell_type": "markdown", "metadata": {}, "source": "# t"},
                  {"cell_type": "code", "id": "cell-0", "execution_count": null,
                   "metadata": {}, "outputs": [], "source": "x = 1"}],
                "metadata": {}, "nbformat": 4, "nbformat_minor": 5}"##,
        )
        .unwrap();

        let store = store();
        let first = store.load(&path).await.unwrap();
        let second = store.load(&path).await.unwrap();
        for nb in [&first, &second] {
            assert!(nb.cells[1].is_code());
            assert_eq!(nb.cells[1].id_str(), "cell-0");
            assert_ne!(nb.cells[0].id_str(), "cell-0");
        }
        assert_eq!(first.cells[0].id_str(), second.cells[0].id_str());
    }
}
