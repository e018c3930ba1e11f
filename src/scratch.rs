//! Per-task scratch directories.
//!
//! Layout: `<root>/<task_id>/<file>`. Each task exclusively owns its
//! subtree; file names are a contract between pipeline stages:
//! - `input.jpg`: downloaded source image
//! - `classification.json`: classifier output
//! - `output.jpg`: inference output
//! - `result.jpg`: encoded final result

use std::path::{Component, Path, PathBuf};

use tokio::fs;

use crate::error::ScratchError;

/// Well-known stage file names.
pub mod files {
    pub const INPUT: &str = "input.jpg";
    pub const CLASSIFICATION: &str = "classification.json";
    pub const OUTPUT: &str = "output.jpg";
    pub const RESULT: &str = "result.jpg";
}

/// File-backed scratch space rooted at a shared directory.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    /// Create a store rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a task's directory, without creating it.
    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf, ScratchError> {
        validate_relative(task_id, true)?;
        Ok(self.root.join(task_id))
    }

    /// Create the task directory if absent and return its path.
    pub async fn ensure_dir(&self, task_id: &str) -> Result<PathBuf, ScratchError> {
        let dir = self.task_dir(task_id)?;
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Path of a file inside the task directory. Creates the task directory.
    pub async fn file_path(&self, task_id: &str, name: &str) -> Result<PathBuf, ScratchError> {
        validate_relative(name, false)?;
        Ok(self.ensure_dir(task_id).await?.join(name))
    }

    /// Write a file, creating nested directories as needed.
    pub async fn save(&self, task_id: &str, name: &str, data: &[u8]) -> Result<PathBuf, ScratchError> {
        let path = self.file_path(task_id, name).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Read a file back.
    pub async fn load(&self, task_id: &str, name: &str) -> Result<Vec<u8>, ScratchError> {
        validate_relative(name, false)?;
        let path = self.task_dir(task_id)?.join(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScratchError::NotFound(format!("{task_id}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively delete the task directory. Missing directories are a no-op.
    pub async fn purge(&self, task_id: &str) -> Result<(), ScratchError> {
        let dir = self.task_dir(task_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(task_id = %task_id, path = %dir.display(), "Purged scratch directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject anything that could resolve outside the task subtree.
fn validate_relative(path: &str, single_component: bool) -> Result<(), ScratchError> {
    let invalid = || ScratchError::InvalidPath(path.to_string());
    if path.is_empty() {
        return Err(invalid());
    }
    let mut count = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => count += 1,
            _ => return Err(invalid()),
        }
    }
    if single_component && count != 1 {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ScratchStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(tmp.path().join("tasks"));
        (tmp, store)
    }

    #[tokio::test]
    async fn ensure_dir_is_idempotent() {
        let (_tmp, store) = store();
        let first = store.ensure_dir("task-1").await.unwrap();
        let second = store.ensure_dir("task-1").await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[tokio::test]
    async fn save_and_load() {
        let (_tmp, store) = store();
        store.save("task-1", files::INPUT, b"jpeg bytes").await.unwrap();
        let data = store.load("task-1", files::INPUT).await.unwrap();
        assert_eq!(data, b"jpeg bytes");
    }

    #[tokio::test]
    async fn load_missing_file() {
        let (_tmp, store) = store();
        let err = store.load("task-1", "nope.bin").await.unwrap_err();
        assert!(matches!(err, ScratchError::NotFound(_)));
    }

    #[tokio::test]
    async fn purge_removes_nested_files() {
        let (_tmp, store) = store();
        store.save("task-1", "file1.txt", b"data1").await.unwrap();
        store.save("task-1", "file2.txt", b"data2").await.unwrap();
        store.save("task-1", "subdir/file3.txt", b"data3").await.unwrap();

        let dir = store.task_dir("task-1").unwrap();
        assert!(dir.join("subdir/file3.txt").exists());

        store.purge("task-1").await.unwrap();
        assert!(!dir.exists());

        // Second purge is a no-op.
        store.purge("task-1").await.unwrap();
    }

    #[tokio::test]
    async fn purge_missing_is_ok() {
        let (_tmp, store) = store();
        store.purge("never-created").await.unwrap();
    }

    #[tokio::test]
    async fn tasks_are_isolated() {
        let (_tmp, store) = store();
        store.save("task-a", "data.bin", b"a").await.unwrap();
        store.save("task-b", "data.bin", b"b").await.unwrap();

        store.purge("task-a").await.unwrap();

        assert_eq!(store.load("task-b", "data.bin").await.unwrap(), b"b");
        assert!(store.load("task-a", "data.bin").await.is_err());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.save("task-1", "../other/file", b"x").await,
            Err(ScratchError::InvalidPath(_))
        ));
        assert!(matches!(
            store.ensure_dir("..").await,
            Err(ScratchError::InvalidPath(_))
        ));
        assert!(matches!(
            store.ensure_dir("a/b").await,
            Err(ScratchError::InvalidPath(_))
        ));
        assert!(matches!(
            store.load("task-1", "/etc/passwd").await,
            Err(ScratchError::InvalidPath(_))
        ));
    }
}
