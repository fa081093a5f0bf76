//! File deletion backends for `DELE`.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found")]
    NotFound,
    #[error("path escapes the store root")]
    OutsideRoot,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where `DELE` removes files from.
pub trait FileStore {
    fn delete(&mut self, name: &str) -> Result<(), StoreError>;
}

/// Files under a root directory. Names must be relative and may not
/// contain `..`.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let path = Path::new(name);
        let plain = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !plain || path.as_os_str().is_empty() {
            return Err(StoreError::OutsideRoot);
        }
        Ok(self.root.join(path))
    }
}

impl FileStore for DirStore {
    fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound,
            _ => StoreError::Io(e),
        })
    }
}

/// In-memory set of file names.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: HashSet<String>,
}

impl MemoryStore {
    pub fn with_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains(name)
    }
}

impl FileStore for MemoryStore {
    fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        if self.files.remove(name) {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }
}
