//! Directory-backed object store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::store::{check_name, ObjectInfo, Store};

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }
}

fn not_found(name: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
        _ => StoreError::Io(e),
    }
}

impl Store for FileStore {
    fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.path_of(name)?).map_err(not_found(name))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        tracing::debug!("Stored {} ({} bytes) in {}", name, data.len(), self.url());
        Ok(())
    }

    fn head(&self, name: &str) -> Result<ObjectInfo> {
        let meta = fs::metadata(self.path_of(name)?).map_err(not_found(name))?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(ObjectInfo {
            size: meta.len(),
            last_modified,
        })
    }

    fn delete(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path_of(name)?).map_err(not_found(name))
    }
}
