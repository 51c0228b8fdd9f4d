//! The [`Store`] trait and store URI handling.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::archive::ZipStore;
use crate::error::{Result, StoreError};
use crate::file::FileStore;

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
}

/// A byte-addressable object store.
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Returns the URI this store was opened from.
    fn url(&self) -> String;

    /// Reads an object fully.
    fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Writes an object, replacing any existing content.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Returns object metadata without reading the content.
    fn head(&self, name: &str) -> Result<ObjectInfo>;

    /// Removes an object.
    fn delete(&self, name: &str) -> Result<()>;

    /// Checks whether an object exists.
    fn exists(&self, name: &str) -> bool {
        self.head(name).is_ok()
    }
}

/// Opens a store from a `driver://source` URI.
///
/// Supported drivers are `file` and `zip`.
pub fn open_uri(uri: &str) -> Result<Box<dyn Store>> {
    let (driver, source) = uri
        .split_once("://")
        .ok_or_else(|| StoreError::InvalidUri(uri.to_string()))?;
    open(driver, source)
}

/// Opens a store for the given driver and source path.
///
/// The source is glob-expanded first and the lexicographically last match is
/// used, so `bundle-*.zip` resolves to the newest versioned archive.
pub fn open(driver: &str, source: &str) -> Result<Box<dyn Store>> {
    let source = expand_pick(source);
    match driver {
        "file" => Ok(Box::new(FileStore::new(source)?)),
        "zip" => Ok(Box::new(ZipStore::new(source)?)),
        other => Err(StoreError::InvalidUri(format!(
            "unknown storage driver {other:?}"
        ))),
    }
}

fn expand_pick(source: &str) -> String {
    let mut matches: Vec<String> = match glob::glob(source) {
        Ok(paths) => paths
            .filter_map(|p| p.ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(_) => return source.to_string(),
    };

    matches.sort();
    matches.pop().unwrap_or_else(|| source.to_string())
}

/// Strips `//` line comments from a JSON document.
///
/// Only whole-line comments are recognised; a `//` inside a value is kept.
pub fn read_json(data: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(data);
    let mut out = Vec::with_capacity(data.len());
    for line in text.lines() {
        if !line.trim().starts_with("//") {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
    }
    out
}

/// Rejects object names that are absolute or climb out of the store root.
pub(crate) fn check_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let escapes = path.components().any(|c| {
        !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
    });
    if name.is_empty() || escapes {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
