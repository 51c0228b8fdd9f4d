//! Zip-archive-backed object store (read-only).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{Result, StoreError};
use crate::store::{check_name, ObjectInfo, Store};

/// Reads objects out of a zip archive.
///
/// The archive is reopened per call; stores are consulted at startup only.
#[derive(Debug, Clone)]
pub struct ZipStore {
    path: PathBuf,
}

impl ZipStore {
    /// Opens the archive at `path`, validating that it is readable.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ZipArchive::new(File::open(&path)?)?;
        Ok(Self { path })
    }

    fn archive(&self) -> Result<ZipArchive<File>> {
        Ok(ZipArchive::new(File::open(&self.path)?)?)
    }
}

fn not_found(name: &str) -> impl FnOnce(ZipError) -> StoreError + '_ {
    move |e| match e {
        ZipError::FileNotFound => StoreError::NotFound(name.to_string()),
        other => StoreError::Zip(other),
    }
}

impl Store for ZipStore {
    fn url(&self) -> String {
        format!("zip://{}", self.path.display())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let mut archive = self.archive()?;
        let mut file = archive.by_name(name).map_err(not_found(name))?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn put(&self, _name: &str, _data: &[u8]) -> Result<()> {
        Err(StoreError::NotImplemented)
    }

    fn head(&self, name: &str) -> Result<ObjectInfo> {
        check_name(name)?;
        let mut archive = self.archive()?;
        let file = archive.by_name(name).map_err(not_found(name))?;
        let last_modified = file
            .last_modified()
            .and_then(|dt| {
                NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
                    .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
            })
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);
        Ok(ObjectInfo {
            size: file.size(),
            last_modified,
        })
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Err(StoreError::NotImplemented)
    }
}
