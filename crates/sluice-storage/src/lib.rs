//! Sluice Storage - byte-addressable object stores.
//!
//! The proxy reads its configuration documents and root certificate material
//! through the [`Store`] trait. Two backends are provided:
//!
//! - [`FileStore`] - a directory on the local filesystem (read/write)
//! - [`ZipStore`] - a zip archive (read-only)
//!
//! Stores are usually opened from a URI:
//!
//! ```no_run
//! use sluice_storage::open_uri;
//!
//! let store = open_uri("file://./config").unwrap();
//! let main = store.get("main.json").unwrap();
//! ```

mod archive;
pub mod error;
mod file;
mod store;

pub use archive::ZipStore;
pub use error::{Result, StoreError};
pub use file::FileStore;
pub use store::{open, open_uri, read_json, ObjectInfo, Store};
