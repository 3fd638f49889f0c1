//! Object store interface and backends.
//!
//! The pipelines only need four operations from a store: open a streaming
//! writer, open a streaming reader, fetch metadata for a key and list keys by
//! prefix. A writer publishes its object only when [`ObjectWriter::finish`]
//! succeeds; aborting or dropping it discards everything written so far.

mod filesystem;
mod gcs;
mod memory;

pub use filesystem::FilesystemStore;
pub use gcs::{DEFAULT_ENDPOINT, GcsStore};
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use stowage_core::Result;

/// Metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object key.
    pub key: String,
    /// When the object was last written.
    pub last_modified: DateTime<Utc>,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Declared content type, when the backend records one.
    pub content_type: Option<String>,
}

/// Attributes declared when opening a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub content_type: String,
    pub cache_control: String,
}

impl WriteOptions {
    pub fn new(content_type: impl Into<String>, cache_control: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            cache_control: cache_control.into(),
        }
    }
}

/// Trait for object storage backends.
pub trait ObjectStore: Send + Sync {
    /// Open a streaming writer for `key` in `location`.
    fn open_writer(
        &self,
        location: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>>;

    /// Open a streaming reader. Fails with `ObjectNotFound` for missing keys.
    fn open_reader(&self, location: &str, key: &str) -> Result<Box<dyn ObjectReader>>;

    /// Fetch metadata. Fails with `ObjectNotFound` for missing keys.
    fn metadata(&self, location: &str, key: &str) -> Result<ObjectMetadata>;

    /// List objects whose key starts with `prefix`, sorted by key.
    fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMetadata>>;
}

/// Streaming upload handle.
pub trait ObjectWriter: Write + Send {
    /// Complete the upload and publish the object.
    fn finish(self: Box<Self>) -> Result<()>;

    /// Discard the upload. Nothing written so far becomes visible.
    fn abort(self: Box<Self>) -> Result<()>;
}

/// Streaming download handle.
pub trait ObjectReader: Read + Send {
    /// Release the underlying connection or file.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Split a key into path segments, rejecting ones that could alias another key.
pub(crate) fn key_segments(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key.split('/').collect();
    if key.is_empty() || segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return Err(stowage_core::Error::InvalidRequest(format!(
            "invalid object key {:?}",
            key
        )));
    }
    Ok(segments)
}
