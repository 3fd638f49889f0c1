//! Save and restore pipelines.
//!
//! Save: walk → tar → gzip → object writer.
//! Restore: pick the freshest candidate → object reader → gunzip → untar.
//!
//! Each stage streams into the next, so memory use stays bounded by the stage
//! buffers regardless of archive size. Resources are closed in reverse order
//! of acquisition and close failures are folded into the outcome.

use crate::archive::{self, ArchiveStats};
use crate::compression::{self, CACHE_CONTROL, CONTENT_TYPE};
use crate::store::{ObjectMetadata, ObjectReader, ObjectStore, ObjectWriter, WriteOptions};
use crate::types::{RestoreResult, SaveResult};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use stowage_core::{Error, RestoreRequest, Result, SaveRequest, combine};
use tracing::{debug, info, warn};

/// Saves directories to, and restores them from, an object store.
#[derive(Clone)]
pub struct Cacher {
    store: Arc<dyn ObjectStore>,
}

impl Cacher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Archive `request.dir` and upload it under `request.key`.
    ///
    /// The object is published only if every stage succeeds; otherwise the
    /// upload is aborted and nothing becomes visible at the key.
    pub fn save(&self, request: &SaveRequest) -> Result<SaveResult> {
        request.validate()?;
        let start = Instant::now();
        info!(
            bucket = %request.location,
            key = %request.key,
            dir = %request.dir.display(),
            "Saving cache"
        );

        let options = WriteOptions::new(CONTENT_TYPE, CACHE_CONTROL);
        let mut writer = self
            .store
            .open_writer(&request.location, &request.key, &options)?;

        let body = write_archive(&request.dir, &mut writer);
        let close = if body.is_ok() {
            writer.finish()
        } else {
            writer.abort()
        };
        if let (Err(_), Err(err)) = (&body, &close) {
            warn!(key = %request.key, error = %err, "Failed to abort upload");
        }
        let stats = combine(body, "failed to close object writer", close)?;

        let result = SaveResult {
            key: request.key.clone(),
            entries: stats.entries,
            bytes: stats.bytes,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            key = %result.key,
            entries = result.entries,
            bytes = result.bytes,
            duration_ms = result.duration_ms,
            "Saved cache"
        );
        Ok(result)
    }

    /// Restore the freshest existing candidate key into `request.dir`.
    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreResult> {
        request.validate()?;
        let start = Instant::now();

        let matched = self.select_candidate(&request.location, &request.keys)?;
        info!(
            bucket = %request.location,
            key = %matched.key,
            dir = %request.dir.display(),
            "Restoring cache"
        );

        fs::create_dir_all(&request.dir)
            .map_err(|e| Error::io_at("make target directory", &request.dir, e))?;

        let mut reader = self.store.open_reader(&request.location, &matched.key)?;
        let body = read_archive(&mut reader, &request.dir);
        let stats = combine(body, "failed to close object reader", reader.close())?;

        let result = RestoreResult {
            exact_match: request.keys.first() == Some(&matched.key),
            matched_key: matched.key,
            last_modified: matched.last_modified,
            entries: stats.entries,
            bytes: stats.bytes,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            key = %result.matched_key,
            exact_match = result.exact_match,
            entries = result.entries,
            duration_ms = result.duration_ms,
            "Restored cache"
        );
        Ok(result)
    }

    /// Find the most recently written object among `keys`.
    ///
    /// Missing keys are skipped; any other lookup failure aborts. Among equal
    /// timestamps the key listed first wins.
    pub fn select_candidate(&self, location: &str, keys: &[String]) -> Result<ObjectMetadata> {
        let best = keys
            .iter()
            .try_fold(None::<ObjectMetadata>, |best, key| {
                match self.store.metadata(location, key) {
                    Ok(found) => {
                        debug!(key = %key, last_modified = %found.last_modified, "Found cached object");
                        Ok(Some(fresher(best, found)))
                    }
                    Err(err) if err.is_not_found() => {
                        debug!(key = %key, "No cached object");
                        Ok(best)
                    }
                    Err(err) => Err(err),
                }
            })?;

        best.ok_or_else(|| Error::CacheMiss(keys.to_vec()))
    }

    /// List cached objects whose key starts with `prefix`.
    pub fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        if location.is_empty() {
            return Err(Error::InvalidRequest("missing bucket".into()));
        }
        self.store.list(location, prefix)
    }
}

fn fresher(best: Option<ObjectMetadata>, candidate: ObjectMetadata) -> ObjectMetadata {
    match best {
        Some(best) if candidate.last_modified <= best.last_modified => best,
        _ => candidate,
    }
}

fn write_archive(dir: &Path, writer: &mut Box<dyn ObjectWriter>) -> Result<ArchiveStats> {
    let mut encoder = compression::compressor(writer);
    let stats = archive::encode(dir, &mut encoder)?;
    compression::finish_compressor(encoder)?;
    Ok(stats)
}

fn read_archive(reader: &mut Box<dyn ObjectReader>, dir: &Path) -> Result<ArchiveStats> {
    let mut decoder = compression::decompressor(reader);
    let stats = archive::decode(&mut decoder, dir)?;
    compression::finish_decompressor(decoder)?;
    Ok(stats)
}
