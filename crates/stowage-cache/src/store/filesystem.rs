//! Filesystem-backed object store for local development and shared volumes.

use super::{ObjectMetadata, ObjectReader, ObjectStore, ObjectWriter, WriteOptions, key_segments};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use stowage_core::{Error, Result};
use tempfile::NamedTempFile;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Directory under each location holding uploads that are not yet published.
const STAGING_DIR: &str = ".stowage-tmp";

/// Stores each object as a file at `root/<location>/<key>`.
///
/// Uploads are staged in a temporary file and renamed into place on finish,
/// so readers never observe a partially written object.
pub struct FilesystemStore {
    root_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn location_dir(&self, location: &str) -> Result<PathBuf> {
        if location.is_empty() || location.contains(['/', '\\']) || location == "." || location == ".."
        {
            return Err(Error::InvalidRequest(format!(
                "invalid store location {:?}",
                location
            )));
        }
        Ok(self.root_dir.join(location))
    }

    fn key_path(&self, location: &str, key: &str) -> Result<PathBuf> {
        let segments = key_segments(key)?;
        if segments[0] == STAGING_DIR {
            return Err(Error::InvalidRequest(format!("reserved object key {:?}", key)));
        }
        let mut path = self.location_dir(location)?;
        path.extend(segments);
        Ok(path)
    }
}

impl Default for FilesystemStore {
    fn default() -> Self {
        Self::new(PathBuf::from("/var/cache/stowage"))
    }
}

fn store_error(action: &str, path: &Path, err: io::Error) -> Error {
    Error::Store(format!("failed to {} {}: {}", action, path.display(), err))
}

fn modified_at(metadata: &fs::Metadata, path: &Path) -> Result<DateTime<Utc>> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .map_err(|e| store_error("read modification time of", path, e))
}

impl ObjectStore for FilesystemStore {
    fn open_writer(
        &self,
        location: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>> {
        let target = self.key_path(location, key)?;
        let staging = self.location_dir(location)?.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|e| store_error("create", &staging, e))?;

        let temp = NamedTempFile::new_in(&staging)
            .map_err(|e| store_error("create upload file in", &staging, e))?;
        debug!(
            target = %target.display(),
            content_type = %options.content_type,
            "Opened filesystem upload"
        );

        Ok(Box::new(FilesystemWriter {
            file: BufWriter::new(temp),
            target,
        }))
    }

    fn open_reader(&self, location: &str, key: &str) -> Result<Box<dyn ObjectReader>> {
        let path = self.key_path(location, key)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(FilesystemReader {
                file: BufReader::new(file),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::not_found(location, key)),
            Err(e) => Err(store_error("open", &path, e)),
        }
    }

    fn metadata(&self, location: &str, key: &str) -> Result<ObjectMetadata> {
        let path = self.key_path(location, key)?;
        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(Error::not_found(location, key)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(location, key));
            }
            Err(e) => return Err(store_error("stat", &path, e)),
        };

        Ok(ObjectMetadata {
            key: key.to_string(),
            last_modified: modified_at(&metadata, &path)?,
            size_bytes: metadata.len(),
            content_type: None,
        })
    }

    fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        let search_dir = self.location_dir(location)?;
        if !search_dir.exists() {
            return Ok(vec![]);
        }

        let mut entries = vec![];
        let walker = WalkDir::new(&search_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != STAGING_DIR);

        for entry in walker {
            let entry = entry.map_err(|e| Error::Store(format!("failed to list objects: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&search_dir) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| Error::Store(format!("failed to read metadata: {}", e)))?;
            entries.push(ObjectMetadata {
                key,
                last_modified: modified_at(&metadata, entry.path())?,
                size_bytes: metadata.len(),
                content_type: None,
            });
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

struct FilesystemWriter {
    file: BufWriter<NamedTempFile>,
    target: PathBuf,
}

impl Write for FilesystemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ObjectWriter for FilesystemWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        let FilesystemWriter { file, target } = *self;
        let temp = file
            .into_inner()
            .map_err(|e| store_error("flush upload for", &target, e.into_error()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| store_error("sync upload for", &target, e))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| store_error("create", parent, e))?;
        }
        temp.persist(&target)
            .map_err(|e| store_error("publish", &target, e.error))?;
        debug!(target = %target.display(), "Published object");
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        let FilesystemWriter { file, target } = *self;
        let (temp, _) = file.into_parts();
        temp.close()
            .map_err(|e| store_error("discard upload for", &target, e))?;
        trace!(target = %target.display(), "Discarded upload");
        Ok(())
    }
}

struct FilesystemReader {
    file: BufReader<File>,
}

impl Read for FilesystemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ObjectReader for FilesystemReader {
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
