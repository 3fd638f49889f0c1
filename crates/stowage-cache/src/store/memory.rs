//! In-process object store.

use super::{ObjectMetadata, ObjectReader, ObjectStore, ObjectWriter, WriteOptions};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use stowage_core::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    last_modified: DateTime<Utc>,
    content_type: String,
    cache_control: String,
}

type Objects = BTreeMap<(String, String), StoredObject>;

/// Keeps objects in memory. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object directly with an explicit timestamp.
    pub fn insert(&self, location: &str, key: &str, data: Vec<u8>, last_modified: DateTime<Utc>) {
        self.objects().insert(
            (location.to_string(), key.to_string()),
            StoredObject {
                data: Arc::new(data),
                last_modified,
                content_type: String::new(),
                cache_control: String::new(),
            },
        );
    }

    /// Contents of an object, if present.
    pub fn get(&self, location: &str, key: &str) -> Option<Vec<u8>> {
        self.objects()
            .get(&(location.to_string(), key.to_string()))
            .map(|o| o.data.as_ref().clone())
    }

    /// Content type and cache-control hint recorded for an object.
    pub fn attributes(&self, location: &str, key: &str) -> Option<(String, String)> {
        self.objects()
            .get(&(location.to_string(), key.to_string()))
            .map(|o| (o.content_type.clone(), o.cache_control.clone()))
    }

    /// Overwrite the last-modified timestamp of an existing object.
    pub fn touch(&self, location: &str, key: &str, last_modified: DateTime<Utc>) -> bool {
        match self.objects().get_mut(&(location.to_string(), key.to_string())) {
            Some(object) => {
                object.last_modified = last_modified;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn open_writer(
        &self,
        location: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            location: location.to_string(),
            key: key.to_string(),
            options: options.clone(),
            buf: Vec::new(),
        }))
    }

    fn open_reader(&self, location: &str, key: &str) -> Result<Box<dyn ObjectReader>> {
        let object = self
            .objects()
            .get(&(location.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(location, key))?;
        Ok(Box::new(MemoryReader {
            data: object.data,
            pos: 0,
        }))
    }

    fn metadata(&self, location: &str, key: &str) -> Result<ObjectMetadata> {
        self.objects()
            .get(&(location.to_string(), key.to_string()))
            .map(|o| to_metadata(key, o))
            .ok_or_else(|| Error::not_found(location, key))
    }

    fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        Ok(self
            .objects()
            .iter()
            .filter(|((loc, key), _)| loc == location && key.starts_with(prefix))
            .map(|((_, key), o)| to_metadata(key, o))
            .collect())
    }
}

fn to_metadata(key: &str, object: &StoredObject) -> ObjectMetadata {
    ObjectMetadata {
        key: key.to_string(),
        last_modified: object.last_modified,
        size_bytes: object.data.len() as u64,
        content_type: Some(object.content_type.clone()).filter(|c| !c.is_empty()),
    }
}

struct MemoryWriter {
    store: MemoryStore,
    location: String,
    key: String,
    options: WriteOptions,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectWriter for MemoryWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        let MemoryWriter {
            store,
            location,
            key,
            options,
            buf,
        } = *self;
        store.objects().insert(
            (location, key),
            StoredObject {
                data: Arc::new(buf),
                last_modified: Utc::now(),
                content_type: options.content_type,
                cache_control: options.cache_control,
            },
        );
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&self.data[self.pos..]).read(buf)?;
        self.pos += n;
        Ok(n)
    }
}

impl ObjectReader for MemoryReader {
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
