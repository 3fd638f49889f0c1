//! Directory cache backed by a remote object store.
//!
//! A directory is archived into a single gzip-compressed tar stream and
//! uploaded under a key; a later run restores the freshest of several
//! candidate keys back into a directory.

pub mod archive;
pub mod cacher;
pub mod compression;
pub mod keys;
pub mod store;
pub mod types;

pub use cacher::Cacher;
pub use keys::{expand_key, hash_files, hash_glob};
pub use store::{
    FilesystemStore, GcsStore, MemoryStore, ObjectMetadata, ObjectReader, ObjectStore,
    ObjectWriter, WriteOptions,
};
pub use types::{RestoreResult, SaveResult};
