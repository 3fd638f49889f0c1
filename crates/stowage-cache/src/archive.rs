//! Tar codec between a directory tree and a linear stream of entries.
//!
//! Only regular files and directories are represented. Encoding walks the
//! tree lazily and streams file content straight from disk; decoding replays
//! entries in stream order, creating parent directories as it goes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use stowage_core::{Error, Result};
use tar::EntryType;
use tracing::{debug, trace};
use walkdir::WalkDir;

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Kind of filesystem object captured in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One filesystem object captured in (or read from) an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    /// Slash-separated path relative to the archive root.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
    /// Content length; zero for directories.
    pub size: u64,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
    /// Location on the local filesystem the entry is read from or written to.
    pub source: PathBuf,
}

/// Totals for one encode or decode pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Name of `path` inside an archive rooted at `root`.
///
/// The root prefix is stripped and the remaining components are joined with
/// `/`, whatever the host separator is.
pub fn archive_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::InvalidRequest(format!(
            "{} is not beneath {}",
            path.display(),
            root.display()
        ))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::io(
                        format!("failed to name {}", path.display()),
                        io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8"),
                    )
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "unexpected component in {}",
                    path.display()
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    Ok(parts.join("/"))
}

/// Lazy iterator over the regular files beneath a root, in lexical order.
pub struct Walk {
    root: PathBuf,
    inner: walkdir::IntoIter,
}

/// Walk `root` recursively, yielding one entry per regular file.
///
/// Symlinks, sockets, devices and other non-regular objects are skipped.
pub fn walk(root: &Path) -> Walk {
    Walk {
        root: root.to_path_buf(),
        inner: WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter(),
    }
}

impl Walk {
    fn file_entry(&self, dent: &walkdir::DirEntry) -> Result<Entry> {
        let path = archive_name(&self.root, dent.path())?;
        let metadata = dent.metadata().map_err(walk_error)?;
        Ok(Entry {
            kind: EntryKind::File,
            path,
            mode: file_mode(&metadata),
            size: metadata.len(),
            mtime: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs()),
            source: dent.path().to_path_buf(),
        })
    }
}

impl Iterator for Walk {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dent = match self.inner.next()? {
                Ok(dent) => dent,
                Err(err) => return Some(Err(walk_error(err))),
            };

            let file_type = dent.file_type();
            if file_type.is_file() {
                return Some(self.file_entry(&dent));
            }
            if !file_type.is_dir() {
                trace!(path = %dent.path().display(), "Skipping non-regular file");
            }
        }
    }
}

fn walk_error(err: walkdir::Error) -> Error {
    let context = match err.path() {
        Some(path) => format!("failed to walk {}", path.display()),
        None => "failed to walk files".to_string(),
    };
    Error::io(context, io::Error::from(err))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Serialize every regular file beneath `root` into `writer` as a tar stream.
pub fn encode<W: Write>(root: &Path, writer: W) -> Result<ArchiveStats> {
    let mut builder = tar::Builder::new(writer);
    let mut stats = ArchiveStats::default();

    for entry in walk(root) {
        let entry = entry?;
        append_file(&mut builder, &entry)?;
        trace!(path = %entry.path, size = entry.size, "Archived file");
        stats.entries += 1;
        stats.bytes += entry.size;
    }

    builder
        .into_inner()
        .map_err(|e| Error::io("failed to finish archive", e))?;

    debug!(
        root = %root.display(),
        entries = stats.entries,
        bytes = stats.bytes,
        "Encoded archive"
    );
    Ok(stats)
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, entry: &Entry) -> Result<()> {
    let file = File::open(&entry.source).map_err(|e| Error::io_at("open", &entry.source, e))?;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(entry.mode);
    header.set_size(entry.size);
    header.set_mtime(entry.mtime);

    builder
        .append_data(&mut header, &entry.path, ExactReader::new(file, entry.size))
        .map_err(|e| Error::io(format!("failed to archive {}", entry.source.display()), e))
}

/// Yields exactly `len` bytes or fails, so the header size always matches.
struct ExactReader<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Replay a tar stream into `dest`.
///
/// Directories are created with a default mode; regular files are created or
/// truncated with the recorded mode. Any other entry type is rejected.
pub fn decode<R: Read>(reader: R, dest: &Path) -> Result<ArchiveStats> {
    let mut archive = tar::Archive::new(reader);
    let mut stats = ArchiveStats::default();

    let entries = archive
        .entries()
        .map_err(|e| stream_error("failed to read archive", e))?;

    for item in entries {
        let mut item = item.map_err(|e| stream_error("failed to read header", e))?;
        let entry_type = item.header().entry_type();
        if entry_type.is_pax_global_extensions() {
            continue;
        }

        let entry = entry_from_header(&item, entry_type, dest)?;
        match entry.kind {
            EntryKind::Directory => create_dir(&entry.source)?,
            EntryKind::File => {
                let copied = write_file(&mut item, &entry)?;
                stats.bytes += copied;
            }
        }
        trace!(path = %entry.path, kind = ?entry.kind, "Restored entry");
        stats.entries += 1;
    }

    debug!(
        dest = %dest.display(),
        entries = stats.entries,
        bytes = stats.bytes,
        "Decoded archive"
    );
    Ok(stats)
}

fn entry_from_header<R: Read>(
    item: &tar::Entry<'_, R>,
    entry_type: EntryType,
    dest: &Path,
) -> Result<Entry> {
    let name = item
        .path()
        .map_err(|e| stream_error("invalid entry path", e))?
        .into_owned();
    let path = name.to_string_lossy().into_owned();

    let kind = match entry_type {
        EntryType::Directory => EntryKind::Directory,
        EntryType::Regular => EntryKind::File,
        other => {
            return Err(Error::UnsupportedEntry {
                path,
                kind: format!("{:?}", other),
            });
        }
    };

    let relative = contained_path(&name)?;
    if kind == EntryKind::File && relative.as_os_str().is_empty() {
        return Err(Error::CorruptArchive(format!(
            "file entry {:?} has no name",
            path
        )));
    }

    let header = item.header();
    Ok(Entry {
        kind,
        mode: header
            .mode()
            .map_err(|e| stream_error(&format!("invalid mode for {}", path), e))?,
        size: item.size(),
        mtime: header.mtime().unwrap_or(0),
        source: dest.join(relative),
        path,
    })
}

/// Reduce an entry name to a relative path that cannot leave the target.
fn contained_path(name: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::CorruptArchive(format!(
                    "entry path {} escapes the target directory",
                    name.display()
                )));
            }
        }
    }
    Ok(relative)
}

fn create_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DEFAULT_DIR_MODE);
    }
    builder
        .create(path)
        .map_err(|e| Error::io_at("create directory", path, e))
}

fn write_file<R: Read>(content: &mut R, entry: &Entry) -> Result<u64> {
    let target = &entry.source;
    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }

    let mut file = open_truncate(target, entry.mode)?;
    let copied = copy_content(content, &mut file, target)?;
    if copied != entry.size {
        return Err(Error::CorruptArchive(format!(
            "entry {} truncated: expected {} bytes, got {}",
            entry.path, entry.size, copied
        )));
    }
    file.flush().map_err(|e| Error::io_at("flush", target, e))?;
    set_mode(&file, target, entry.mode)?;
    Ok(copied)
}

fn open_truncate(target: &Path, mode: u32) -> Result<File> {
    // Never write through a link left in the target directory.
    if let Ok(meta) = fs::symlink_metadata(target) {
        if meta.file_type().is_symlink() {
            fs::remove_file(target).map_err(|e| Error::io_at("remove link", target, e))?;
        }
    }

    let open = || {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        options.open(target)
    };

    match open() {
        Ok(file) => Ok(file),
        // A read-only file from an earlier restore.
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied && target.is_file() => {
            fs::remove_file(target).map_err(|e| Error::io_at("replace", target, e))?;
            open().map_err(|e| Error::io_at("open", target, e))
        }
        Err(err) => Err(Error::io_at("open", target, err)),
    }
}

#[cfg(unix)]
fn set_mode(file: &File, target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io_at("set permissions on", target, e))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn copy_content<R: Read, W: Write>(src: &mut R, dst: &mut W, target: &Path) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(stream_error(
                    &format!("failed to read content for {}", target.display()),
                    e,
                ));
            }
        };
        dst.write_all(&buf[..n])
            .map_err(|e| Error::io_at("write", target, e))?;
        total += n as u64;
    }
}

/// Classify a failure reading the archive stream.
///
/// Transport failures surface as store errors; everything else the tar and
/// gzip layers report means the stream itself is malformed.
pub(crate) fn stream_error(context: &str, err: io::Error) -> Error {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionAborted | ConnectionReset | NotConnected | BrokenPipe | TimedOut => {
            Error::Store(format!("{}: {}", context, err))
        }
        PermissionDenied | NotFound | OutOfMemory | StorageFull => Error::io(context, err),
        _ => Error::CorruptArchive(format!("{}: {}", context, err)),
    }
}
