//! Gzip stage wrapped around the archive stream.

use crate::archive::stream_error;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use stowage_core::{Error, Result};

/// Content type declared on uploaded archives.
pub const CONTENT_TYPE: &str = "application/gzip";

/// Freshness hint for HTTP caches in front of the store.
pub const CACHE_CONTROL: &str = "public,max-age=3600";

/// Wrap `writer` in a gzip encoder at maximum compression.
pub fn compressor<W: Write>(writer: W) -> GzEncoder<W> {
    GzEncoder::new(writer, Compression::best())
}

/// Flush the final deflate block and the gzip trailer, returning the inner writer.
pub fn finish_compressor<W: Write>(encoder: GzEncoder<W>) -> Result<W> {
    encoder
        .finish()
        .map_err(|e| Error::io("failed to close gzip writer", e))
}

/// Wrap `reader` in a gzip decoder. Concatenated members are read as one stream.
pub fn decompressor<R: Read>(reader: R) -> MultiGzDecoder<R> {
    MultiGzDecoder::new(reader)
}

/// Consume whatever the archive reader left behind so the gzip trailer is verified.
pub fn finish_decompressor<R: Read>(mut decoder: MultiGzDecoder<R>) -> Result<R> {
    io::copy(&mut decoder, &mut io::sink())
        .map_err(|e| stream_error("failed to close gzip reader", e))?;
    Ok(decoder.into_inner())
}
