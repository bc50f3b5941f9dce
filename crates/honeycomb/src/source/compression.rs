//! Compression codecs for source files.
//!
//! Cowrie rotates its JSON log daily and operators commonly compress the
//! rotated files. The codec is picked from the file extension.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Error type for decompression setup.
#[derive(Debug)]
pub struct DecompressionError {
    pub message: String,
}

impl std::fmt::Display for DecompressionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DecompressionError {}

impl From<std::io::Error> for DecompressionError {
    fn from(e: std::io::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// A codec that turns a raw byte stream into a decompressed buffered stream.
///
/// Offsets reported by the record extractor are positions in the
/// decompressed stream, so resuming a compressed source means skipping that
/// many decompressed bytes.
pub trait CompressionCodec: Send + Sync {
    fn create_reader(
        &self,
        input: Box<dyn Read + Send>,
    ) -> Result<Box<dyn BufRead + Send>, DecompressionError>;

    fn name(&self) -> &'static str;
}

/// Gzip via flate2. Concatenated members are read as one stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

impl CompressionCodec for GzipCodec {
    fn create_reader(
        &self,
        input: Box<dyn Read + Send>,
    ) -> Result<Box<dyn BufRead + Send>, DecompressionError> {
        Ok(Box::new(BufReader::new(flate2::read::MultiGzDecoder::new(
            input,
        ))))
    }

    fn name(&self) -> &'static str {
        "gzip"
    }
}

/// Zstandard via zstd.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCodec;

impl CompressionCodec for ZstdCodec {
    fn create_reader(
        &self,
        input: Box<dyn Read + Send>,
    ) -> Result<Box<dyn BufRead + Send>, DecompressionError> {
        let decoder = zstd::stream::Decoder::new(input).map_err(|e| DecompressionError {
            message: format!("Failed to create zstd decoder: {e}"),
        })?;
        Ok(Box::new(BufReader::new(decoder)))
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}

/// Plain files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCodec;

impl CompressionCodec for NoopCodec {
    fn create_reader(
        &self,
        input: Box<dyn Read + Send>,
    ) -> Result<Box<dyn BufRead + Send>, DecompressionError> {
        Ok(Box::new(BufReader::new(input)))
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Pick a codec by extension (`.gz`, `.zst`/`.zstd`, anything else is plain).
pub fn codec_for_path(path: &Path) -> &'static dyn CompressionCodec {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") => &GzipCodec,
        Some("zst" | "zstd") => &ZstdCodec,
        _ => &NoopCodec,
    }
}
