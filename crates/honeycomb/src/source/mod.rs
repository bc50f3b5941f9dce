//! Reading Cowrie log sources: decompression, format detection and record
//! extraction.

pub mod compression;
pub mod detect;
pub mod extract;
pub mod listing;
pub mod reader;

pub use detect::{Detection, SourceFormat, detect};
pub use extract::{ExtractionMode, RawRecord, RecordExtractor};
pub use listing::expand_sources;
pub use reader::{ReadItem, ReadOptions, detect_format, head_bytes, spawn_read_task};
