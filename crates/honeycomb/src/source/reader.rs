//! Blocking source reading, bridged to the async pipeline by a bounded channel.
//!
//! Decompression and record extraction run on the blocking pool. Records are
//! handed over through `blocking_send`, so a slow committer (or an open
//! circuit breaker) stalls the reader instead of growing a buffer.

use std::fs::File;
use std::io::{self, BufRead, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use snafu::prelude::*;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{
    CursorBeyondEndSnafu, OpenSourceSnafu, PipelineError, ReadSourceSnafu, ReaderError,
    TaskJoinSnafu, UnknownFormatSnafu,
};

use super::compression::codec_for_path;
use super::detect::{Detection, detect};
use super::extract::{ExtractionMode, RawRecord, RecordExtractor};

/// Options for one read pass over a source.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Decompressed offset to resume from.
    pub start_offset: u64,
    /// Whether end of file ends the data (bulk) or may still grow (delta).
    pub final_input: bool,
    pub max_record_bytes: usize,
    pub channel_capacity: usize,
}

/// Items produced by a read task.
#[derive(Debug)]
pub enum ReadItem {
    Record(RawRecord),
    /// The reader reached the end of usable input.
    End { resume_offset: u64 },
}

/// Open a source and return a decompressed buffered stream.
pub fn open_decompressed(path: &Path) -> Result<Box<dyn BufRead + Send>, ReaderError> {
    let file = File::open(path).context(OpenSourceSnafu { path })?;
    codec_for_path(path)
        .create_reader(Box::new(file))
        .map_err(|e| ReaderError::Decompression {
            path: path.to_path_buf(),
            message: e.message,
        })
}

/// Read up to `max_lines` lines from the start of the decompressed source.
pub fn sample_lines(path: &Path, max_lines: usize) -> Result<Vec<Vec<u8>>, ReaderError> {
    let mut reader = open_decompressed(path)?;
    let mut lines = Vec::with_capacity(max_lines);
    while lines.len() < max_lines {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .context(ReadSourceSnafu { path })?;
        if n == 0 {
            break;
        }
        lines.push(line);
    }
    Ok(lines)
}

/// Read the first `len` decompressed bytes (fewer if the source is shorter).
pub fn head_bytes(path: &Path, len: u64) -> Result<Vec<u8>, ReaderError> {
    let reader = open_decompressed(path)?;
    let mut buf = Vec::new();
    reader
        .take(len)
        .read_to_end(&mut buf)
        .context(ReadSourceSnafu { path })?;
    Ok(buf)
}

/// Sample the source and classify it. `Unknown` is returned as an error.
pub async fn detect_format(path: PathBuf, sample: usize) -> Result<Detection, PipelineError> {
    let detection = tokio::task::spawn_blocking(move || {
        let lines = sample_lines(&path, sample)?;
        let detection = detect(&lines);
        debug!(
            source = %path.display(),
            format = detection.format.as_str(),
            sampled = detection.sampled,
            parsed = detection.parsed_lines,
            "Detected source format"
        );
        ensure!(
            detection.format.extraction_mode().is_some(),
            UnknownFormatSnafu { path: &path }
        );
        Ok::<_, ReaderError>(detection)
    })
    .await
    .context(TaskJoinSnafu)??;
    Ok(detection)
}

fn read_records<F>(
    path: &Path,
    mode: ExtractionMode,
    options: &ReadOptions,
    emit: &mut F,
) -> Result<ControlFlow<(), u64>, ReaderError>
where
    F: FnMut(RawRecord) -> ControlFlow<()>,
{
    let mut reader = open_decompressed(path)?;

    if options.start_offset > 0 {
        let skipped = io::copy(&mut (&mut reader).take(options.start_offset), &mut io::sink())
            .context(ReadSourceSnafu { path })?;
        ensure!(
            skipped == options.start_offset,
            CursorBeyondEndSnafu {
                path,
                cursor: options.start_offset,
                len: skipped,
            }
        );
    }

    let mut extractor = RecordExtractor::new(mode, options.max_record_bytes, options.start_offset);
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .context(ReadSourceSnafu { path })?;
        if n == 0 {
            break;
        }
        if !options.final_input && !line.ends_with(b"\n") {
            // The writer may still be appending to this line.
            break;
        }
        if extractor.push_line(&line, emit).is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }

    Ok(extractor.finish(options.final_input, emit))
}

/// Spawn a blocking reader that streams records into a bounded channel.
///
/// The receiver is returned immediately. Dropping it stops the reader at
/// the next record.
pub fn spawn_read_task(
    path: PathBuf,
    mode: ExtractionMode,
    options: ReadOptions,
) -> mpsc::Receiver<Result<ReadItem, ReaderError>> {
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

    tokio::task::spawn_blocking(move || {
        let mut emit = |record: RawRecord| match tx.blocking_send(Ok(ReadItem::Record(record))) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()), // receiver dropped
        };

        match read_records(&path, mode, &options, &mut emit) {
            Ok(ControlFlow::Continue(resume_offset)) => {
                let _ = tx.blocking_send(Ok(ReadItem::End { resume_offset }));
            }
            Ok(ControlFlow::Break(())) => {}
            Err(e) => {
                // Receiver may already be gone.
                let _ = tx.blocking_send(Err(e));
            }
        }
    });

    rx
}
