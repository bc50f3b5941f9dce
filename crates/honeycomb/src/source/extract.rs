//! Splitting a decompressed byte stream into raw record fragments.
//!
//! Three modes, chosen from the detected format:
//! - `Line`: every non-blank line is one record, except that a line opening
//!   an object it does not close is reassembled like `Adaptive`.
//! - `Accumulate`: objects are reassembled across lines by tracking brace
//!   depth outside string literals. Array brackets and commas between
//!   objects are skipped, so pretty-printed arrays of events work too.
//! - `Adaptive`: like `Accumulate`, but a pending object is abandoned as a
//!   malformed fragment when a following line is a complete event on its own.
//!
//! Nothing is discarded: junk between objects and abandoned fragments are
//! emitted as records so that validation quarantines them.

use std::ops::ControlFlow;

/// One fragment of input believed to hold a single JSON value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub bytes: Vec<u8>,
    /// Offset of the first byte in the decompressed stream.
    pub start: u64,
    /// Offset just past the record; resuming here yields the next record.
    pub end: u64,
    /// 1-based line number where the record starts.
    pub line: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Line,
    Accumulate,
    Adaptive,
}

/// Tracks object nesting outside of string literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
    opened: bool,
}

impl BraceScanner {
    /// Feed bytes until the outermost object closes.
    ///
    /// Returns the number of bytes consumed. Stops right after the closing
    /// brace so the caller can look at what follows.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        for (i, &b) in bytes.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' => {
                    self.depth += 1;
                    self.opened = true;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            }
        }
        bytes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.opened && self.depth == 0 && !self.in_string
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn is_separator(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b',' | b'[' | b']')
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// True if `line` alone is a complete JSON object carrying an event tag.
///
/// Used by adaptive mode to notice that a pending fragment was cut short.
pub fn is_standalone_event(line: &[u8]) -> bool {
    let trimmed = line.trim_ascii();
    let trimmed = trimmed.strip_suffix(b",").unwrap_or(trimmed);
    if !trimmed.starts_with(b"{") {
        return false;
    }
    let mut scanner = BraceScanner::default();
    if scanner.feed(trimmed) != trimmed.len() || !scanner.is_complete() {
        return false;
    }
    let sanitized = crate::sanitize::sanitize(trimmed);
    match serde_json::from_str::<serde_json::Value>(&sanitized.text) {
        Ok(serde_json::Value::Object(map)) => {
            map.contains_key("eventid") || map.contains_key("event_type")
        }
        _ => false,
    }
}

/// True if `line` starts an object whose closing brace is not on it.
fn opens_unfinished_object(line: &[u8]) -> bool {
    let trimmed = line.trim_ascii();
    if !trimmed.starts_with(b"{") {
        return false;
    }
    let mut scanner = BraceScanner::default();
    scanner.feed(trimmed) == trimmed.len() && !scanner.is_complete()
}

/// Incremental record extractor fed one line at a time.
#[derive(Debug)]
pub struct RecordExtractor {
    mode: ExtractionMode,
    max_record_bytes: usize,
    scanner: BraceScanner,
    pending: Vec<u8>,
    pending_start: u64,
    pending_line: u64,
    pending_lines: u64,
    /// Offset of the next unread byte.
    offset: u64,
    line_no: u64,
}

impl RecordExtractor {
    pub fn new(mode: ExtractionMode, max_record_bytes: usize, start_offset: u64) -> Self {
        Self {
            mode,
            max_record_bytes,
            scanner: BraceScanner::default(),
            pending: Vec::new(),
            pending_start: start_offset,
            pending_line: 0,
            pending_lines: 0,
            offset: start_offset,
            line_no: 0,
        }
    }

    pub fn mode(&self) -> ExtractionMode {
        self.mode
    }

    /// True while an object spans the lines read so far.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of lines the pending object has spanned.
    pub fn pending_lines(&self) -> u64 {
        self.pending_lines
    }

    /// Feed one line, including its trailing newline if any.
    pub fn push_line<F>(&mut self, line: &[u8], emit: &mut F) -> ControlFlow<()>
    where
        F: FnMut(RawRecord) -> ControlFlow<()>,
    {
        let line_start = self.offset;
        let line_end = line_start + line.len() as u64;
        self.offset = line_end;
        self.line_no += 1;

        match self.mode {
            ExtractionMode::Line => {
                if self.has_pending() {
                    if !is_standalone_event(line) {
                        return self.scan_line(line, line_start, line_end, emit);
                    }
                    self.flush_pending(line_start, emit)?;
                }
                if is_blank(line) {
                    return ControlFlow::Continue(());
                }
                if opens_unfinished_object(line) {
                    // A pretty-printed object inside a line-oriented log.
                    return self.scan_line(line, line_start, line_end, emit);
                }
                emit(RawRecord {
                    bytes: trim_newline(line).to_vec(),
                    start: line_start,
                    end: line_end,
                    line: self.line_no,
                })
            }
            ExtractionMode::Accumulate | ExtractionMode::Adaptive => {
                if self.mode == ExtractionMode::Adaptive
                    && self.has_pending()
                    && is_standalone_event(line)
                {
                    self.flush_pending(line_start, emit)?;
                }
                self.scan_line(line, line_start, line_end, emit)
            }
        }
    }

    fn scan_line<F>(&mut self, line: &[u8], line_start: u64, line_end: u64, emit: &mut F) -> ControlFlow<()>
    where
        F: FnMut(RawRecord) -> ControlFlow<()>,
    {
        let mut pos = 0;
        if self.has_pending() {
            self.pending_lines += 1;
        }

        while pos < line.len() {
            if !self.has_pending() {
                while pos < line.len() && is_separator(line[pos]) {
                    pos += 1;
                }
                if pos == line.len() {
                    break;
                }
                if line[pos] != b'{' {
                    // Junk outside any object becomes its own record.
                    return emit(RawRecord {
                        bytes: trim_newline(&line[pos..]).to_vec(),
                        start: line_start + pos as u64,
                        end: line_end,
                        line: self.line_no,
                    });
                }
                self.pending_start = line_start + pos as u64;
                self.pending_line = self.line_no;
                self.pending_lines = 1;
            }

            let consumed = self.scanner.feed(&line[pos..]);
            self.pending.extend_from_slice(&line[pos..pos + consumed]);
            pos += consumed;

            if self.scanner.is_complete() {
                let rest_is_separators = line[pos..].iter().all(|&b| is_separator(b));
                let end = if rest_is_separators {
                    line_end
                } else {
                    line_start + pos as u64
                };
                let record = self.take_pending(end);
                emit(record)?;
                if rest_is_separators {
                    break;
                }
            }
        }

        if self.pending.len() > self.max_record_bytes {
            // Runaway object: give up on it so one bad brace cannot swallow the file.
            let record = self.take_pending(line_end);
            return emit(record);
        }

        ControlFlow::Continue(())
    }

    fn take_pending(&mut self, end: u64) -> RawRecord {
        let bytes = std::mem::take(&mut self.pending);
        self.scanner.reset();
        let record = RawRecord {
            bytes: trim_newline(&bytes).to_vec(),
            start: self.pending_start,
            end,
            line: self.pending_line,
        };
        self.pending_start = end;
        self.pending_lines = 0;
        record
    }

    fn flush_pending<F>(&mut self, end: u64, emit: &mut F) -> ControlFlow<()>
    where
        F: FnMut(RawRecord) -> ControlFlow<()>,
    {
        if !self.has_pending() {
            return ControlFlow::Continue(());
        }
        let record = self.take_pending(end);
        emit(record)
    }

    /// Handle end of input.
    ///
    /// With `final_input` an unfinished object is emitted so it can be
    /// quarantined. Otherwise it is left unread and its start offset is
    /// returned as the resume position.
    pub fn finish<F>(mut self, final_input: bool, emit: &mut F) -> ControlFlow<(), u64>
    where
        F: FnMut(RawRecord) -> ControlFlow<()>,
    {
        if !self.has_pending() {
            return ControlFlow::Continue(self.offset);
        }
        if final_input {
            let end = self.offset;
            self.flush_pending(end, emit)?;
            ControlFlow::Continue(end)
        } else {
            ControlFlow::Continue(self.pending_start)
        }
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}
