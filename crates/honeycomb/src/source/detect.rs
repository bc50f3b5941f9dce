//! Source format detection from a sample of leading lines.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sanitize::sanitize;

use super::extract::{ExtractionMode, RawRecord, RecordExtractor};

/// Share of sampled lines that must parse on their own for `LineJson`.
pub const LINE_JSON_THRESHOLD: f64 = 0.9;

/// Default number of lines sampled.
pub const DEFAULT_SAMPLE_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    LineJson,
    MultilineJson,
    Hybrid,
    Unknown,
}

impl SourceFormat {
    /// How records are extracted, or `None` when nothing can be extracted.
    pub fn extraction_mode(&self) -> Option<ExtractionMode> {
        match self {
            SourceFormat::LineJson => Some(ExtractionMode::Line),
            SourceFormat::MultilineJson => Some(ExtractionMode::Accumulate),
            SourceFormat::Hybrid => Some(ExtractionMode::Adaptive),
            SourceFormat::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::LineJson => "line_json",
            SourceFormat::MultilineJson => "multiline_json",
            SourceFormat::Hybrid => "hybrid",
            SourceFormat::Unknown => "unknown",
        }
    }
}

/// Outcome of sampling a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub format: SourceFormat,
    /// Non-blank lines examined.
    pub sampled: usize,
    /// Lines that parsed as JSON on their own.
    pub parsed_lines: usize,
}

fn parses_as_document(bytes: &[u8]) -> bool {
    let text = sanitize(bytes).text;
    matches!(
        serde_json::from_str::<Value>(&text),
        Ok(Value::Object(_) | Value::Array(_))
    )
}

/// Classify a sample of lines (each may include its newline).
///
/// 1. At least 90% of non-blank lines parse alone: `LineJson`.
/// 2. The whole sample parses as one document: `MultilineJson`.
/// 3. Reassemble objects by brace balance. Only multi-line objects and no
///    junk: `MultilineJson`. Any recoverable object otherwise: `Hybrid`.
///    Nothing recoverable: `Unknown`.
///
/// An empty sample is `LineJson`: there is nothing to extract yet, and a
/// log that has not been written to is not an error.
pub fn detect<L: AsRef<[u8]>>(lines: &[L]) -> Detection {
    let non_blank: Vec<&[u8]> = lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        .collect();

    let sampled = non_blank.len();
    if sampled == 0 {
        return Detection {
            format: SourceFormat::LineJson,
            sampled,
            parsed_lines: 0,
        };
    }

    let parsed_lines = non_blank.iter().filter(|l| parses_as_document(l)).count();
    let detection = |format| Detection {
        format,
        sampled,
        parsed_lines,
    };

    if parsed_lines as f64 / sampled as f64 >= LINE_JSON_THRESHOLD {
        return detection(SourceFormat::LineJson);
    }

    let whole: Vec<u8> = lines.iter().flat_map(|l| l.as_ref().iter().copied()).collect();
    if parses_as_document(&whole) {
        return detection(SourceFormat::MultilineJson);
    }

    let mut single = 0usize;
    let mut multi = 0usize;
    let mut junk = 0usize;
    let mut extractor = RecordExtractor::new(ExtractionMode::Accumulate, usize::MAX, 0);
    let mut classify = |record: RawRecord, spanned: u64| {
        if record.bytes.starts_with(b"{") && parses_as_document(&record.bytes) {
            if spanned > 1 {
                multi += 1;
            } else {
                single += 1;
            }
        } else {
            junk += 1;
        }
    };

    for line in lines {
        let spanned_before = extractor.pending_lines();
        let mut emitted = Vec::new();
        let _ = extractor.push_line(line.as_ref(), &mut |r| {
            emitted.push(r);
            ControlFlow::Continue(())
        });
        for record in emitted {
            // An object that closes on this line spanned its pending lines plus this one.
            let spanned = if spanned_before > 0 { spanned_before + 1 } else { 1 };
            classify(record, spanned);
        }
    }

    let open_object = extractor.has_pending();
    let format = match (single, multi, junk) {
        (0, 0, _) if open_object && junk == 0 => SourceFormat::MultilineJson,
        (0, m, 0) if m > 0 => SourceFormat::MultilineJson,
        (0, 0, _) => SourceFormat::Unknown,
        _ => SourceFormat::Hybrid,
    };
    detection(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(input: &str) -> Vec<&str> {
        input.split_inclusive('\n').collect()
    }

    #[test]
    fn test_line_json() {
        let input = "{\"eventid\":\"a\"}\n{\"eventid\":\"b\"}\n";
        let detection = detect(&lines(input));
        assert_eq!(detection.format, SourceFormat::LineJson);
        assert_eq!(detection.parsed_lines, 2);
    }

    #[test]
    fn test_line_json_tolerates_a_few_bad_lines() {
        let mut input = String::new();
        for i in 0..19 {
            input.push_str(&format!("{{\"eventid\":\"e{i}\"}}\n"));
        }
        input.push_str("{\"eventid\":\"trunc\n");
        assert_eq!(detect(&lines(&input)).format, SourceFormat::LineJson);
    }

    #[test]
    fn test_raw_control_chars_do_not_break_line_detection() {
        let input = "{\"password\":\"a\u{0}b\"}\n{\"password\":\"c\"}\n";
        assert_eq!(detect(&lines(input)).format, SourceFormat::LineJson);
    }

    #[test]
    fn test_whole_document() {
        let input = "[\n  {\n    \"eventid\": \"a\"\n  }\n]\n";
        assert_eq!(detect(&lines(input)).format, SourceFormat::MultilineJson);
    }

    #[test]
    fn test_truncated_sample_of_pretty_objects() {
        let input = "{\n  \"eventid\": \"a\"\n}\n{\n  \"eventid\": \"b\",\n";
        assert_eq!(detect(&lines(input)).format, SourceFormat::MultilineJson);
    }

    #[test]
    fn test_mixed_is_hybrid() {
        let input = "{\"eventid\":\"a\"}\n{\n  \"eventid\": \"b\"\n}\n";
        assert_eq!(detect(&lines(input)).format, SourceFormat::Hybrid);
    }

    #[test]
    fn test_plain_text_is_unknown() {
        let input = "2024-05-01 12:00:00 New connection\nlogin attempt root/admin\n";
        let detection = detect(&lines(input));
        assert_eq!(detection.format, SourceFormat::Unknown);
        assert!(detection.format.extraction_mode().is_none());
    }

    #[test]
    fn test_empty_sample_is_line_json() {
        let detection = detect::<&str>(&[]);
        assert_eq!(detection.format, SourceFormat::LineJson);
        assert_eq!(detection.sampled, 0);
    }
}
