//! Defanging of control characters and invalid UTF-8.
//!
//! Raw records are sanitized as text before parsing, and decoded string
//! values are sanitized again after parsing because JSON escapes such as
//! `\u0000` decode back into control characters. Nothing is dropped: every
//! offending character is rewritten as the visible text `\uXXXX`.
//! Sanitizing sanitized output is a no-op.

use std::borrow::Cow;
use std::fmt::Write;

use serde_json::{Map, Value};

/// Result of sanitizing one raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    /// True if decoding or escaping changed the content.
    pub altered: bool,
}

/// C0 controls, DEL and C1 controls.
pub fn is_forbidden(ch: char) -> bool {
    matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}')
}

/// Characters allowed between JSON tokens.
fn is_structural_whitespace(ch: char) -> bool {
    matches!(ch, '\t' | '\n' | '\r')
}

fn push_code(out: &mut String, ch: char) {
    let _ = write!(out, "\\u{:04x}", u32::from(ch));
}

/// Sanitize raw record bytes as JSON text.
///
/// Inside string literals a forbidden character becomes the JSON text
/// `\\uXXXX`, which decodes to the visible six characters `\uXXXX`.
/// Outside string literals tab, newline and carriage return are kept as
/// token separators; any other forbidden character becomes the visible text
/// `\uXXXX`, which leaves the record unparsable so it is quarantined intact.
pub fn sanitize(raw: &[u8]) -> Sanitized {
    let decoded = String::from_utf8_lossy(raw);
    let mut altered = matches!(decoded, Cow::Owned(_));

    if !decoded.chars().any(is_forbidden) {
        return Sanitized {
            text: decoded.into_owned(),
            altered,
        };
    }

    let mut out = String::with_capacity(decoded.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in decoded.chars() {
        if in_string {
            if escaped {
                escaped = false;
                if is_forbidden(ch) {
                    // Complete the dangling backslash as a literal one.
                    out.push('\\');
                    out.push('\\');
                    push_code(&mut out, ch);
                    altered = true;
                } else {
                    out.push(ch);
                }
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                c if is_forbidden(c) => {
                    out.push('\\');
                    push_code(&mut out, c);
                    altered = true;
                }
                c => out.push(c),
            }
        } else {
            match ch {
                '"' => {
                    in_string = true;
                    out.push(ch);
                }
                c if is_structural_whitespace(c) => out.push(c),
                c if is_forbidden(c) => {
                    push_code(&mut out, c);
                    altered = true;
                }
                c => out.push(c),
            }
        }
    }

    Sanitized {
        text: out,
        altered,
    }
}

/// Replace forbidden characters in a decoded string. Returns `None` if unchanged.
pub fn defang_str(value: &str) -> Option<String> {
    if !value.chars().any(is_forbidden) {
        return None;
    }
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        if is_forbidden(ch) {
            push_code(&mut out, ch);
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

/// Sanitize every string and object key in a parsed value.
///
/// Returns true if anything changed.
pub fn sanitize_value(value: &mut Value) -> bool {
    match value {
        Value::String(s) => match defang_str(s) {
            Some(clean) => {
                *s = clean;
                true
            }
            None => false,
        },
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| sanitize_value(item) | changed),
        Value::Object(map) => {
            let mut changed = false;
            if map.keys().any(|k| k.chars().any(is_forbidden)) {
                let old = std::mem::take(map);
                let mut rebuilt = Map::with_capacity(old.len());
                for (key, v) in old {
                    let key = defang_str(&key).unwrap_or(key);
                    rebuilt.insert(key, v);
                }
                *map = rebuilt;
                changed = true;
            }
            for v in map.values_mut() {
                changed |= sanitize_value(v);
            }
            changed
        }
        _ => false,
    }
}
