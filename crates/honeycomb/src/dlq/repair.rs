//! Best-effort repair of malformed JSON text.
//!
//! Handles the damage seen in honeypot logs: leading garbage before the
//! first brace, trailing commas, a string cut off mid-value and unbalanced
//! brackets. The result is only a candidate; it still has to validate.

/// Try to turn `raw` into parsable JSON. Returns `None` if nothing changed
/// or the result still does not parse.
pub fn repair_json(raw: &str) -> Option<String> {
    let start = raw.find(['{', '['])?;
    let body = raw[start..].trim_end();

    let mut out = String::with_capacity(body.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in body.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if stack.last() != Some(&ch) {
                    // Stray closer; everything after it is unreliable.
                    break;
                }
                drop_trailing_comma(&mut out);
                stack.pop();
                out.push(ch);
                if stack.is_empty() {
                    break;
                }
            }
            c => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    drop_dangling_member(&mut out);
    while let Some(closer) = stack.pop() {
        drop_trailing_comma(&mut out);
        out.push(closer);
    }

    if out == raw {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&out)
        .ok()
        .map(|_| out)
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end_matches(char::is_whitespace).len();
    out.truncate(trimmed);
    if out.ends_with(',') {
        out.pop();
    }
}

/// Remove a key with no value (`"k":` or a lone `"k"`) left at the end.
fn drop_dangling_member(out: &mut String) {
    let trimmed = out.trim_end_matches(char::is_whitespace).len();
    out.truncate(trimmed);
    if out.ends_with(':') {
        out.pop();
        let trimmed = out.trim_end_matches(char::is_whitespace).len();
        out.truncate(trimmed);
        strip_last_string(out);
    } else if ends_with_key(out) {
        strip_last_string(out);
    }
}

/// True if the string literal at the end of `out` directly follows `{` or `,`
/// inside an object, meaning it is a key without a value.
fn ends_with_key(out: &str) -> bool {
    let Some(open) = last_string_start(out) else {
        return false;
    };
    let before = out[..open].trim_end();
    before.ends_with('{') || (before.ends_with(',') && innermost_is_object(before))
}

fn strip_last_string(out: &mut String) {
    if let Some(open) = last_string_start(out) {
        out.truncate(open);
    }
}

/// Byte index of the opening quote of the string literal ending `out`.
fn last_string_start(out: &str) -> Option<usize> {
    if !out.ends_with('"') {
        return None;
    }
    let bytes = out.as_bytes();
    let mut i = bytes.len() - 1;
    while i > 0 {
        i -= 1;
        if bytes[i] == b'"' {
            let backslashes = bytes[..i].iter().rev().take_while(|&&b| b == b'\\').count();
            if backslashes % 2 == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn innermost_is_object(prefix: &str) -> bool {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in prefix.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => stack.push(ch),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    stack.last() == Some(&'{')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn repaired(raw: &str) -> Value {
        serde_json::from_str(&repair_json(raw).expect("repairable")).unwrap()
    }

    #[test]
    fn test_trailing_commas() {
        assert_eq!(
            repaired(r#"{"eventid":"cowrie.session.connect","session":"a",}"#),
            json!({"eventid": "cowrie.session.connect", "session": "a"})
        );
        assert_eq!(repaired(r#"{"a":[1,2,],}"#), json!({"a": [1, 2]}));
    }

    #[test]
    fn test_truncated_string_and_missing_braces() {
        assert_eq!(
            repaired(r#"{"eventid":"cowrie.login.failed","session":"ab"#),
            json!({"eventid": "cowrie.login.failed", "session": "ab"})
        );
        assert_eq!(
            repaired(r#"{"session":"a","data":{"k":[1"#),
            json!({"session": "a", "data": {"k": [1]}})
        );
    }

    #[test]
    fn test_dangling_key_is_dropped() {
        assert_eq!(repaired(r#"{"session":"a","eventid":"#), json!({"session": "a"}));
        assert_eq!(repaired(r#"{"session":"a","eventid"#), json!({"session": "a"}));
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        assert_eq!(
            repaired(r#"2024-03-01 log: {"session":"a"}"#),
            json!({"session": "a"})
        );
    }

    #[test]
    fn test_valid_input_needs_no_repair() {
        assert!(repair_json(r#"{"session":"a"}"#).is_none());
    }

    #[test]
    fn test_hopeless_input() {
        assert!(repair_json("not json at all").is_none());
        assert!(repair_json(r#"{"a" 1}"#).is_none());
    }
}
