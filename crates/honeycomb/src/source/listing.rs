//! Expansion of CLI source arguments into concrete files.
//!
//! Arguments may be files, directories (every regular file inside, sorted
//! by name) or patterns with `*`/`?` in the final component. Rotated Cowrie
//! logs (`cowrie.json.2024-05-01`) sort chronologically by name, so sorted
//! order is ingestion order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use regex::Regex;
use snafu::prelude::*;

use crate::error::{InvalidPatternSnafu, ListSourceSnafu, NoSourcesSnafu, ReaderError};

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Translate a shell-style file name pattern into an anchored regex.
fn pattern_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, ReaderError> {
    let entries = std::fs::read_dir(dir).context(ListSourceSnafu { path: dir })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.context(ListSourceSnafu { path: dir })?;
        let file_type = entry.file_type().context(ListSourceSnafu { path: dir })?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Expand source arguments, preserving argument order and dropping repeats.
///
/// Paths that resolve to the same file are kept once, as first seen.
pub fn expand_sources(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, ReaderError> {
    let mut out: IndexSet<PathBuf> = IndexSet::new();

    for input in inputs {
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if has_wildcard(&file_name) {
            let dir = match input.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let matcher = pattern_to_regex(&file_name).context(InvalidPatternSnafu {
                pattern: input.display().to_string(),
            })?;
            let matched: Vec<PathBuf> = list_files(&dir)?
                .into_iter()
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| matcher.is_match(&n.to_string_lossy()))
                })
                .collect();
            ensure!(
                !matched.is_empty(),
                NoSourcesSnafu {
                    pattern: input.display().to_string(),
                }
            );
            out.extend(matched);
        } else if input.is_dir() {
            out.extend(list_files(input)?);
        } else {
            out.insert(input.clone());
        }
    }

    // Different spellings of one file (symlinks, relative paths) would
    // otherwise be loaded twice under the same source name.
    let mut canonical = HashSet::new();
    Ok(out
        .into_iter()
        .filter(|path| canonical.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.clone())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_glob_matches_sorted() {
        let dir = TempDir::new().unwrap();
        let b = touch(dir.path(), "cowrie.json.2024-05-02");
        let a = touch(dir.path(), "cowrie.json.2024-05-01");
        touch(dir.path(), "other.log");

        let found = expand_sources(&[dir.path().join("cowrie.json.*")]).unwrap();
        assert_eq!(found, vec![a, b]);
    }

    #[test]
    fn test_directory_and_duplicate_file() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "a.json");
        let b = touch(dir.path(), "b.json.gz");
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let found = expand_sources(&[a.clone(), dir.path().to_path_buf()]).unwrap();
        assert_eq!(found, vec![a, b]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_file_listed_once() {
        let dir = TempDir::new().unwrap();
        let target = touch(dir.path(), "cowrie.json");
        let link = dir.path().join("current.json");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let found = expand_sources(&[target.clone(), link]).unwrap();
        assert_eq!(found, vec![target]);
    }

    #[test]
    fn test_unmatched_glob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = expand_sources(&[dir.path().join("*.json")]).unwrap_err();
        assert!(matches!(err, ReaderError::NoSources { .. }));
    }

    #[test]
    fn test_pattern_escapes_regex_metacharacters() {
        let re = pattern_to_regex("cowrie.json.?").unwrap();
        assert!(re.is_match("cowrie.json.1"));
        assert!(!re.is_match("cowrieXjson.1"));
    }
}
