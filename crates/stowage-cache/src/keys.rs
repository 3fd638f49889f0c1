//! Cache key generation utilities.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use stowage_core::{Error, Result};
use tracing::{debug, warn};

/// Digest length in bytes. Keys only need to tell inputs apart.
const DIGEST_LEN: usize = 16;

static CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\w+)\s+(?:"((?:[^"\\]|\\.)*)"|`([^`]*)`)$"#).expect("valid call regex")
});

/// Hash the contents of `files`, in order, into a hex digest.
pub fn hash_files<P: AsRef<Path>>(files: &[P]) -> Result<String> {
    let mut hasher = Sha256::new();

    for path in files {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| Error::io_at("open", path, e))?;
        io::copy(&mut file, &mut hasher).map_err(|e| Error::io_at("hash", path, e))?;
    }

    let hash = hasher.finalize();
    Ok(hex::encode(&hash[..DIGEST_LEN]))
}

/// Hash every regular file matched by a glob pattern.
pub fn hash_glob(pattern: &str) -> Result<String> {
    let files = glob_files(pattern)?;
    if files.is_empty() {
        warn!(pattern, "Pattern matched no files");
    } else {
        debug!(pattern, files = files.len(), "Hashing matched files");
    }
    hash_files(&files)
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| Error::InvalidRequest(format!("failed to glob {:?}: {}", pattern, e)))?;

    let mut files = vec![];
    for entry in paths {
        let path = entry.map_err(|e| {
            let context = format!("failed to glob {}", e.path().display());
            Error::io(context, e.into())
        })?;
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Expand a key template.
///
/// Every `{{ hashGlob "<pattern>" }}` action is replaced by the hash of the
/// files the pattern matches. Text outside actions is kept verbatim.
pub fn expand_key(template: &str) -> Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut last = 0;

    while let Some(action) = find_action(template, last)? {
        expanded.push_str(&template[last..action.start]);
        expanded.push_str(&evaluate(template[action.start + 2..action.end - 2].trim())?);
        last = action.end;
    }
    expanded.push_str(&template[last..]);
    Ok(expanded)
}

/// Locate the next `{{ ... }}` action at or after `from`.
///
/// Quoted and raw-string arguments are skipped whole, so a `}}` inside a
/// pattern does not close the action.
fn find_action(template: &str, from: usize) -> Result<Option<Range<usize>>> {
    let Some(offset) = template[from..].find("{{") else {
        return Ok(None);
    };
    let start = from + offset;
    let bytes = template.as_bytes();

    let mut i = start + 2;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
                i += 1;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Ok(Some(start..i + 2)),
            _ => i += 1,
        }
    }

    Err(Error::InvalidRequest(format!(
        "failed to parse template {:?}: unclosed action",
        template
    )))
}

fn evaluate(expr: &str) -> Result<String> {
    let call = CALL.captures(expr).ok_or_else(|| {
        Error::InvalidRequest(format!("failed to parse template action {:?}", expr))
    })?;

    let function = call.get(1).map_or("", |m| m.as_str());
    let argument = match (call.get(2), call.get(3)) {
        (Some(quoted), _) => unescape(quoted.as_str()),
        (None, Some(raw)) => raw.as_str().to_string(),
        (None, None) => String::new(),
    };

    match function {
        "hashGlob" => hash_glob(&argument),
        other => Err(Error::InvalidRequest(format!(
            "failed to process template: function {:?} not defined",
            other
        ))),
    }
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn test_hash_files_deterministic_and_order_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.lock");
        let b = dir.path().join("b.lock");
        fs::write(&a, b"serde = 1").unwrap();
        fs::write(&b, b"tokio = 1").unwrap();

        let ab = hash_files(&[&a, &b]).unwrap();
        assert_eq!(ab.len(), DIGEST_LEN * 2);
        assert_eq!(ab, hash_files(&[&a, &b]).unwrap());
        assert_ne!(ab, hash_files(&[&b, &a]).unwrap());

        fs::write(&b, b"tokio = 2").unwrap();
        assert_ne!(ab, hash_files(&[&a, &b]).unwrap());
    }

    #[test]
    fn test_hash_files_empty_list() {
        let empty: [&Path; 0] = [];
        // SHA-256 of nothing, first 128 bits.
        assert_eq!(hash_files(&empty).unwrap(), "e3b0c44298fc1c149afbf4c8996fb924");
    }

    #[test]
    fn test_hash_files_missing_file() {
        let err = hash_files(&[Path::new("/definitely/not/here")]).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_hash_glob_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.lock"), b"1").unwrap();
        fs::write(dir.path().join("two.lock"), b"2").unwrap();
        fs::create_dir(dir.path().join("dir.lock")).unwrap();

        let pattern = format!("{}/*.lock", dir.path().display());
        let expected = hash_files(&[dir.path().join("one.lock"), dir.path().join("two.lock")]).unwrap();
        assert_eq!(hash_glob(&pattern).unwrap(), expected);
    }

    #[test]
    fn test_hash_glob_invalid_pattern() {
        assert!(matches!(hash_glob("a[").unwrap_err(), Error::InvalidRequest(_)));
    }

    #[test]
    fn test_expand_key_literal() {
        assert_eq!(expand_key("cargo-linux-v1").unwrap(), "cargo-linux-v1");
        assert_eq!(expand_key("braces } stay").unwrap(), "braces } stay");
    }

    #[test]
    fn test_expand_key_hash_glob() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Cargo.lock"), b"lock").unwrap();
        let pattern = format!("{}/Cargo.lock", dir.path().display());
        let hash = hash_glob(&pattern).unwrap();

        let key = expand_key(&format!("cargo-{{{{ hashGlob \"{}\" }}}}-v2", pattern)).unwrap();
        assert_eq!(key, format!("cargo-{}-v2", hash));

        let raw = expand_key(&format!("cargo-{{{{hashGlob `{}`}}}}", pattern)).unwrap();
        assert_eq!(raw, format!("cargo-{}", hash));
    }

    #[test]
    fn test_expand_key_errors() {
        for bad in [
            "{{ nope \"x\" }}",
            "{{ hashGlob }}",
            "{{ hashGlob \"x\"",
            "prefix-{{",
        ] {
            let err = expand_key(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_expand_key_braces_inside_pattern() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a}}b"), b"odd name").unwrap();
        let pattern = format!("{}/a}}}}b", dir.path().display());
        let hash = hash_glob(&pattern).unwrap();
        assert_eq!(hash, hash_files(&[dir.path().join("a}}b")]).unwrap());

        let quoted = expand_key(&format!("k-{{{{ hashGlob \"{}\" }}}}", pattern)).unwrap();
        assert_eq!(quoted, format!("k-{}", hash));
        let raw = expand_key(&format!("k-{{{{ hashGlob `{}` }}}}-end", pattern)).unwrap();
        assert_eq!(raw, format!("k-{}-end", hash));
    }

    #[test]
    fn test_expand_key_unterminated_string_is_unclosed() {
        let err = expand_key("{{ hashGlob \"a}} }}").unwrap_err();
        assert!(err.to_string().contains("unclosed action"), "{err}");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r#"a\"b\\c"#), r#"a"b\c"#);
    }
}
