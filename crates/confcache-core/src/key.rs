//! Key paths
//!
//! Keys and directories share one namespace: slash-delimited absolute
//! paths such as `/apps/demo/size`. Ordering is plain lexicographic string
//! order, which keeps every directory's descendants contiguous after the
//! directory itself followed by `/`.

use crate::error::{ConfError, ConfResult};

/// The root directory.
pub const ROOT: &str = "/";

/// Characters never allowed inside a path component.
const INVALID_CHARS: &str = " \t\r\n\"$&<>,+=#!()'|{}[]?~`;%\\";

/// Check that `key` is a well-formed absolute path.
///
/// Rejected before any engine call, so a malformed key never costs a
/// round trip.
pub fn validate_key(key: &str) -> ConfResult<()> {
    let invalid = |reason: String| ConfError::InvalidKey { key: key.to_string(), reason };

    if !key.starts_with('/') {
        return Err(invalid("Must begin with a slash (/)".into()));
    }
    if key == ROOT {
        return Ok(());
    }

    let mut just_saw_slash = false;
    for c in key.chars() {
        if just_saw_slash {
            if c == '/' {
                return Err(invalid("Can't have two slashes (/) in a row".into()));
            }
            if c == '.' {
                return Err(invalid("Can't have a period (.) right after a slash (/)".into()));
            }
        }

        if c == '/' {
            just_saw_slash = true;
            continue;
        }
        just_saw_slash = false;

        if !c.is_ascii() {
            return Err(invalid(format!(
                "'{}' is not an ASCII character, so isn't allowed in key names",
                c
            )));
        }
        if INVALID_CHARS.contains(c) {
            return Err(invalid(format!("`{}' is an invalid character in key/directory names", c)));
        }
    }

    if just_saw_slash {
        return Err(invalid("Key/directory may not end with a slash (/)".into()));
    }
    Ok(())
}

/// True if `below` is `above` itself or lies somewhere under it.
///
/// Only whole components match: `/foo` is not above `/foobar`.
pub fn key_is_below(above: &str, below: &str) -> bool {
    if above == ROOT {
        return true;
    }
    match below.strip_prefix(above) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// True if `below` lies strictly under `above`.
pub fn key_is_strictly_below(above: &str, below: &str) -> bool {
    above != below && key_is_below(above, below)
}

/// Directory containing `key`; the root is its own parent.
pub fn parent_dir(key: &str) -> &str {
    match key.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &key[..idx],
    }
}

/// Last component of `key`.
pub fn basename(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

/// Append a component to a directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Prefix shared by every path strictly under `dir`.
pub(crate) fn descendant_prefix(dir: &str) -> String {
    if dir == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Immediate child of `dir` on the way down to `path`.
///
/// `None` unless `path` lies strictly under `dir`. The child may be
/// `path` itself.
pub fn child_toward<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    if !key_is_strictly_below(dir, path) {
        return None;
    }
    let start = if dir == ROOT { 1 } else { dir.len() + 1 };
    match path[start..].find('/') {
        Some(idx) => Some(&path[..start + idx]),
        None => Some(path),
    }
}

/// Proper ancestors of `key`, nearest first, ending at the root.
pub fn ancestors(key: &str) -> Ancestors<'_> {
    Ancestors { next: if key == ROOT { None } else { Some(parent_dir(key)) } }
}

/// Iterator returned by [`ancestors`].
pub struct Ancestors<'a> {
    next: Option<&'a str>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.next?;
        self.next = if current == ROOT { None } else { Some(parent_dir(current)) };
        Some(current)
    }
}
