//! In-place, heap-free path and string manipulation helpers.
//!
//! These mirror a small, fixed set of operations needed by the search engine
//! and the audit module: tokenizing a delimiter-separated string, finding the
//! ancestor directory whose name starts with a given prefix, joining two path
//! fragments into a fixed-capacity buffer, and extracting a filename. None of
//! them allocate; the join target is a caller-owned [`FixedPath`] sized to
//! `PATH_MAX` so the audit module can hold its four precomputed paths as
//! plain process-lifetime storage.

use std::path::PathBuf;

use thiserror::Error;

/// `PATH_MAX` on this platform, as used throughout the component design.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

#[derive(Debug, Error)]
pub enum PathUtilError {
    #[error("joined path would exceed PATH_MAX ({PATH_MAX} bytes)")]
    Overflow,
}

/// A stack-allocated, null-terminated path buffer of exactly `PATH_MAX` bytes.
///
/// Unused trailing bytes are always zeroed, matching the C implementation's
/// `path_join`, which the audit module relies on to treat the buffer as a
/// plain C string.
#[derive(Clone)]
pub struct FixedPath {
    buf: [u8; PATH_MAX],
    len: usize,
}

impl Default for FixedPath {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedPath {
    pub const fn new() -> Self {
        Self {
            buf: [0u8; PATH_MAX],
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.buf = [0u8; PATH_MAX];
        self.len = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.as_str())
    }

    /// A pointer to the buffer's first byte. Since unused trailing bytes are
    /// always zeroed, this doubles as a NUL-terminated C string pointer
    /// regardless of `len` — the property the audit module's callbacks rely
    /// on to hand the loader a `char *` straight out of static storage.
    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }
}

/// Consumes one `delim`-separated token starting at `cursor`.
///
/// Returns `(token, rest)` where `rest` is the remainder of the string after
/// the consumed delimiter, or `None` once `cursor` is exhausted. An empty
/// `cursor` yields `None` rather than a final empty token, so a trailing
/// delimiter does not produce a spurious empty entry.
pub fn next_token(cursor: &str, delim: char) -> Option<(&str, &str)> {
    if cursor.is_empty() {
        return None;
    }
    match cursor.find(delim) {
        Some(idx) => Some((&cursor[..idx], &cursor[idx + delim.len_utf8()..])),
        None => Some((cursor, "")),
    }
}

/// Iterates the `delim`-separated tokens of `s`, in the same order and with
/// the same trailing-empty-token suppression as [`next_token`].
pub fn tokens(s: &str, delim: char) -> impl Iterator<Item = &str> {
    let mut cursor = s;
    std::iter::from_fn(move || {
        let (token, rest) = next_token(cursor, delim)?;
        cursor = rest;
        Some(token)
    })
}

/// Finds the byte offset of the last ancestor component whose name starts
/// with `child_prefix`.
///
/// `is_dir` controls whether `path`'s final component is itself eligible to
/// match (a directory path) or is skipped (a file path, whose last component
/// is a filename rather than a directory name). Returns `None` if no
/// component matches.
pub fn path_prefix(path: &str, child_prefix: &str, is_dir: bool) -> Option<usize> {
    if child_prefix.is_empty() {
        return None;
    }

    let mut match_offset: Option<usize> = None;
    let mut cursor = path;
    let mut consumed = 0usize;

    while let Some((component, rest)) = next_token(cursor, '/') {
        let component_start = consumed;

        // A file path's final component is a filename, not a directory name,
        // and is never eligible to match.
        if !is_dir && rest.is_empty() {
            break;
        }

        if component.len() >= child_prefix.len() && component.starts_with(child_prefix) {
            // The match offset is the end of the parent path preceding this
            // component's separator; a component at offset 0 has no parent.
            match_offset = Some(component_start.saturating_sub(1));
        }

        consumed = component_start + component.len() + 1;
        cursor = rest;
    }

    match_offset
}

/// Joins `parent` and `child` with exactly one `/` separator into `dst`.
///
/// An empty `parent` is treated as `"."`. Fails without mutating `dst` if the
/// joined result (including the null terminator) would not fit in
/// `PATH_MAX` bytes.
pub fn path_join(dst: &mut FixedPath, parent: &str, child: &str) -> Result<usize, PathUtilError> {
    let parent = if parent.is_empty() { "." } else { parent };

    let parent_has_sep = parent.ends_with('/');
    let child_has_sep = child.starts_with('/');
    let extra_sep = usize::from(!parent_has_sep && !child_has_sep);

    let child = if parent_has_sep && child_has_sep {
        &child[1..]
    } else {
        child
    };

    let total_len = parent.len() + child.len() + extra_sep;
    if total_len >= PATH_MAX {
        return Err(PathUtilError::Overflow);
    }

    dst.clear();
    let mut cursor = 0usize;
    dst.buf[cursor..cursor + parent.len()].copy_from_slice(parent.as_bytes());
    cursor += parent.len();
    if extra_sep == 1 {
        dst.buf[cursor] = b'/';
        cursor += 1;
    }
    dst.buf[cursor..cursor + child.len()].copy_from_slice(child.as_bytes());
    cursor += child.len();
    dst.len = cursor;

    Ok(total_len)
}

/// Returns the filename component of `path`, i.e. everything after the last
/// `/`, or the whole string if there is none.
pub fn path_filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_token_splits_on_delimiter() {
        let mut it = tokens("a:b:c", ':');
        assert_eq!(it.next(), Some("a"));
        assert_eq!(it.next(), Some("b"));
        assert_eq!(it.next(), Some("c"));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn next_token_suppresses_trailing_empty() {
        let tokens: Vec<_> = tokens("a:b:", ':').collect();
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[test]
    fn next_token_empty_input_yields_nothing() {
        assert_eq!(tokens("", ':').next(), None);
    }

    #[test]
    fn path_prefix_finds_lib_ancestor_for_directory() {
        let path = "/foo/bar/lib/x86_64-linux";
        assert_eq!(path_prefix(path, "lib", true), Some(8));
    }

    #[test]
    fn path_prefix_finds_lib_ancestor_for_file() {
        let path = "/foo/bar/lib64/libfoo.so";
        assert_eq!(path_prefix(path, "lib", false), Some(8));
    }

    #[test]
    fn path_prefix_returns_none_without_match() {
        assert_eq!(path_prefix("/foo/bar/baz", "lib", true), None);
    }

    #[test]
    fn path_join_inserts_single_separator() {
        let mut dst = FixedPath::new();
        path_join(&mut dst, "/foo/bar", "baz").unwrap();
        assert_eq!(dst.as_str(), "/foo/bar/baz");
    }

    #[test]
    fn path_join_avoids_double_separator() {
        let mut dst = FixedPath::new();
        path_join(&mut dst, "/foo/bar/", "/baz").unwrap();
        assert_eq!(dst.as_str(), "/foo/bar/baz");
    }

    #[test]
    fn path_join_empty_parent_becomes_dot() {
        let mut dst = FixedPath::new();
        path_join(&mut dst, "", "baz").unwrap();
        assert_eq!(dst.as_str(), "./baz");
    }

    #[test]
    fn path_join_and_filename_round_trip() {
        let mut dst = FixedPath::new();
        path_join(&mut dst, "/foo/bar", "libcuda.so.1").unwrap();
        assert_eq!(path_filename(dst.as_str()), "libcuda.so.1");
    }

    #[test]
    fn path_join_rejects_overflow_without_mutating() {
        let mut dst = FixedPath::new();
        let huge_parent = "a".repeat(PATH_MAX);
        let err = path_join(&mut dst, &huge_parent, "x").unwrap_err();
        assert_matches::assert_matches!(err, PathUtilError::Overflow);
        assert!(dst.is_empty());
    }

    #[test]
    fn path_filename_with_no_separator_is_whole_string() {
        assert_eq!(path_filename("libcuda.so.1"), "libcuda.so.1");
    }
}
