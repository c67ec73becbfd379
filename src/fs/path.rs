//! Path splitting.
//!
//! A path names a chain of directory components separated by `/`. An
//! absolute path starts with `/` and anchors at the root; anything else
//! anchors at the calling process's working directory. Repeated slashes
//! are treated as one.

/// Split `path` into its directory portion and its final component.
///
/// The directory portion keeps its trailing `/` when it reaches the root,
/// so the two halves can be resolved independently:
///
/// * `"/a/b"`   → `("/a/", "b")`
/// * `"b"`      → `("", "b")`, anchoring at the working directory
/// * `"/"`      → `("/", "")`
/// * `"a/b///"` → `("a/", "b")`, ignoring trailing slashes
pub fn split(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        // "" or a string of slashes.
        return (path, "");
    }
    match trimmed.rfind('/') {
        Some(i) => (&trimmed[..=i], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}

/// Iterate the non-empty components of `path`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Does `path` anchor at the root directory?
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}
