use std::path::{Component, Path, PathBuf};

use cirrus_types::{CirrusError, Result};

/// Validate and normalize a logical cache path.
///
/// Logical paths are `/`-separated, relative, and must stay inside the cache
/// root when joined to it. Backslashes are rejected rather than translated
/// so Windows-style separators never alias a second name for the same
/// object. Redundant separators and `.` segments are dropped.
pub fn normalize(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(CirrusError::InvalidPath("empty".into()));
    }
    if path.starts_with('/') {
        return Err(CirrusError::InvalidPath(format!("absolute path '{path}'")));
    }
    if path.contains('\\') {
        return Err(CirrusError::InvalidPath(format!(
            "contains backslash '{path}'"
        )));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(CirrusError::InvalidPath(format!(
                    "parent traversal '{path}'"
                )));
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(CirrusError::InvalidPath(format!(
            "no path components '{path}'"
        )));
    }

    Ok(segments.join("/"))
}

/// Resolve a normalized logical path to a filesystem path under `root`.
pub fn resolve(root: &Path, logical: &str) -> Result<PathBuf> {
    let normalized = normalize(logical)?;
    let mut resolved = root.to_path_buf();
    for part in normalized.split('/') {
        debug_assert!(!matches!(
            Path::new(part).components().next(),
            Some(Component::ParentDir | Component::RootDir)
        ));
        resolved.push(part);
    }
    Ok(resolved)
}
