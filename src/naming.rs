//! Name canonicalization.
//!
//! Storage names arrive in whatever shape callers produce (Windows
//! separators, `..` segments, duplicated slashes).  They are cleaned into
//! POSIX form and then joined under the configured location prefix to
//! produce the [`ObjectKey`] that is sent to the store.

use std::fmt;

use crate::errors::{StorageError, StorageResult};

/// Canonical object key inside a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The last path segment, ignoring a trailing slash.
    pub fn file_name(&self) -> &str {
        let trimmed = self.0.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// POSIX path normalization: collapses repeated separators, drops `.`
/// segments and resolves `..` against the preceding segment.
///
/// An empty result is returned as `"."`.  Up to two leading slashes are
/// preserved, three or more collapse to one.
pub fn normalize_posix(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let leading = if path.starts_with("//") && !path.starts_with("///") {
        "//"
    } else if path.starts_with('/') {
        "/"
    } else {
        ""
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if leading.is_empty() {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = format!("{leading}{}", segments.join("/"));
    if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Clean a caller-supplied name into POSIX form.
///
/// Backslashes become forward slashes, the path is normalized and a
/// trailing slash present in the input survives normalization.  The empty
/// name stays empty.
pub fn clean_name(name: &str) -> String {
    let forward = name.replace('\\', "/");
    let mut cleaned = normalize_posix(&forward);

    if forward.ends_with('/') && !cleaned.ends_with('/') {
        cleaned.push('/');
    }
    if cleaned == "." {
        cleaned.clear();
    }
    cleaned
}

/// Join `name` under the `base` location prefix.
///
/// The joined path must stay under `base`; a name that climbs out of it
/// fails with [`StorageError::SuspiciousOperation`].  The returned key has
/// no leading slash.
pub fn safe_join(base: &str, name: &str) -> StorageResult<ObjectKey> {
    if base.starts_with('/') {
        return Err(StorageError::InvalidLocation {
            location: base.to_string(),
        });
    }

    let base_path = base.trim_end_matches('/');
    let prefix = format!("{base_path}/");

    let joined = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{prefix}{name}")
    };
    let mut final_path = normalize_posix(&joined);
    if name.ends_with('/') || format!("{final_path}/") == prefix {
        final_path.push('/');
    }
    if final_path == base_path {
        final_path.push('/');
    }

    let escapes = !final_path.starts_with(base_path)
        || final_path.as_bytes().get(base_path.len()) != Some(&b'/');
    if escapes {
        return Err(StorageError::SuspiciousOperation {
            name: name.to_string(),
        });
    }

    Ok(ObjectKey(final_path.trim_start_matches('/').to_string()))
}

/// Clean `name` and join it under `location`.
pub fn normalize_name(location: &str, name: &str) -> StorageResult<ObjectKey> {
    safe_join(location, &clean_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("path/to/somewhere"), "path/to/somewhere");
    }

    #[test]
    fn test_clean_name_normalize() {
        assert_eq!(clean_name("path/to/../somewhere"), "path/somewhere");
        assert_eq!(clean_name("path//to/./somewhere"), "path/to/somewhere");
    }

    #[test]
    fn test_clean_name_trailing_slash() {
        assert_eq!(clean_name("path/to/somewhere/"), "path/to/somewhere/");
        assert_eq!(clean_name("path/to/../"), "path/");
    }

    #[test]
    fn test_clean_name_windows() {
        assert_eq!(clean_name(r"path\to\somewhere"), "path/to/somewhere");
    }

    #[test]
    fn test_clean_name_empty() {
        assert_eq!(clean_name(""), "");
        assert_eq!(clean_name("."), "");
    }

    #[test]
    fn test_normalize_posix_edges() {
        assert_eq!(normalize_posix("/a/../.."), "/");
        assert_eq!(normalize_posix("../a"), "../a");
        assert_eq!(normalize_posix("//a"), "//a");
        assert_eq!(normalize_posix("///a"), "/a");
    }

    #[test]
    fn test_safe_join_under_location() {
        assert_eq!(safe_join("media", "a/b.txt").unwrap().as_str(), "media/a/b.txt");
        assert_eq!(safe_join("media/", "a/").unwrap().as_str(), "media/a/");
        assert_eq!(safe_join("", "file.txt").unwrap().as_str(), "file.txt");
        assert_eq!(safe_join("", "").unwrap().as_str(), "");
        assert_eq!(safe_join("media", "").unwrap().as_str(), "media/");
    }

    #[test]
    fn test_safe_join_rejects_escape() {
        let err = safe_join("media", "../secret.txt").unwrap_err();
        assert!(matches!(err, StorageError::SuspiciousOperation { .. }));

        let err = safe_join("media", "/etc/passwd").unwrap_err();
        assert!(matches!(err, StorageError::SuspiciousOperation { .. }));

        let err = safe_join("media", "../media2/file").unwrap_err();
        assert!(matches!(err, StorageError::SuspiciousOperation { .. }));
    }

    #[test]
    fn test_safe_join_rejects_absolute_location() {
        let err = safe_join("/", "file.txt").unwrap_err();
        assert!(matches!(err, StorageError::InvalidLocation { .. }));
    }

    #[test]
    fn test_normalize_name_windows_under_location() {
        let key = normalize_name("static", r"css\site.css").unwrap();
        assert_eq!(key.as_str(), "static/css/site.css");
        assert_eq!(key.file_name(), "site.css");
    }
}
