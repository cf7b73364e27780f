//! Bundle entries and relative-path rules shared by packing and extraction.

use std::collections::VecDeque;
use std::path::Path;

use a3s_bundle_core::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

/// Kind of filesystem object recorded in a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One filesystem object in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    /// Slash-separated path relative to the bundle root
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits (`0o7777` range)
    pub mode: u32,
    /// Content length in bytes (0 for directories and symlinks)
    pub size: u64,
    /// Link target, symlinks only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Content digest, regular files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl BundleEntry {
    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            mode,
            size: 0,
            link_target: None,
            digest: None,
        }
    }

    pub fn file(path: impl Into<String>, mode: u32, size: u64, digest: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            mode,
            size,
            link_target: None,
            digest: Some(digest.into()),
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Symlink,
            mode: 0o777,
            size: 0,
            link_target: Some(target.into()),
            digest: None,
        }
    }

    /// Whether any execute bit is recorded.
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Split an entry path into its meaningful segments.
///
/// Empty and `.` segments are dropped. Absolute paths (including Windows
/// drive and UNC forms) and `..` segments are rejected. An empty result
/// names the bundle root.
pub fn split_relative(path: &str) -> Result<Vec<&str>> {
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(BundleError::SecurityViolation(format!(
            "absolute entry path: '{}'",
            path
        )));
    }

    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    if let Some(first) = segments.first() {
        let bytes = first.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
            return Err(BundleError::SecurityViolation(format!(
                "absolute entry path: '{}'",
                path
            )));
        }
    }

    if segments.iter().any(|s| *s == ".." || s.contains('\\')) {
        return Err(BundleError::SecurityViolation(format!(
            "entry path escapes destination: '{}'",
            path
        )));
    }

    Ok(segments)
}

/// Check that a symlink at `link_segments` pointing to `target` resolves
/// inside the tree, using lexical resolution only.
pub fn link_stays_within(link_segments: &[&str], target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(BundleError::SecurityViolation(format!(
            "empty symlink target at '{}'",
            link_segments.join("/")
        )));
    }
    if target.starts_with('/') || target.starts_with('\\') {
        return Err(BundleError::SecurityViolation(format!(
            "symlink '{}' points to absolute path '{}'",
            link_segments.join("/"),
            target
        )));
    }

    // Resolution starts from the directory holding the link.
    let mut depth = link_segments.len().saturating_sub(1);
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return Err(BundleError::SecurityViolation(format!(
                        "symlink '{}' points outside the tree: '{}'",
                        link_segments.join("/"),
                        target
                    )));
                }
                depth -= 1;
            }
            _ => depth += 1,
        }
    }
    Ok(())
}

/// Symlinks followed while resolving one link target.
pub const MAX_LINK_HOPS: usize = 40;

/// Resolve `target` for a link stored in `link_dir` (relative to `root`),
/// following symlinks that already exist under `root`.
///
/// Every step must stay inside `root`. Components missing on disk resolve
/// lexically. Returns the resolved location relative to `root`.
pub fn resolve_link_within(
    root: &Path,
    link_dir: &[&str],
    link: &str,
    target: &str,
) -> Result<Vec<String>> {
    let outside = || {
        BundleError::SecurityViolation(format!(
            "symlink '{}' points outside the tree: '{}'",
            link, target
        ))
    };

    let mut position: Vec<String> = link_dir.iter().map(|s| s.to_string()).collect();
    let mut pending = link_components(target).ok_or_else(outside)?;
    let mut hops = 0;

    while let Some(segment) = pending.pop_front() {
        if segment == ".." {
            position.pop().ok_or_else(outside)?;
            continue;
        }

        let mut candidate = root.to_path_buf();
        candidate.extend(&position);
        candidate.push(&segment);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(BundleError::SecurityViolation(format!(
                        "symlink '{}' resolves through more than {} links",
                        link, MAX_LINK_HOPS
                    )));
                }
                let next =
                    std::fs::read_link(&candidate).map_err(|e| BundleError::io(&candidate, e))?;
                let next = next.to_str().and_then(link_components).ok_or_else(outside)?;
                // The hop is resolved from the directory holding that link.
                for part in next.into_iter().rev() {
                    pending.push_front(part);
                }
            }
            _ => position.push(segment),
        }
    }

    Ok(position)
}

/// Segments of a relative link target; `None` for absolute targets.
fn link_components(target: &str) -> Option<VecDeque<String>> {
    if target.starts_with('/') || target.starts_with('\\') {
        return None;
    }
    Some(
        target
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_bundle_core::error::ErrorKind;

    #[test]
    fn test_split_relative_plain() {
        assert_eq!(split_relative("a/b/c.txt").unwrap(), vec!["a", "b", "c.txt"]);
        assert_eq!(split_relative("./a//b/").unwrap(), vec!["a", "b"]);
        assert!(split_relative(".").unwrap().is_empty());
    }

    #[test]
    fn test_split_relative_rejects_traversal() {
        let err = split_relative("../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(split_relative("a/../../b").is_err());
        assert!(split_relative("a/..").is_err());
    }

    #[test]
    fn test_split_relative_rejects_absolute() {
        assert!(split_relative("/etc/passwd").is_err());
        assert!(split_relative("\\windows\\system32").is_err());
        assert!(split_relative("C:/Windows").is_err());
        assert!(split_relative("a\\..\\b").is_err());
    }

    #[test]
    fn test_link_within_tree() {
        assert!(link_stays_within(&["a", "link"], "target").is_ok());
        assert!(link_stays_within(&["a", "link"], "../b/target").is_ok());
        assert!(link_stays_within(&["a", "b", "link"], "../../c").is_ok());
    }

    #[test]
    fn test_link_outside_tree() {
        assert!(link_stays_within(&["link"], "../outside").is_err());
        assert!(link_stays_within(&["a", "link"], "../../outside").is_err());
        assert!(link_stays_within(&["a", "link"], "/etc/passwd").is_err());
        assert!(link_stays_within(&["a", "link"], "").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_follows_links_on_disk() {
        use std::os::unix::fs::symlink;

        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("sub/deep")).unwrap();
        symlink("sub/deep", root.path().join("d")).unwrap();
        symlink(".", root.path().join("a")).unwrap();

        let resolved = resolve_link_within(root.path(), &[], "l", "d/../x").unwrap();
        assert_eq!(resolved, vec!["sub", "x"]);
        // missing components resolve lexically
        let resolved = resolve_link_within(root.path(), &["sub"], "sub/l", "new/../y").unwrap();
        assert_eq!(resolved, vec!["sub", "y"]);

        let err = resolve_link_within(root.path(), &[], "b", "a/..").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(resolve_link_within(root.path(), &["sub"], "sub/l", "../a/a/..").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_link_loops() {
        use std::os::unix::fs::symlink;

        let root = tempfile::TempDir::new().unwrap();
        symlink("y", root.path().join("x")).unwrap();
        symlink("x", root.path().join("y")).unwrap();

        let err = resolve_link_within(root.path(), &[], "l", "x/f").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(err.to_string().contains("more than"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_absolute_hop() {
        use std::os::unix::fs::symlink;

        let root = tempfile::TempDir::new().unwrap();
        symlink("/tmp", root.path().join("abs")).unwrap();

        let err = resolve_link_within(root.path(), &[], "l", "abs/f").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
    }

    #[test]
    fn test_entry_serialization() {
        let entry = BundleEntry::file("sub/b.txt", 0o644, 20, "sha256:abc");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"path":"sub/b.txt","kind":"file","mode":420,"size":20,"digest":"sha256:abc"}"#
        );

        let link: BundleEntry =
            serde_json::from_str(r#"{"path":"l","kind":"symlink","mode":511,"size":0,"linkTarget":"a"}"#)
                .unwrap();
        assert_eq!(link.link_target.as_deref(), Some("a"));
    }

    #[test]
    fn test_is_executable() {
        assert!(BundleEntry::file("run.sh", 0o755, 0, "sha256:x").is_executable());
        assert!(!BundleEntry::file("a.txt", 0o644, 0, "sha256:x").is_executable());
    }
}
