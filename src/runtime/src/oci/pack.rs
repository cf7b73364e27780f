//! Content packer.
//!
//! Walks a source directory in lexicographic order and produces bundle
//! entries plus layer blobs. No timestamps or ownership are recorded, so an
//! unchanged directory always packs to identical digests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use a3s_bundle_core::config::{ExternalSymlinks, PackConfig, PackLayout};
use a3s_bundle_core::error::{BundleError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use super::digest::{sha256_digest, sha256_file};
use super::entry::{link_stays_within, resolve_link_within, BundleEntry, EntryKind};
use super::manifest::{annotations, Blob, BUNDLE_ARCHIVE_MEDIA_TYPE, BUNDLE_FILE_MEDIA_TYPE};

/// Packer output: ordered entries and the layer blobs holding their content.
#[derive(Debug, Clone)]
pub struct PackedBundle {
    pub layout: PackLayout,
    pub entries: Vec<BundleEntry>,
    pub layers: Vec<Blob>,
}

impl PackedBundle {
    /// Total bytes of all layer blobs.
    pub fn content_size(&self) -> u64 {
        self.layers.iter().map(Blob::size).sum()
    }

    /// Number of regular files.
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }
}

/// An entry found by the walk, with its location on disk.
struct WalkedEntry {
    entry: BundleEntry,
    source: PathBuf,
}

/// Packs directories into bundles.
#[derive(Debug, Clone, Default)]
pub struct Packer {
    config: PackConfig,
}

impl Packer {
    pub fn new(config: PackConfig) -> Self {
        Self { config }
    }

    /// Pack `source` into entries and blobs.
    ///
    /// Fails with `NotFound` if the directory is missing and
    /// `PermissionDenied` if any part of it cannot be read. The source tree
    /// is never modified.
    pub fn pack(&self, source: &Path) -> Result<PackedBundle> {
        self.config.validate()?;

        let metadata = std::fs::metadata(source).map_err(|e| BundleError::io(source, e))?;
        if !metadata.is_dir() {
            return Err(BundleError::InvalidOption(format!(
                "Pack source is not a directory: {}",
                source.display()
            )));
        }

        let mut walked = Vec::new();
        let mut segments = Vec::new();
        self.walk(source, source, &mut segments, &mut walked)?;

        let packed = match self.config.layout {
            PackLayout::Files => pack_files(walked)?,
            PackLayout::Archive => pack_archive(walked, self.config.compression_level)?,
        };

        tracing::info!(
            source = %source.display(),
            layout = ?packed.layout,
            entries = packed.entries.len(),
            layers = packed.layers.len(),
            bytes = packed.content_size(),
            "Packed bundle"
        );

        Ok(packed)
    }

    /// Recursively collect entries below `current`, sorted by name.
    fn walk(
        &self,
        root: &Path,
        current: &Path,
        segments: &mut Vec<String>,
        out: &mut Vec<WalkedEntry>,
    ) -> Result<()> {
        let read_dir = std::fs::read_dir(current).map_err(|e| BundleError::io(current, e))?;

        let mut children = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| BundleError::io(current, e))?;
            children.push(entry.path());
        }
        children.sort();

        for path in children {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    BundleError::InvalidOption(format!(
                        "File name is not valid UTF-8: {}",
                        path.display()
                    ))
                })?
                .to_string();
            if name.contains('\\') {
                return Err(BundleError::InvalidOption(format!(
                    "File name contains a backslash: {}",
                    path.display()
                )));
            }

            let metadata = std::fs::symlink_metadata(&path).map_err(|e| BundleError::io(&path, e))?;
            let file_type = metadata.file_type();

            segments.push(name);
            let relative = segments.join("/");

            if file_type.is_symlink() {
                let target = std::fs::read_link(&path).map_err(|e| BundleError::io(&path, e))?;
                let target = target.to_str().ok_or_else(|| {
                    BundleError::InvalidOption(format!(
                        "Symlink target is not valid UTF-8: {}",
                        path.display()
                    ))
                })?;

                let link_segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                let checked = link_stays_within(&link_segments, target).and_then(|()| {
                    let link_dir = &link_segments[..link_segments.len() - 1];
                    resolve_link_within(root, link_dir, &relative, target).map(|_| ())
                });
                match checked {
                    Ok(()) => out.push(WalkedEntry {
                        entry: BundleEntry::symlink(relative, target),
                        source: path.clone(),
                    }),
                    Err(e) => match self.config.external_symlinks {
                        ExternalSymlinks::Reject => return Err(e),
                        ExternalSymlinks::Skip => {
                            tracing::warn!(
                                path = %path.display(),
                                target = %target,
                                "Skipping symlink pointing outside the source tree"
                            );
                        }
                    },
                }
            } else if file_type.is_dir() {
                out.push(WalkedEntry {
                    entry: BundleEntry::directory(relative, mode_of(&metadata)),
                    source: path.clone(),
                });
                self.walk(root, &path, segments, out)?;
            } else if file_type.is_file() {
                out.push(WalkedEntry {
                    entry: BundleEntry {
                        path: relative,
                        kind: EntryKind::File,
                        mode: mode_of(&metadata),
                        size: metadata.len(),
                        link_target: None,
                        digest: None,
                    },
                    source: path.clone(),
                });
            } else {
                tracing::warn!(path = %path.display(), "Skipping special file");
            }

            segments.pop();
        }

        Ok(())
    }
}

/// One raw blob per distinct file content.
fn pack_files(walked: Vec<WalkedEntry>) -> Result<PackedBundle> {
    let mut entries = Vec::with_capacity(walked.len());
    let mut layers = Vec::new();
    let mut seen = HashSet::new();

    for WalkedEntry { mut entry, source } in walked {
        if entry.kind == EntryKind::File {
            let data = std::fs::read(&source).map_err(|e| BundleError::io(&source, e))?;
            let digest = sha256_digest(&data);
            entry.size = data.len() as u64;
            entry.digest = Some(digest.clone());

            if seen.insert(digest) {
                layers.push(
                    Blob::new(BUNDLE_FILE_MEDIA_TYPE, data)
                        .with_annotation(annotations::TITLE, entry.path.clone()),
                );
            }
        }
        entries.push(entry);
    }

    Ok(PackedBundle {
        layout: PackLayout::Files,
        entries,
        layers,
    })
}

/// A single tar+gzip layer with normalized headers.
fn pack_archive(walked: Vec<WalkedEntry>, level: u32) -> Result<PackedBundle> {
    let encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    let mut builder = tar::Builder::new(encoder);
    let mut entries = Vec::with_capacity(walked.len());

    for WalkedEntry { mut entry, source } in walked {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(entry.mode);

        let appended = match entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", entry.path), std::io::empty())
            }
            EntryKind::File => {
                let (digest, size) = sha256_file(&source)?;
                entry.size = size;
                entry.digest = Some(digest);

                let file = std::fs::File::open(&source).map_err(|e| BundleError::io(&source, e))?;
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(size);
                builder.append_data(&mut header, &entry.path, file)
            }
            EntryKind::Symlink => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                let target = entry.link_target.clone().unwrap_or_default();
                builder.append_link(&mut header, &entry.path, target)
            }
        };
        appended.map_err(|e| BundleError::io(&source, e))?;
        entries.push(entry);
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| BundleError::io("<archive>", e))?;
    let data = encoder
        .finish()
        .map_err(|e| BundleError::io("<archive>", e))?;

    Ok(PackedBundle {
        layout: PackLayout::Archive,
        entries,
        layers: vec![Blob::new(BUNDLE_ARCHIVE_MEDIA_TYPE, data)],
    })
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_bundle_core::error::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "0123456789").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("b.txt"), "01234567890123456789").unwrap();
        tmp
    }

    fn paths(packed: &PackedBundle) -> Vec<&str> {
        packed.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_pack_files_layout() {
        let src = sample_tree();
        let packed = Packer::default().pack(src.path()).unwrap();

        assert_eq!(packed.layout, PackLayout::Files);
        assert_eq!(paths(&packed), vec!["a.txt", "sub", "sub/b.txt"]);
        assert_eq!(packed.layers.len(), 2);
        assert_eq!(packed.content_size(), 30);
        assert_eq!(packed.file_count(), 2);

        let a = &packed.entries[0];
        assert_eq!(a.size, 10);
        assert_eq!(a.digest.as_deref(), Some(packed.layers[0].digest()));
        assert_eq!(
            packed.layers[0].annotations().get(annotations::TITLE).map(String::as_str),
            Some("a.txt")
        );
        assert_eq!(packed.entries[1].kind, EntryKind::Directory);
    }

    #[test]
    fn test_pack_is_deterministic() {
        let src = sample_tree();
        for layout in [PackLayout::Files, PackLayout::Archive] {
            let packer = Packer::new(PackConfig {
                layout,
                ..Default::default()
            });
            let first = packer.pack(src.path()).unwrap();
            let second = packer.pack(src.path()).unwrap();
            let digests = |p: &PackedBundle| {
                p.layers.iter().map(|b| b.digest().to_string()).collect::<Vec<_>>()
            };
            assert_eq!(digests(&first), digests(&second));
            assert_eq!(first.entries, second.entries);
        }
    }

    #[test]
    fn test_pack_orders_directories_before_children() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("b/c")).unwrap();
        fs::write(tmp.path().join("b/c/d.txt"), "d").unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("b/z.txt"), "z").unwrap();

        let packed = Packer::default().pack(tmp.path()).unwrap();
        assert_eq!(paths(&packed), vec!["a.txt", "b", "b/c", "b/c/d.txt", "b/z.txt"]);
    }

    #[test]
    fn test_pack_deduplicates_identical_content() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("one.txt"), "same").unwrap();
        fs::write(tmp.path().join("two.txt"), "same").unwrap();

        let packed = Packer::default().pack(tmp.path()).unwrap();
        assert_eq!(packed.entries.len(), 2);
        assert_eq!(packed.layers.len(), 1);
        assert_eq!(packed.entries[0].digest, packed.entries[1].digest);
    }

    #[test]
    fn test_pack_archive_layout() {
        let src = sample_tree();
        let packed = Packer::new(PackConfig {
            layout: PackLayout::Archive,
            ..Default::default()
        })
        .pack(src.path())
        .unwrap();

        assert_eq!(packed.layers.len(), 1);
        assert_eq!(packed.layers[0].media_type(), BUNDLE_ARCHIVE_MEDIA_TYPE);
        assert!(packed.entries[0].digest.is_some());

        let decoder = flate2::read::GzDecoder::new(packed.layers[0].data());
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                assert_eq!(e.header().mtime().unwrap(), 0);
                e.path().unwrap().to_string_lossy().to_string()
            })
            .collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "a.txt");
        assert_eq!(names[1].trim_end_matches('/'), "sub");
        assert_eq!(names[2], "sub/b.txt");
    }

    #[test]
    fn test_pack_missing_source() {
        let err = Packer::default()
            .pack(Path::new("/nonexistent/bundle/source"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_pack_file_source_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = Packer::default().pack(&file).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
    }

    #[test]
    fn test_pack_empty_directory() {
        let tmp = TempDir::new().unwrap();
        let packed = Packer::default().pack(tmp.path()).unwrap();
        assert!(packed.entries.is_empty());
        assert!(packed.layers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_records_in_tree_symlink() {
        let src = sample_tree();
        std::os::unix::fs::symlink("../a.txt", src.path().join("sub/link")).unwrap();

        let packed = Packer::default().pack(src.path()).unwrap();
        let link = packed.entries.iter().find(|e| e.path == "sub/link").unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("../a.txt"));
        assert!(link.digest.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_external_symlink_rejected_or_skipped() {
        let src = sample_tree();
        std::os::unix::fs::symlink("/etc/passwd", src.path().join("escape")).unwrap();

        let err = Packer::default().pack(src.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);

        let packed = Packer::new(PackConfig {
            external_symlinks: ExternalSymlinks::Skip,
            ..Default::default()
        })
        .pack(src.path())
        .unwrap();
        assert!(packed.entries.iter().all(|e| e.path != "escape"));
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_symlink_escaping_through_link_rejected_or_skipped() {
        let src = sample_tree();
        std::os::unix::fs::symlink(".", src.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a/..", src.path().join("b")).unwrap();

        let err = Packer::default().pack(src.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);

        let packed = Packer::new(PackConfig {
            external_symlinks: ExternalSymlinks::Skip,
            ..Default::default()
        })
        .pack(src.path())
        .unwrap();
        assert!(packed.entries.iter().any(|e| e.path == "a"));
        assert!(packed.entries.iter().all(|e| e.path != "b"));
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_rejects_backslash_in_name() {
        let src = sample_tree();
        fs::write(src.path().join("sub").join("win\\name.txt"), "x").unwrap();

        let err = Packer::default().pack(src.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
        assert!(err.to_string().contains("backslash"));
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_records_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let packed = Packer::default().pack(tmp.path()).unwrap();
        assert_eq!(packed.entries[0].mode, 0o755);
    }
}
