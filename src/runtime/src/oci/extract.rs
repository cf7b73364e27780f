//! Extraction guard.
//!
//! Materializes a bundle under a destination directory while enforcing an
//! [`ExtractionPolicy`]. Every entry path is resolved against the
//! destination before anything is written:
//!
//! - absolute paths and `..` segments are rejected
//! - parent directories that are symlinks must resolve inside the destination
//! - symlink targets must resolve inside the destination
//! - existing symlinks at a target path are replaced, never followed
//!
//! Quotas (entry count, total bytes, bytes per file) are checked before a
//! file is opened, and copies never read past the recorded size.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use a3s_bundle_core::config::{ExtractionPolicy, PackLayout, UnmatchedPrefix};
use a3s_bundle_core::error::{BundleError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use super::entry::{link_stays_within, resolve_link_within, split_relative, EntryKind};
use super::manifest::{Blob, Bundle, Descriptor, BUNDLE_ARCHIVE_MEDIA_TYPE};

/// Counts of what an extraction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    /// File content bytes written
    pub bytes: u64,
}

impl ExtractionReport {
    /// Entries materialized, of every kind.
    pub fn entries(&self) -> u64 {
        self.files + self.directories + self.symlinks
    }
}

/// Extracts bundles into one destination under one policy.
#[derive(Debug, Clone)]
pub struct ExtractionGuard {
    root: PathBuf,
    policy: ExtractionPolicy,
    prefix: Vec<String>,
}

impl ExtractionGuard {
    /// Validate `policy` and prepare `dest`, creating it if needed.
    pub fn new(dest: impl AsRef<Path>, policy: &ExtractionPolicy) -> Result<Self> {
        policy.validate()?;

        let dest = dest.as_ref();
        fs::create_dir_all(dest).map_err(|e| BundleError::io(dest, e))?;
        let root = dest.canonicalize().map_err(|e| BundleError::io(dest, e))?;

        let prefix = match &policy.strip_prefix {
            Some(prefix) => split_relative(prefix)?
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            root,
            policy: policy.clone(),
            prefix,
        })
    }

    /// Canonical destination directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &ExtractionPolicy {
        &self.policy
    }

    /// Refuse layers whose declared sizes already exceed the byte quotas.
    ///
    /// Runs before download: in the files layout every layer is one file's
    /// content, in the archive layout only the compressed total is known.
    pub fn check_layers(&self, layout: PackLayout, layers: &[Descriptor]) -> Result<()> {
        let mut total: u64 = 0;
        for layer in layers {
            if layout == PackLayout::Files && layer.size > self.policy.max_file_size {
                return Err(BundleError::SecurityViolation(format!(
                    "layer {} is {} bytes, file limit is {}",
                    layer.digest, layer.size, self.policy.max_file_size
                )));
            }
            total = total
                .checked_add(layer.size)
                .filter(|total| *total <= self.policy.max_size)
                .ok_or_else(|| {
                    BundleError::SecurityViolation(format!(
                        "layers exceed {} bytes at {}",
                        self.policy.max_size, layer.digest
                    ))
                })?;
        }
        Ok(())
    }

    /// Write every entry of `bundle` under the destination.
    ///
    /// On failure, entries already written are left in place.
    pub fn extract(&self, bundle: &Bundle) -> Result<ExtractionReport> {
        tracing::info!(
            dest = %self.root.display(),
            layout = ?bundle.layout(),
            entries = bundle.entries().len(),
            "Extracting bundle"
        );

        let mut run = Extraction::new(self);
        match bundle.layout() {
            PackLayout::Files => run.extract_entries(bundle)?,
            PackLayout::Archive => {
                for layer in bundle.layers() {
                    run.extract_archive(layer)?;
                }
            }
        }
        let report = run.finish()?;

        tracing::info!(
            dest = %self.root.display(),
            files = report.files,
            directories = report.directories,
            symlinks = report.symlinks,
            bytes = report.bytes,
            "Bundle extracted"
        );

        Ok(report)
    }

    /// Apply the strip prefix to an entry path.
    ///
    /// Returns `None` for entries skipped by the unmatched-prefix policy. An
    /// empty result names the destination root.
    fn map_path<'p>(&self, path: &'p str) -> Result<Option<Vec<&'p str>>> {
        let segments = split_relative(path)?;
        if self.prefix.is_empty() {
            return Ok(Some(segments));
        }

        let n = self.prefix.len();
        let matched = segments.len() >= n
            && segments[..n]
                .iter()
                .zip(&self.prefix)
                .all(|(s, p)| *s == p.as_str());
        if matched {
            return Ok(Some(segments[n..].to_vec()));
        }

        match self.policy.unmatched_prefix {
            UnmatchedPrefix::Keep => Ok(Some(segments)),
            UnmatchedPrefix::Skip => {
                tracing::debug!(path, "Skipping entry outside strip prefix");
                Ok(None)
            }
            UnmatchedPrefix::Reject => Err(BundleError::SecurityViolation(format!(
                "entry '{}' does not match strip prefix '{}'",
                path,
                self.prefix.join("/")
            ))),
        }
    }

    fn file_mode(&self, mode: u32) -> u32 {
        if self.policy.preserve_permissions {
            mode & 0o7777
        } else if mode & 0o111 != 0 {
            0o755
        } else {
            0o644
        }
    }

    fn dir_mode(&self, mode: u32) -> u32 {
        if self.policy.preserve_permissions {
            mode & 0o7777
        } else {
            0o755
        }
    }
}

/// Extract `bundle` into `dest` under `policy`.
pub fn extract_bundle(
    bundle: &Bundle,
    dest: impl AsRef<Path>,
    policy: &ExtractionPolicy,
) -> Result<ExtractionReport> {
    ExtractionGuard::new(dest, policy)?.extract(bundle)
}

/// State of one extraction run.
struct Extraction<'g> {
    guard: &'g ExtractionGuard,
    report: ExtractionReport,
    /// Directory modes, applied once every child is written
    dir_modes: Vec<(PathBuf, u32)>,
    /// Symlinks created, with their entry paths
    links: Vec<(PathBuf, String)>,
}

impl<'g> Extraction<'g> {
    fn new(guard: &'g ExtractionGuard) -> Self {
        Self {
            guard,
            report: ExtractionReport::default(),
            dir_modes: Vec::new(),
            links: Vec::new(),
        }
    }

    fn policy(&self) -> &ExtractionPolicy {
        &self.guard.policy
    }

    fn extract_entries(&mut self, bundle: &Bundle) -> Result<()> {
        for entry in bundle.entries() {
            match entry.kind {
                EntryKind::Directory => self.directory(&entry.path, entry.mode)?,
                EntryKind::File => {
                    let blob = entry
                        .digest
                        .as_deref()
                        .and_then(|digest| bundle.resolve(digest))
                        .ok_or_else(|| {
                            BundleError::InvalidOption(format!(
                                "entry '{}' has no content in the bundle",
                                entry.path
                            ))
                        })?;
                    self.file(&entry.path, entry.mode, blob.size(), blob.data())?;
                }
                EntryKind::Symlink => {
                    let target = entry.link_target.as_deref().ok_or_else(|| {
                        BundleError::InvalidOption(format!(
                            "symlink '{}' has no target",
                            entry.path
                        ))
                    })?;
                    self.symlink(&entry.path, target)?;
                }
            }
        }
        Ok(())
    }

    fn extract_archive(&mut self, layer: &Blob) -> Result<()> {
        if layer.media_type() != BUNDLE_ARCHIVE_MEDIA_TYPE {
            return Err(BundleError::InvalidOption(format!(
                "layer {} has media type {}, expected {}",
                layer.digest(),
                layer.media_type(),
                BUNDLE_ARCHIVE_MEDIA_TYPE
            )));
        }

        let malformed = |e: io::Error| {
            BundleError::SerializationError(format!(
                "malformed archive layer {}: {}",
                layer.digest(),
                e
            ))
        };

        let mut archive = Archive::new(GzDecoder::new(layer.data()));
        for entry in archive.entries().map_err(malformed)? {
            let mut entry = entry.map_err(malformed)?;
            let path = String::from_utf8(entry.path_bytes().into_owned()).map_err(|_| {
                BundleError::InvalidOption(format!(
                    "non-UTF-8 entry path in layer {}",
                    layer.digest()
                ))
            })?;
            let entry_type = entry.header().entry_type();
            let mode = entry.header().mode().map_err(malformed)?;

            match entry_type {
                EntryType::Directory => self.directory(&path, mode)?,
                EntryType::Regular | EntryType::Continuous => {
                    let size = entry.size();
                    self.file(&path, mode, size, &mut entry)?;
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name_bytes()
                        .map(|name| String::from_utf8(name.into_owned()))
                        .transpose()
                        .map_err(|_| {
                            BundleError::InvalidOption(format!(
                                "non-UTF-8 symlink target for '{}'",
                                path
                            ))
                        })?
                        .unwrap_or_default();
                    self.symlink(&path, &target)?;
                }
                EntryType::Link => {
                    return Err(BundleError::SecurityViolation(format!(
                        "hard link entry '{}' is not allowed",
                        path
                    )));
                }
                EntryType::Char | EntryType::Block | EntryType::Fifo => {
                    return Err(BundleError::SecurityViolation(format!(
                        "device entry '{}' is not allowed",
                        path
                    )));
                }
                other => {
                    tracing::warn!(path = %path, entry_type = ?other, "Skipping unsupported archive entry");
                }
            }
        }
        Ok(())
    }

    fn directory(&mut self, path: &str, mode: u32) -> Result<()> {
        let segments = match self.guard.map_path(path)? {
            Some(segments) => segments,
            None => return Ok(()),
        };
        // The strip prefix itself maps onto the destination root.
        if segments.is_empty() {
            return Ok(());
        }

        self.admit_entry(path)?;
        let target = self.prepare_target(&segments)?;

        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                fs::remove_file(&target).map_err(|e| BundleError::io(&target, e))?;
                fs::create_dir(&target).map_err(|e| BundleError::io(&target, e))?;
            }
            Ok(_) => return Err(not_a_directory(&target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&target).map_err(|e| BundleError::io(&target, e))?;
            }
            Err(e) => return Err(BundleError::io(&target, e)),
        }

        tracing::debug!(path, "Created directory");
        self.dir_modes.push((target, self.guard.dir_mode(mode)));
        self.report.directories += 1;
        Ok(())
    }

    fn file(&mut self, path: &str, mode: u32, size: u64, content: impl Read) -> Result<()> {
        let segments = match self.guard.map_path(path)? {
            Some(segments) => segments,
            None => return Ok(()),
        };
        if segments.is_empty() {
            return Err(BundleError::SecurityViolation(format!(
                "file entry '{}' maps onto the destination root",
                path
            )));
        }

        self.admit_entry(path)?;
        if size > self.policy().max_file_size {
            return Err(BundleError::SecurityViolation(format!(
                "file '{}' is {} bytes, limit is {}",
                path,
                size,
                self.policy().max_file_size
            )));
        }
        let total = self.report.bytes.checked_add(size);
        if total.map_or(true, |total| total > self.policy().max_size) {
            return Err(BundleError::SecurityViolation(format!(
                "extraction would exceed {} bytes at '{}'",
                self.policy().max_size,
                path
            )));
        }

        let target = self.prepare_target(&segments)?;
        clear_target(&target)?;

        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| BundleError::io(&target, e))?;
        let written =
            io::copy(&mut content.take(size), &mut out).map_err(|e| BundleError::io(&target, e))?;
        if written != size {
            return Err(BundleError::io(
                &target,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, got {}", size, written),
                ),
            ));
        }
        drop(out);
        set_mode(&target, self.guard.file_mode(mode))?;

        tracing::debug!(path, bytes = written, "Wrote file");
        self.report.files += 1;
        self.report.bytes += written;
        Ok(())
    }

    fn symlink(&mut self, path: &str, link_target: &str) -> Result<()> {
        let segments = match self.guard.map_path(path)? {
            Some(segments) => segments,
            None => return Ok(()),
        };
        if segments.is_empty() {
            return Err(BundleError::SecurityViolation(format!(
                "symlink entry '{}' maps onto the destination root",
                path
            )));
        }

        self.admit_entry(path)?;
        let target = self.prepare_target(&segments)?;

        // Resolve from where the link actually lands, after parent symlinks.
        let relative = target
            .strip_prefix(&self.guard.root)
            .map_err(|_| escapes(path))?
            .to_path_buf();
        let position: Vec<&str> = relative
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        link_stays_within(&position, link_target)?;
        if let Some((_, link_dir)) = position.split_last() {
            resolve_link_within(&self.guard.root, link_dir, path, link_target)?;
        }

        clear_target(&target)?;
        create_symlink(link_target, &target)?;
        self.links.push((target, path.to_string()));

        tracing::debug!(path, target = link_target, "Created symlink");
        self.report.symlinks += 1;
        Ok(())
    }

    fn recheck_link(&self, link: &Path, path: &str) -> Result<()> {
        let link_target = match fs::read_link(link) {
            Ok(target) => target,
            // replaced by a later entry
            Err(_) => return Ok(()),
        };
        let link_dir = link
            .parent()
            .and_then(|dir| dir.strip_prefix(&self.guard.root).ok())
            .ok_or_else(|| escapes(path))?;
        let link_dir: Vec<&str> = link_dir
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();

        let checked = match link_target.to_str() {
            Some(target) => {
                resolve_link_within(&self.guard.root, &link_dir, path, target).map(|_| ())
            }
            None => Err(escapes(path)),
        };
        if let Err(e) = checked {
            tracing::warn!(path, error = %e, "Removing symlink that resolves outside the destination");
            fs::remove_file(link).map_err(|e| BundleError::io(link, e))?;
            return Err(e);
        }
        Ok(())
    }

    fn admit_entry(&self, path: &str) -> Result<()> {
        if self.report.entries() + 1 > self.policy().max_files {
            return Err(BundleError::SecurityViolation(format!(
                "extraction would exceed {} entries at '{}'",
                self.policy().max_files,
                path
            )));
        }
        Ok(())
    }

    /// Resolve `segments` to a path under the root, creating missing parents.
    ///
    /// Parents that already exist as symlinks are followed only when they
    /// resolve to a directory inside the root.
    fn prepare_target(&self, segments: &[&str]) -> Result<PathBuf> {
        let root = &self.guard.root;
        let (name, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Ok(root.clone()),
        };

        let mut current = root.clone();
        for segment in parents {
            let next = current.join(segment);
            match fs::symlink_metadata(&next) {
                Ok(meta) if meta.is_dir() => current = next,
                Ok(meta) if meta.file_type().is_symlink() => {
                    let resolved = next
                        .canonicalize()
                        .map_err(|_| escapes(&segments.join("/")))?;
                    if !resolved.starts_with(root) || !resolved.is_dir() {
                        return Err(escapes(&segments.join("/")));
                    }
                    current = resolved;
                }
                Ok(_) => return Err(not_a_directory(&next)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&next).map_err(|e| BundleError::io(&next, e))?;
                    current = next;
                }
                Err(e) => return Err(BundleError::io(&next, e)),
            }
        }

        Ok(current.join(name))
    }

    /// Recheck every symlink against the final tree, then apply directory
    /// modes deepest first.
    fn finish(mut self) -> Result<ExtractionReport> {
        // Later entries can change what an earlier link resolves through.
        for (link, path) in &self.links {
            self.recheck_link(link, path)?;
        }

        self.dir_modes
            .sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in &self.dir_modes {
            set_mode(path, *mode)?;
        }
        Ok(self.report)
    }
}

fn escapes(path: &str) -> BundleError {
    BundleError::SecurityViolation(format!("entry path escapes destination: '{}'", path))
}

fn not_a_directory(path: &Path) -> BundleError {
    BundleError::io(
        path,
        io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
    )
}

/// Remove a file or symlink at `target` so it is never written through.
fn clear_target(target: &Path) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => Err(BundleError::io(
            target,
            io::Error::new(io::ErrorKind::AlreadyExists, "a directory is in the way"),
        )),
        Ok(_) => fs::remove_file(target).map_err(|e| BundleError::io(target, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BundleError::io(target, e)),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| BundleError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| BundleError::io(link, e))
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    tracing::warn!(link = %link.display(), target, "Symlinks are not supported on this platform, skipping");
    Ok(())
}
