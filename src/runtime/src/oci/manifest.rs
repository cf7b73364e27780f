//! Bundle manifests.
//!
//! A bundle is published as an OCI image manifest whose config blob is the
//! bundle index: the ordered entry list plus the platform the bundle targets.
//! Layers are either one raw blob per distinct file content or a single
//! tar+gzip archive, depending on the pack layout.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use a3s_bundle_core::config::PackLayout;
use a3s_bundle_core::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

use super::digest::{sha256_digest, verify_digest};
use super::entry::{BundleEntry, EntryKind};
use super::pack::PackedBundle;

/// OCI image manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Artifact type advertised on bundle manifests.
pub const BUNDLE_ARTIFACT_TYPE: &str = "application/vnd.a3s.bundle.v1";

/// Media type of the bundle index (config blob).
pub const BUNDLE_CONFIG_MEDIA_TYPE: &str = "application/vnd.a3s.bundle.config.v1+json";

/// Media type of a raw file layer.
pub const BUNDLE_FILE_MEDIA_TYPE: &str = "application/vnd.a3s.bundle.file.v1";

/// Media type of an archive layer.
pub const BUNDLE_ARCHIVE_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Well-known OCI annotation keys.
pub mod annotations {
    pub const TITLE: &str = "org.opencontainers.image.title";
    pub const VERSION: &str = "org.opencontainers.image.version";
    pub const SOURCE: &str = "org.opencontainers.image.source";
    pub const DESCRIPTION: &str = "org.opencontainers.image.description";
}

/// Content descriptor referencing a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Immutable content-addressed bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    media_type: String,
    digest: String,
    data: Vec<u8>,
    annotations: BTreeMap<String, String>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("media_type", &self.media_type)
            .field("digest", &self.digest)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Blob {
    /// Wrap bytes, computing their digest.
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            digest: sha256_digest(&data),
            data,
            annotations: BTreeMap::new(),
        }
    }

    /// Wrap downloaded bytes, checking them against their descriptor.
    pub fn from_descriptor(descriptor: &Descriptor, data: Vec<u8>) -> Result<Self> {
        if data.len() as u64 != descriptor.size {
            return Err(BundleError::DigestMismatch {
                expected: format!("{} ({} bytes)", descriptor.digest, descriptor.size),
                actual: format!("{} bytes", data.len()),
            });
        }
        verify_digest(&descriptor.digest, &data)?;
        Ok(Self {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            data,
            annotations: descriptor.annotations.clone().unwrap_or_default(),
        })
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size(),
            annotations: if self.annotations.is_empty() {
                None
            } else {
                Some(self.annotations.clone())
            },
        }
    }
}

/// Target platform of a bundle (`os/arch[/variant]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl FromStr for Platform {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(BundleError::InvalidOption(format!(
                "Invalid platform '{}': expected os/arch or os/arch/variant",
                s
            )));
        }
        Ok(Self {
            os: parts[0].to_string(),
            architecture: parts[1].to_string(),
            variant: parts.get(2).map(|v| v.to_string()),
        })
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Config blob of a bundle: layout, platform and every entry in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIndex {
    #[serde(default)]
    pub layout: PackLayout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default)]
    pub entries: Vec<BundleEntry>,
}

impl BundleIndex {
    pub fn platform(&self) -> Option<Platform> {
        match (&self.os, &self.architecture) {
            (Some(os), Some(architecture)) => Some(Platform {
                os: os.clone(),
                architecture: architecture.clone(),
                variant: self.variant.clone(),
            }),
            _ => None,
        }
    }
}

/// OCI image manifest of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl BundleManifest {
    /// Canonical JSON encoding.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Digest of the canonical JSON encoding.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.to_json()?))
    }

    /// Structural checks applied to manifests fetched from a registry.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(BundleError::NonTransientTransport {
                operation: "validate manifest".to_string(),
                message: format!("unsupported schema version {}", self.schema_version),
            });
        }
        if self.config.media_type != BUNDLE_CONFIG_MEDIA_TYPE {
            return Err(BundleError::NonTransientTransport {
                operation: "validate manifest".to_string(),
                message: format!(
                    "config media type '{}' is not a bundle index",
                    self.config.media_type
                ),
            });
        }
        Ok(())
    }
}

/// A complete bundle: manifest, index and every referenced blob.
#[derive(Debug, Clone)]
pub struct Bundle {
    manifest: BundleManifest,
    config: Blob,
    index: BundleIndex,
    layers: Vec<Blob>,
    by_digest: HashMap<String, usize>,
}

impl Bundle {
    /// Assemble a bundle, checking that every reference resolves.
    pub fn from_parts(manifest: BundleManifest, config: Blob, layers: Vec<Blob>) -> Result<Self> {
        if manifest.config.digest != config.digest() {
            return Err(BundleError::InvalidOption(format!(
                "manifest config {} does not match config blob {}",
                manifest.config.digest,
                config.digest()
            )));
        }

        let index: BundleIndex = serde_json::from_slice(config.data()).map_err(|e| {
            BundleError::NonTransientTransport {
                operation: "parse bundle index".to_string(),
                message: format!("malformed bundle index {}: {}", config.digest(), e),
            }
        })?;

        let by_digest: HashMap<String, usize> = layers
            .iter()
            .enumerate()
            .map(|(i, blob)| (blob.digest().to_string(), i))
            .collect();

        for descriptor in &manifest.layers {
            if !by_digest.contains_key(&descriptor.digest) {
                return Err(BundleError::InvalidOption(format!(
                    "manifest layer {} has no blob",
                    descriptor.digest
                )));
            }
        }

        if index.layout == PackLayout::Files {
            for entry in index.entries.iter().filter(|e| e.kind == EntryKind::File) {
                let resolved = entry
                    .digest
                    .as_ref()
                    .map_or(false, |d| by_digest.contains_key(d));
                if !resolved {
                    return Err(BundleError::InvalidOption(format!(
                        "entry '{}' references unresolvable content {}",
                        entry.path,
                        entry.digest.as_deref().unwrap_or("<none>")
                    )));
                }
            }
        }

        Ok(Self {
            manifest,
            config,
            index,
            layers,
            by_digest,
        })
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub fn config(&self) -> &Blob {
        &self.config
    }

    pub fn index(&self) -> &BundleIndex {
        &self.index
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.index.entries
    }

    pub fn layers(&self) -> &[Blob] {
        &self.layers
    }

    pub fn layout(&self) -> PackLayout {
        self.index.layout
    }

    pub fn platform(&self) -> Option<Platform> {
        self.index.platform()
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.manifest.annotations
    }

    /// Look up a layer blob by digest.
    pub fn resolve(&self, digest: &str) -> Option<&Blob> {
        self.by_digest.get(digest).map(|&i| &self.layers[i])
    }

    /// Total bytes of all layer blobs.
    pub fn content_size(&self) -> u64 {
        self.layers.iter().map(Blob::size).sum()
    }
}

/// Builds a bundle manifest from packer output.
#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder {
    annotations: BTreeMap<String, String>,
    platform: Option<String>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Copy a caller-owned annotation map.
    pub fn annotations<I, K, V>(mut self, annotations: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.annotations
            .extend(annotations.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Target platform, `os/arch` or `os/arch/variant`.
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn build(&self, packed: PackedBundle) -> Result<Bundle> {
        if let Some(key) = self.annotations.keys().find(|k| k.trim().is_empty()) {
            return Err(BundleError::InvalidOption(format!(
                "Invalid annotation key '{}'",
                key
            )));
        }

        let platform = self
            .platform
            .as_deref()
            .map(Platform::from_str)
            .transpose()?;

        let index = BundleIndex {
            layout: packed.layout,
            os: platform.as_ref().map(|p| p.os.clone()),
            architecture: platform.as_ref().map(|p| p.architecture.clone()),
            variant: platform.as_ref().and_then(|p| p.variant.clone()),
            entries: packed.entries,
        };
        let config = Blob::new(BUNDLE_CONFIG_MEDIA_TYPE, serde_json::to_vec(&index)?);

        let manifest = BundleManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            artifact_type: Some(BUNDLE_ARTIFACT_TYPE.to_string()),
            config: config.descriptor(),
            layers: packed.layers.iter().map(Blob::descriptor).collect(),
            annotations: self.annotations.clone(),
        };

        tracing::debug!(
            layers = manifest.layers.len(),
            entries = index.entries.len(),
            platform = ?self.platform,
            "Built bundle manifest"
        );

        Bundle::from_parts(manifest, config, packed.layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_bundle_core::error::ErrorKind;

    fn packed_one_file() -> PackedBundle {
        let blob = Blob::new(BUNDLE_FILE_MEDIA_TYPE, b"hello".to_vec())
            .with_annotation(annotations::TITLE, "a.txt");
        PackedBundle {
            layout: PackLayout::Files,
            entries: vec![BundleEntry::file("a.txt", 0o644, 5, blob.digest())],
            layers: vec![blob],
        }
    }

    #[test]
    fn test_platform_parse() {
        let p: Platform = "linux/amd64".parse().unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.variant, None);

        let p: Platform = "linux/arm64/v8".parse().unwrap();
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");
    }

    #[test]
    fn test_platform_parse_invalid() {
        for bad in ["linux", "linux/", "/amd64", "a/b/c/d", "linux//v8", ""] {
            let err = bad.parse::<Platform>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidOption, "{}", bad);
        }
    }

    #[test]
    fn test_build_manifest() {
        let bundle = ManifestBuilder::new()
            .annotation(annotations::VERSION, "1.0.0")
            .platform("linux/amd64")
            .build(packed_one_file())
            .unwrap();

        let manifest = bundle.manifest();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].size, 5);
        assert_eq!(manifest.config.media_type, BUNDLE_CONFIG_MEDIA_TYPE);
        assert_eq!(
            manifest.annotations.get(annotations::VERSION).map(String::as_str),
            Some("1.0.0")
        );
        assert_eq!(bundle.platform().unwrap().to_string(), "linux/amd64");
        assert!(bundle.resolve(&manifest.layers[0].digest).is_some());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_build_invalid_platform() {
        let err = ManifestBuilder::new()
            .platform("linux")
            .build(packed_one_file())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
    }

    #[test]
    fn test_build_empty_annotation_key() {
        let err = ManifestBuilder::new()
            .annotation("", "x")
            .build(packed_one_file())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
    }

    #[test]
    fn test_annotations_are_copied() {
        let mut caller = HashMap::new();
        caller.insert("com.example.team".to_string(), "infra".to_string());
        let builder = ManifestBuilder::new().annotations(caller.clone());
        caller.insert("com.example.late".to_string(), "x".to_string());

        let bundle = builder.build(packed_one_file()).unwrap();
        assert_eq!(bundle.annotations().len(), 1);
        assert!(bundle.annotations().contains_key("com.example.team"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = ManifestBuilder::new()
            .annotation("b", "2")
            .annotation("a", "1")
            .build(packed_one_file())
            .unwrap();
        let b = ManifestBuilder::new()
            .annotation("a", "1")
            .annotation("b", "2")
            .build(packed_one_file())
            .unwrap();
        assert_eq!(a.manifest().to_json().unwrap(), b.manifest().to_json().unwrap());
        assert_eq!(a.manifest().digest().unwrap(), b.manifest().digest().unwrap());
    }

    #[test]
    fn test_unresolvable_entry_rejected() {
        let mut packed = packed_one_file();
        packed
            .entries
            .push(BundleEntry::file("missing.txt", 0o644, 3, "sha256:deadbeef"));
        let err = ManifestBuilder::new().build(packed).unwrap_err();
        assert!(err.to_string().contains("missing.txt"));
    }

    #[test]
    fn test_blob_from_descriptor() {
        let blob = Blob::new(BUNDLE_FILE_MEDIA_TYPE, b"hello".to_vec());
        let descriptor = blob.descriptor();

        assert!(Blob::from_descriptor(&descriptor, b"hello".to_vec()).is_ok());

        let err = Blob::from_descriptor(&descriptor, b"hullo".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DigestMismatch);

        let err = Blob::from_descriptor(&descriptor, b"hello!".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DigestMismatch);
    }

    #[test]
    fn test_manifest_validate_rejects_foreign_config() {
        let mut manifest = ManifestBuilder::new()
            .build(packed_one_file())
            .unwrap()
            .manifest()
            .clone();
        manifest.config.media_type = "application/vnd.oci.image.config.v1+json".to_string();
        let err = manifest.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransientTransport);
    }

    #[test]
    fn test_manifest_json_shape() {
        let bundle = ManifestBuilder::new().build(packed_one_file()).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&bundle.manifest().to_json().unwrap()).unwrap();
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["mediaType"], OCI_MANIFEST_MEDIA_TYPE);
        assert_eq!(value["artifactType"], BUNDLE_ARTIFACT_TYPE);
        assert_eq!(value["layers"][0]["annotations"][annotations::TITLE], "a.txt");
        assert!(value.get("annotations").is_none());
    }
}
