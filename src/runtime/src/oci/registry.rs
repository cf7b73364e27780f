//! Registry transport backed by `oci-distribution`.
//!
//! Talks to any OCI Distribution registry (Docker Hub, GHCR, Harbor, a local
//! `registry:2`, ...). Authentication is delegated to the client; failures are
//! classified into transient and non-transient errors for the transfer engine.

use a3s_bundle_core::error::{BundleError, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::manifest::BundleManifest;
use super::transport::RegistryTransport;

/// Authentication credentials for a container registry.
#[derive(Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`RegistryTransport`] over an `oci_distribution::Client`.
pub struct OciRegistryTransport {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistryTransport {
    /// HTTPS transport with anonymous authentication.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    /// HTTPS transport with the given authentication.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self::build(auth, ClientProtocol::Https)
    }

    /// Transport that speaks plain HTTP to the listed registries
    /// (e.g. `localhost:5000`) and HTTPS to everything else.
    pub fn with_insecure_registries(auth: RegistryAuth, registries: Vec<String>) -> Self {
        Self::build(auth, ClientProtocol::HttpsExcept(registries))
    }

    fn build(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    async fn authenticate(&self, reference: &Reference, operation: RegistryOperation) -> Result<()> {
        self.client
            .auth(reference, &self.auth.to_oci_auth(), operation)
            .await
            .map(|_| ())
            .map_err(|e| classify("authenticate", e))
    }
}

impl Default for OciRegistryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryTransport for OciRegistryTransport {
    async fn put_blob(&self, reference: &str, digest: &str, content: &[u8]) -> Result<()> {
        let oci_ref = parse_reference(reference)?;
        self.authenticate(&oci_ref, RegistryOperation::Push).await?;

        let location = self
            .client
            .push_blob(&oci_ref, content, digest)
            .await
            .map_err(|e| classify("put_blob", e))?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            size = content.len(),
            location = %location,
            "Uploaded blob"
        );
        Ok(())
    }

    async fn get_blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>> {
        let oci_ref = parse_reference(reference)?;
        self.authenticate(&oci_ref, RegistryOperation::Pull).await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| classify("get_blob", e))?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            size = data.len(),
            "Downloaded blob"
        );
        Ok(data)
    }

    async fn put_manifest(&self, reference: &str, manifest: &BundleManifest) -> Result<String> {
        let oci_ref = parse_reference(reference)?;
        self.authenticate(&oci_ref, RegistryOperation::Push).await?;

        let oci_manifest = to_oci_manifest(manifest)?;
        let url = self
            .client
            .push_manifest(&oci_ref, &OciManifest::Image(oci_manifest))
            .await
            .map_err(|e| classify("put_manifest", e))?;

        tracing::debug!(reference = %reference, url = %url, "Uploaded manifest");
        Ok(url)
    }

    async fn get_manifest(&self, reference: &str) -> Result<BundleManifest> {
        let oci_ref = parse_reference(reference)?;

        let (oci_manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| classify("get_manifest", e))?;

        tracing::debug!(reference = %reference, digest = %digest, "Downloaded manifest");
        from_oci_manifest(&oci_manifest)
    }
}

/// Parse a `registry-host[:port]/repository[:tag]` reference.
pub fn parse_reference(reference: &str) -> Result<Reference> {
    reference.parse::<Reference>().map_err(|e| {
        BundleError::InvalidOption(format!("Invalid OCI reference '{}': {}", reference, e))
    })
}

/// Map a client error onto the transient / non-transient taxonomy.
fn classify(operation: &str, err: OciDistributionError) -> BundleError {
    let message = err.to_string();
    let operation = operation.to_string();
    match err {
        OciDistributionError::ServerError { code, .. } if code == 404 => {
            BundleError::NotFound(format!("{}: {}", operation, message))
        }
        OciDistributionError::ServerError { code, .. } if code == 429 || code >= 500 => {
            BundleError::TransientTransport { operation, message }
        }
        OciDistributionError::ImageManifestNotFoundError(_) => {
            BundleError::NotFound(format!("{}: {}", operation, message))
        }
        OciDistributionError::RequestError(_) | OciDistributionError::IoError(_) => {
            BundleError::TransientTransport { operation, message }
        }
        _ => BundleError::NonTransientTransport { operation, message },
    }
}

fn to_oci_manifest(manifest: &BundleManifest) -> Result<OciImageManifest> {
    let value = serde_json::to_value(manifest)?;
    serde_json::from_value(value).map_err(|e| BundleError::NonTransientTransport {
        operation: "encode manifest".to_string(),
        message: e.to_string(),
    })
}

fn from_oci_manifest(manifest: &OciImageManifest) -> Result<BundleManifest> {
    let mut value = serde_json::to_value(manifest)?;
    strip_nulls(&mut value);
    serde_json::from_value(value).map_err(|e| BundleError::NonTransientTransport {
        operation: "decode manifest".to_string(),
        message: format!("malformed manifest: {}", e),
    })
}

/// Drop `null` members so optional fields fall back to their defaults.
fn strip_nulls(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}
