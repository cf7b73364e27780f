//! SHA-256 content digests.

use std::io::Read;
use std::path::Path;

use a3s_bundle_core::error::{BundleError, Result};
use sha2::{Digest, Sha256};

/// Algorithm prefix of every digest produced by this crate.
pub const SHA256_PREFIX: &str = "sha256:";

/// Compute the hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the `sha256:<hex>` digest of raw bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, sha256_hex(data))
}

/// Stream a file through SHA-256, returning the digest and byte count.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path).map_err(|e| BundleError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| BundleError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((
        format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())),
        total,
    ))
}

/// Hex part of a digest, without the algorithm prefix.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Check that `data` hashes to `expected`.
pub fn verify_digest(expected: &str, data: &[u8]) -> Result<()> {
    if !expected.starts_with(SHA256_PREFIX) {
        return Err(BundleError::InvalidOption(format!(
            "Unsupported digest algorithm: {}",
            expected
        )));
    }
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(BundleError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
