//! JSON Canonicalization Scheme (RFC 8785) for action and context binding.
//!
//! Approval tokens bind to `sha256(JCS(value))`, so two logically equal JSON
//! values must always hash the same regardless of key order or whitespace.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize a value to JCS (RFC 8785) canonical JSON bytes.
///
/// # Errors
///
/// Returns error if serialization fails (e.g., lone surrogates in strings).
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_jcs::to_vec(value).context("JCS canonicalization failed")
}

/// Serialize to JCS canonical JSON string.
pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    serde_jcs::to_string(value).context("JCS canonicalization failed")
}

/// `sha256:<lowercase-hex>` of raw bytes.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// `sha256:<lowercase-hex>` of the canonical form of `value`.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_digest(&to_vec(value)?))
}
