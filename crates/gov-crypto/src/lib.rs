// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cryptographic primitives shared across the governance substrate (C1).
//!
//! Four operations, all deliberately small and dependency-light: canonical
//! content hashing (SHA-256), keyed chain signing (HMAC-SHA-256), random
//! token minting (OS CSPRNG), and constant-time byte comparison. Every other
//! crate in the workspace builds its tamper-evidence on top of these.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use gov_errors::{ErrorCode, GovError};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

type HmacSha256 = Hmac<Sha256>;

/// The process-wide HMAC key, initialized once at boot from a 32-byte secret.
static HMAC_KEY: OnceLock<Vec<u8>> = OnceLock::new();

/// Initialize the process-wide HMAC key. Idempotent: a second call with a
/// different secret is rejected rather than silently re-keying a process
/// that may already have signed receipts under the original key.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] if the key was already initialized with a
/// different secret.
pub fn init_hmac_key(secret: &[u8]) -> Result<(), GovError> {
    match HMAC_KEY.get() {
        None => {
            let _ = HMAC_KEY.set(secret.to_vec());
            Ok(())
        }
        Some(existing) if constant_time_equal(existing, secret) => Ok(()),
        Some(_) => Err(GovError::new(
            ErrorCode::Internal,
            "HMAC key already initialized with a different secret",
        )),
    }
}

/// True once [`init_hmac_key`] has successfully run.
#[must_use]
pub fn hmac_key_initialized() -> bool {
    HMAC_KEY.get().is_some()
}

fn hmac_key() -> Result<&'static [u8], GovError> {
    HMAC_KEY
        .get()
        .map(Vec::as_slice)
        .ok_or_else(|| GovError::new(ErrorCode::Internal, "HMAC key not initialized"))
}

/// Serialize `value` to canonical JSON: sorted keys, no insignificant
/// whitespace, UTF-8. `serde_json::Map` is backed by a `BTreeMap` (the
/// default build does not enable the `preserve_order` feature), so plain
/// `to_string` already yields lexicographically sorted keys at every
/// nesting level.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] if `value` cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, GovError> {
    serde_json::to_string(value).map_err(|e| {
        GovError::new(ErrorCode::Internal, "failed to serialize value to canonical JSON")
            .with_source(e)
    })
}

/// Compute the hex-encoded SHA-256 digest of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the hex-encoded SHA-256 digest over the canonical JSON
/// serialization of `value`.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] if `value` cannot be serialized.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, GovError> {
    let json = canonical_json(value)?;
    Ok(sha256_hex(json.as_bytes()))
}

/// Compute an HMAC-SHA-256 signature over `content_hash | prev_hash |
/// sequence_number`, keyed by the process-wide HMAC key.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] if the key has not been initialized via
/// [`init_hmac_key`] — signing fails closed rather than using a default key.
pub fn sign(content_hash: &str, prev_hash: &str, sequence_number: u64) -> Result<String, GovError> {
    let key = hmac_key()?;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| GovError::new(ErrorCode::Internal, "invalid HMAC key length").with_source(e))?;
    mac.update(content_hash.as_bytes());
    mac.update(b"|");
    mac.update(prev_hash.as_bytes());
    mac.update(b"|");
    mac.update(sequence_number.to_string().as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Verify a previously computed [`sign`] signature in constant time.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] if the key has not been initialized.
pub fn verify(
    signature: &str,
    content_hash: &str,
    prev_hash: &str,
    sequence_number: u64,
) -> Result<bool, GovError> {
    let expected = sign(content_hash, prev_hash, sequence_number)?;
    Ok(constant_time_equal(expected.as_bytes(), signature.as_bytes()))
}

/// Mint 32 bytes of cryptographically random material from the OS CSPRNG.
#[must_use]
pub fn random_token() -> [u8; 32] {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Length-safe constant-time byte comparison.
///
/// Unequal lengths short-circuit to `false` without leaking timing
/// information beyond the length itself — the same tradeoff every
/// constant-time-compare routine in this corpus makes (there is no way to
/// compare unequal-length buffers in true constant time without a length
/// oracle, and the length of a token or hash is not a secret).
#[must_use]
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
