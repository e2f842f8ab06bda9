// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide storage seal (C6).
//!
//! Before `seal()`, storage adapters may be constructed freely. After
//! `seal()`, every adapter factory must present a 256-bit governance
//! capability — minted once, at seal time, by a CSPRNG — or it is refused
//! with `GOVERNANCE_BYPASS_DETECTED`. The capability is not a sentinel or
//! an interned name; it cannot be reconstructed by a third party.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use gov_errors::{ErrorCode, GovError};
use std::sync::Mutex;

/// Environment variable consulted by [`unseal`] to refuse running outside
/// of tests.
pub const ENVIRONMENT_VAR: &str = "MATHISON_ENVIRONMENT";

struct SealState {
    capability: [u8; 32],
    sealed_at: DateTime<Utc>,
}

static SEAL: Mutex<Option<SealState>> = Mutex::new(None);

/// A 256-bit governance capability minted by [`seal`]. Opaque: the only
/// operation offered is a constant-time comparison via [`assert_capability`].
#[derive(Clone)]
pub struct GovernanceCapability([u8; 32]);

impl GovernanceCapability {
    /// Raw bytes, for transmission across the executor/adapter boundary.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for GovernanceCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GovernanceCapability(..)")
    }
}

/// Errors raised by [`unseal`].
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// `unseal` was called while `MATHISON_ENVIRONMENT=production`.
    #[error("refusing to unseal: {} indicates production", ENVIRONMENT_VAR)]
    RefusedInProduction,
}

/// Move the process to sealed, minting a governance capability if this is
/// the first call. Idempotent: subsequent calls return the same capability.
pub fn seal() -> GovernanceCapability {
    let mut guard = SEAL.lock().expect("seal mutex poisoned");
    if let Some(state) = guard.as_ref() {
        return GovernanceCapability(state.capability);
    }
    let capability = gov_crypto::random_token();
    *guard = Some(SealState { capability, sealed_at: Utc::now() });
    tracing::warn!(target: "gov.seal", "process storage seal engaged");
    GovernanceCapability(capability)
}

/// Whether the process is currently sealed.
#[must_use]
pub fn is_sealed() -> bool {
    SEAL.lock().expect("seal mutex poisoned").is_some()
}

/// When the process was sealed, if it is.
#[must_use]
pub fn sealed_at() -> Option<DateTime<Utc>> {
    SEAL.lock().expect("seal mutex poisoned").as_ref().map(|s| s.sealed_at)
}

/// Assert that a storage adapter may be constructed.
///
/// Before `seal()`, always permits. After, requires `capability` to be
/// `Some` and to equal the stored governance capability byte-for-byte
/// (constant-time compare).
///
/// # Errors
///
/// Returns [`ErrorCode::GovernanceBypassDetected`] if the process is
/// sealed and `capability` is missing or does not match.
pub fn assert_capability(capability: Option<&[u8]>) -> Result<(), GovError> {
    let guard = SEAL.lock().expect("seal mutex poisoned");
    let Some(state) = guard.as_ref() else {
        return Ok(());
    };
    match capability {
        Some(bytes) if gov_crypto::constant_time_equal(bytes, &state.capability) => Ok(()),
        _ => {
            tracing::error!(target: "gov.seal", "storage adapter construction attempted without a valid governance capability");
            Err(GovError::new(
                ErrorCode::GovernanceBypassDetected,
                "storage adapter construction requires the governance capability minted at seal time",
            ))
        }
    }
}

/// Testing-only reset to unsealed. Refuses to run if
/// [`ENVIRONMENT_VAR`] is set to `"production"` (case-insensitive).
///
/// # Errors
///
/// Returns [`SealError::RefusedInProduction`] if the environment indicates
/// production.
pub fn unseal() -> Result<(), SealError> {
    if std::env::var(ENVIRONMENT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("production")) {
        return Err(SealError::RefusedInProduction);
    }
    let mut guard = SEAL.lock().expect("seal mutex poisoned");
    *guard = None;
    tracing::warn!(target: "gov.seal", "process storage seal reset (test-only path)");
    Ok(())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn pre_seal_always_permits() {
        let _ = unseal();
        assert!(assert_capability(None).is_ok());
    }

    #[test]
    #[serial]
    fn seal_is_idempotent_and_gates_construction() {
        let _ = unseal();
        let cap = seal();
        assert!(is_sealed());

        assert!(assert_capability(None).is_err());
        assert!(assert_capability(Some(cap.as_bytes())).is_ok());

        let cap_again = seal();
        assert_eq!(cap.as_bytes(), cap_again.as_bytes());
        let _ = unseal();
    }

    #[test]
    #[serial]
    fn fresh_reseal_after_unseal_mints_new_randomness() {
        let _ = unseal();
        let cap1 = seal();
        unseal().unwrap();
        let cap2 = seal();
        assert_ne!(cap1.as_bytes(), cap2.as_bytes());
        let _ = unseal();
    }

    #[test]
    #[serial]
    fn unseal_refuses_in_production() {
        let _ = unseal();
        // SAFETY: tests run single-threaded for this module via `serial`.
        unsafe {
            std::env::set_var(ENVIRONMENT_VAR, "production");
        }
        let result = unseal();
        unsafe {
            std::env::remove_var(ENVIRONMENT_VAR);
        }
        assert!(matches!(result, Err(SealError::RefusedInProduction)));
    }
}
