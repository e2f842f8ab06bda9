// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sealed handler registry with unforgeable internal dispatch (C5).
//!
//! Maps `intent -> (risk class, required capabilities, handler)`. Once
//! [`HandlerRegistry::seal`] is called, registration is permanently closed.
//! Invocation is gated by a [`DispatchProof`] whose inner field is private
//! to this crate — the only way to obtain one is from
//! [`HandlerRegistry::new`], so no caller outside the executor that holds
//! the matching proof can drive a handler directly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use gov_core::{CapabilityToken, HandlerMetadata, RequestContext, RiskClass};
use rand_proof::random_proof_id;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

mod rand_proof {
    //! Minimal random-id generation local to the proof mechanism, so this
    //! crate does not need a direct dependency on `gov-crypto` for a single
    //! `u64`.
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    /// A process-unique id: wall-clock nanos mixed with a monotonic counter.
    /// Not cryptographically secure — it does not need to be, since the
    /// security property here is type-level unforgeability (the field that
    /// carries this id is private), not secrecy of the id's value.
    pub fn random_proof_id() -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        nanos ^ counter.rotate_left(32)
    }
}

/// A registered handler's executable body.
///
/// Handlers receive a sanitized payload and the capability tokens issued
/// for this decision, and return a result payload or a string error that
/// the executor wraps into a sanitized `HANDLER_ERROR`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler.
    async fn call(
        &self,
        ctx: &RequestContext,
        payload: serde_json::Value,
        capability_tokens: &[CapabilityToken],
    ) -> Result<serde_json::Value, String>;
}

struct Entry {
    metadata: HandlerMetadata,
    handler: Arc<dyn Handler>,
}

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `register` was called after `seal`.
    #[error("registry is sealed")]
    Sealed,
    /// `register` was called twice for the same intent.
    #[error("intent already registered: {0}")]
    DuplicateIntent(String),
    /// `_internal_invoke` was called for an intent with no registered handler.
    #[error("unknown intent: {0}")]
    UnknownIntent(String),
    /// `_internal_invoke` was called with a proof that does not match this registry.
    #[error("dispatch proof rejected: caller is not the executor that owns this registry")]
    Forbidden,
    /// The handler body returned an error.
    #[error("handler error: {0}")]
    HandlerFailed(String),
}

/// An unforgeable, process-local identity minted once per [`HandlerRegistry`].
///
/// The inner field is private to this crate. The only public way to obtain
/// a `DispatchProof` is as the second element of [`HandlerRegistry::new`]'s
/// return value — there is no path by which code outside the executor that
/// constructed the registry can produce one.
#[derive(Clone, Copy)]
pub struct DispatchProof(u64);

/// The sealed handler registry (C5).
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    sealed: AtomicBool,
    proof_id: u64,
}

impl HandlerRegistry {
    /// Construct a new, open registry and the [`DispatchProof`] that alone
    /// can drive it.
    #[must_use]
    pub fn new() -> (Self, DispatchProof) {
        let proof_id = random_proof_id();
        let registry = Self {
            entries: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            proof_id,
        };
        (registry, DispatchProof(proof_id))
    }

    /// Register a handler for `intent`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sealed`] if the registry is sealed, or
    /// [`RegistryError::DuplicateIntent`] if `intent` is already registered.
    pub fn register(
        &self,
        id: impl Into<String>,
        intent: impl Into<String>,
        risk_class: RiskClass,
        required_capabilities: Vec<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(RegistryError::Sealed);
        }
        let intent = intent.into();
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.contains_key(&intent) {
            return Err(RegistryError::DuplicateIntent(intent));
        }
        let metadata = HandlerMetadata { id: id.into(), intent: intent.clone(), risk_class, required_capabilities };
        entries.insert(intent.clone(), Entry { metadata, handler });
        tracing::info!(target: "gov.registry", intent = %intent, "handler registered");
        Ok(())
    }

    /// One-way transition to sealed. Idempotent.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            tracing::info!(target: "gov.registry", "handler registry sealed");
        }
    }

    /// Whether the registry has been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Look up public metadata for `intent`. Never exposes the handler body.
    #[must_use]
    pub fn metadata(&self, intent: &str) -> Option<HandlerMetadata> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(intent)
            .map(|e| e.metadata.clone())
    }

    /// List metadata for every registered intent.
    #[must_use]
    pub fn list_metadata(&self) -> Vec<HandlerMetadata> {
        self.entries.read().expect("registry lock poisoned").values().map(|e| e.metadata.clone()).collect()
    }

    /// Invoke the handler registered for `intent`. Callable only by the
    /// holder of the matching [`DispatchProof`] — anyone else gets
    /// [`RegistryError::Forbidden`] without the handler ever running.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Forbidden`] if `proof` does not match this
    /// registry, [`RegistryError::UnknownIntent`] if no handler is
    /// registered for `intent`, or [`RegistryError::HandlerFailed`] if the
    /// handler body returns an error.
    pub async fn _internal_invoke(
        &self,
        intent: &str,
        ctx: &RequestContext,
        payload: serde_json::Value,
        capability_tokens: &[CapabilityToken],
        proof: &DispatchProof,
    ) -> Result<serde_json::Value, RegistryError> {
        if proof.0 != self.proof_id {
            tracing::error!(target: "gov.registry", intent, "rejected dispatch with non-matching proof");
            return Err(RegistryError::Forbidden);
        }
        let handler = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries.get(intent).map(|e| Arc::clone(&e.handler))
        };
        let Some(handler) = handler else {
            return Err(RegistryError::UnknownIntent(intent.to_string()));
        };
        handler
            .call(ctx, payload, capability_tokens)
            .await
            .map_err(RegistryError::HandlerFailed)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new().0
    }
}
