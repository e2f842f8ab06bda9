// SPDX-License-Identifier: MIT OR Apache-2.0
//! The stable wire data model for the governance substrate.
//!
//! If you only take one dependency from this workspace besides `gov-errors`,
//! take this one: every other crate builds on the types defined here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use gov_errors::{ErrorCode, GovError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Sentinel `prev_hash` for the first receipt in any chain (Invariant R1).
pub const GENESIS: &str = "GENESIS";

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A state in the pipeline's state machine, including the non-gated
/// bookend states `Init`, `Complete`, and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Before context normalization has completed.
    Init,
    /// Context-integrity ingress gate.
    CifIngress,
    /// Decision gate authorizing the action.
    CdiAction,
    /// Registered handler invocation.
    Handler,
    /// Decision gate validating/redacting the handler result.
    CdiOutput,
    /// Context-integrity egress gate.
    CifEgress,
    /// Terminal success state.
    Complete,
    /// Terminal failure state.
    Failed,
}

impl Stage {
    /// The five gated stages, in pipeline order. Used to validate that a
    /// completed chain contains exactly these stages, in this order.
    pub const GATED_ORDER: [Stage; 5] = [
        Stage::CifIngress,
        Stage::CdiAction,
        Stage::Handler,
        Stage::CdiOutput,
        Stage::CifEgress,
    ];

    /// The stage that follows this one on the PASS path, if any.
    #[must_use]
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::CifIngress),
            Stage::CifIngress => Some(Stage::CdiAction),
            Stage::CdiAction => Some(Stage::Handler),
            Stage::Handler => Some(Stage::CdiOutput),
            Stage::CdiOutput => Some(Stage::CifEgress),
            Stage::CifEgress => Some(Stage::Complete),
            Stage::Complete | Stage::Failed => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        f.write_str(&s)
    }
}

/// The outcome recorded on a [`StageReceipt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageResult {
    /// The stage completed successfully.
    Pass,
    /// The stage failed; the pipeline transitions to `FAILED`.
    Fail,
}

/// Risk classification attached to a handler and propagated into
/// [`DecisionMeta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// No mutation of any kind.
    ReadOnly,
    /// Low-impact mutation.
    LowRisk,
    /// Moderate-impact mutation.
    MediumRisk,
    /// High-impact, potentially irreversible mutation.
    HighRisk,
}

/// How far the degradation ladder has narrowed permissible risk classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// No degradation; the policy capsule is valid.
    None,
    /// Partial degradation; some risk classes are narrowed.
    Partial,
    /// Full degradation; only the most conservative risk classes are allowed.
    Full,
}

/// The policy capsule's freshness, as reported by the governance provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleState {
    /// The capsule is fresh.
    Valid,
    /// The capsule is present but past its freshness window.
    Stale,
    /// No capsule could be loaded.
    Missing,
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Which kind of entrypoint produced a [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// Arrived over HTTP.
    Http,
    /// Arrived over an RPC transport.
    Rpc,
    /// Issued from the CLI.
    Cli,
    /// Picked up from a background job queue.
    Worker,
}

/// Where a request came from, with taint labels for downstream policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Origin {
    /// Transport/entrypoint kind.
    pub kind: OriginKind,
    /// Taint markers (e.g. `"untrusted_input"`, `"third_party"`).
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Free-text purpose string supplied by the adapter.
    pub purpose: String,
    /// Adapter-reported client identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Origin {
    /// Construct an [`Origin`] with no taint labels and no client id.
    #[must_use]
    pub fn new(kind: OriginKind, purpose: impl Into<String>) -> Self {
        Self {
            kind,
            labels: BTreeSet::new(),
            purpose: purpose.into(),
            client_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Opaque metadata bag attached to a request.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Immutable-after-build context for a single pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RequestContext {
    /// Globally unique identifier for this invocation.
    pub trace_id: Uuid,
    /// The authenticated principal driving this request.
    pub principal_id: String,
    /// The authorization-boundary namespace this request operates in.
    pub namespace_id: String,
    /// The registered intent this request wants to perform.
    pub intent: String,
    /// Capability names requested by the caller (not yet issued tokens).
    #[serde(default)]
    pub requested_capabilities: Vec<String>,
    /// Transport/taint metadata.
    pub origin: Origin,
    /// When this context was built.
    pub created_at: DateTime<Utc>,
    /// Opaque caller-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl RequestContext {
    /// Build and validate a [`RequestContext`].
    ///
    /// Enforces that `trace_id` is non-nil and `principal_id`,
    /// `namespace_id`, and `intent` are all non-empty, matching the
    /// context-normalization step the pipeline executor runs before any
    /// receipt is emitted.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidContext`] if any required field is empty
    /// or the trace id is nil.
    pub fn build(
        trace_id: Uuid,
        principal_id: impl Into<String>,
        namespace_id: impl Into<String>,
        intent: impl Into<String>,
        origin: Origin,
    ) -> Result<Self, GovError> {
        let principal_id = principal_id.into();
        let namespace_id = namespace_id.into();
        let intent = intent.into();

        if trace_id.is_nil() {
            return Err(GovError::new(ErrorCode::InvalidContext, "trace_id must not be nil"));
        }
        if principal_id.trim().is_empty() {
            return Err(GovError::new(ErrorCode::InvalidContext, "principal_id must not be empty"));
        }
        if namespace_id.trim().is_empty() {
            return Err(GovError::new(ErrorCode::InvalidContext, "namespace_id must not be empty"));
        }
        if intent.trim().is_empty() {
            return Err(GovError::new(ErrorCode::InvalidContext, "intent must not be empty"));
        }

        Ok(Self {
            trace_id,
            principal_id,
            namespace_id,
            intent,
            requested_capabilities: Vec::new(),
            origin,
            created_at: Utc::now(),
            metadata: Metadata::new(),
        })
    }

    /// Attach requested capability names (builder-style).
    #[must_use]
    pub fn with_requested_capabilities(mut self, caps: Vec<String>) -> Self {
        self.requested_capabilities = caps;
        self
    }

    /// Attach opaque metadata (builder-style).
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// StageReceipt / ReceiptChain
// ---------------------------------------------------------------------------

/// An immutable-after-emission record of one pipeline stage's outcome.
///
/// `hash` is the SHA-256 digest (via [`gov_crypto::content_hash`]) over the
/// canonical JSON of every other field — `hash` itself is never part of the
/// hashed view.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageReceipt {
    /// Unique id for this receipt.
    pub receipt_id: Uuid,
    /// Which stage this receipt records.
    pub stage: Stage,
    /// The invocation this receipt belongs to.
    pub trace_id: Uuid,
    /// When the stage concluded.
    pub timestamp: DateTime<Utc>,
    /// PASS or FAIL.
    pub result: StageResult,
    /// Opaque stage-specific details (e.g. denial reason, handler id).
    #[serde(default)]
    pub details: Metadata,
    /// Hash of the previous receipt in this chain, or [`GENESIS`] for the first.
    pub prev_hash: String,
    /// SHA-256 hash of this receipt's other fields.
    pub hash: String,
}

/// View of a [`StageReceipt`] used for hashing — identical fields, minus `hash`.
#[derive(Serialize)]
struct StageReceiptHashView<'a> {
    receipt_id: Uuid,
    stage: Stage,
    trace_id: Uuid,
    timestamp: DateTime<Utc>,
    result: StageResult,
    details: &'a Metadata,
    prev_hash: &'a str,
}

impl StageReceipt {
    /// Build and hash a new stage receipt chained onto `prev_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Internal`] if the receipt cannot be serialized
    /// for hashing.
    pub fn new(
        trace_id: Uuid,
        stage: Stage,
        result: StageResult,
        details: Metadata,
        prev_hash: impl Into<String>,
    ) -> Result<Self, GovError> {
        let receipt_id = Uuid::new_v4();
        let timestamp = Utc::now();
        let prev_hash = prev_hash.into();

        let view = StageReceiptHashView {
            receipt_id,
            stage,
            trace_id,
            timestamp,
            result,
            details: &details,
            prev_hash: &prev_hash,
        };
        let hash = gov_crypto::content_hash(&view)?;

        Ok(Self {
            receipt_id,
            stage,
            trace_id,
            timestamp,
            result,
            details,
            prev_hash,
            hash,
        })
    }

    /// Recompute this receipt's hash and compare against the stored one.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        let view = StageReceiptHashView {
            receipt_id: self.receipt_id,
            stage: self.stage,
            trace_id: self.trace_id,
            timestamp: self.timestamp,
            result: self.result,
            details: &self.details,
            prev_hash: &self.prev_hash,
        };
        match gov_crypto::content_hash(&view) {
            Ok(recomputed) => recomputed == self.hash,
            Err(_) => false,
        }
    }
}

/// The chain of stage receipts returned alongside every pipeline response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReceiptChain {
    /// The invocation this chain belongs to.
    pub trace_id: Uuid,
    /// Receipts in append order.
    pub receipts: Vec<StageReceipt>,
    /// True iff the chain has exactly five PASS receipts in gated order.
    pub complete: bool,
    /// The hash of the last receipt, or [`GENESIS`] if the chain is empty.
    pub final_hash: String,
}

impl ReceiptChain {
    /// Build a [`ReceiptChain`] from a completed (or partial) sequence of receipts.
    #[must_use]
    pub fn new(trace_id: Uuid, receipts: Vec<StageReceipt>) -> Self {
        let complete = receipts.len() == 5
            && receipts
                .iter()
                .zip(Stage::GATED_ORDER.iter())
                .all(|(r, s)| r.stage == *s && r.result == StageResult::Pass);
        let final_hash = receipts
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());

        Self {
            trace_id,
            receipts,
            complete,
            final_hash,
        }
    }

    /// Verify internal hash-chain linkage (Invariants R1/R2) and per-receipt
    /// hash integrity.
    ///
    /// Returns the zero-based index of the first broken receipt, if any.
    #[must_use]
    pub fn verify(&self) -> ChainVerification {
        for (i, receipt) in self.receipts.iter().enumerate() {
            let expected_prev = if i == 0 {
                GENESIS.to_string()
            } else {
                self.receipts[i - 1].hash.clone()
            };
            if receipt.prev_hash != expected_prev {
                return ChainVerification { valid: false, broken_at: Some(i) };
            }
            if !receipt.verify_hash() {
                return ChainVerification { valid: false, broken_at: Some(i) };
            }
        }
        ChainVerification { valid: true, broken_at: None }
    }
}

/// Result of [`ReceiptChain::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChainVerification {
    /// Whether the entire chain verified cleanly.
    pub valid: bool,
    /// The index of the first offending receipt, if `valid` is false.
    pub broken_at: Option<usize>,
}

// ---------------------------------------------------------------------------
// CapabilityToken
// ---------------------------------------------------------------------------

/// Namespace wildcard that matches any namespace during verification
/// (Invariant K1).
pub const WILDCARD_NAMESPACE: &str = "*";

/// A short-lived, namespace-scoped authorization artifact (C4's unit of
/// record). Opaque to callers beyond its `token_id`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityToken {
    /// Unique id for this token; the effective reference callers hold.
    pub token_id: Uuid,
    /// The capability name this token grants.
    pub capability: String,
    /// The namespace this token is scoped to, or [`WILDCARD_NAMESPACE`].
    pub namespace_id: String,
    /// The principal this token was issued to.
    pub principal_id: String,
    /// When this token was minted.
    pub issued_at: DateTime<Utc>,
    /// When this token stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Adapter-specific constraints (e.g. max call count, scoped resource ids).
    #[serde(default)]
    pub constraints: Metadata,
    /// Once true, never becomes false again (Invariant K2).
    #[serde(default)]
    pub revoked: bool,
}

impl CapabilityToken {
    /// True if `namespace_id` is [`WILDCARD_NAMESPACE`] or matches this token's.
    #[must_use]
    pub fn matches_namespace(&self, namespace_id: &str) -> bool {
        self.namespace_id == WILDCARD_NAMESPACE || self.namespace_id == namespace_id
    }

    /// True if `now` is at or past [`Self::expires_at`].
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// DecisionMeta
// ---------------------------------------------------------------------------

/// The authorization decision emitted by the CDI action check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionMeta {
    /// Whether the action was authorized.
    pub allowed: bool,
    /// Human-readable reason, always present (even when allowed).
    pub reason: String,
    /// The handler's declared risk classification.
    pub risk_class: RiskClass,
    /// Capability tokens issued for this decision, if any.
    #[serde(default)]
    pub capability_tokens: Vec<CapabilityToken>,
    /// Redaction rule names CDI applied or will apply to the output.
    #[serde(default)]
    pub redaction_rules: Vec<String>,
    /// How far the degradation ladder narrowed this decision.
    pub degradation_level: DegradationLevel,
    /// When this decision was made.
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RegisteredHandler metadata
// ---------------------------------------------------------------------------

/// Publicly queryable metadata for a registered handler. Never exposes the
/// handler body itself.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HandlerMetadata {
    /// Stable handler id.
    pub id: String,
    /// The intent this handler serves.
    pub intent: String,
    /// Declared risk classification.
    pub risk_class: RiskClass,
    /// Capability names this handler requires to run.
    pub required_capabilities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Durable Receipt (C2)
// ---------------------------------------------------------------------------

/// Verdict recorded on a durable [`Receipt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The recorded action was allowed.
    Allow,
    /// The recorded action was denied.
    Deny,
}

/// One append-only audit-log entry in the durable receipt store (C2).
///
/// Distinct from [`StageReceipt`]: a `StageReceipt` is the ephemeral,
/// SHA-256-chained record returned to the caller for a single invocation;
/// a `Receipt` is the durable, HMAC-chained audit-log entry keyed by
/// `job_id`, one of which is written for every `StageReceipt` emitted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Equal to the originating request's `trace_id`.
    pub job_id: Uuid,
    /// Which stage this entry records.
    pub stage: Stage,
    /// The intent or action name this entry records.
    pub action: String,
    /// When this entry was appended.
    pub timestamp: DateTime<Utc>,
    /// The policy identifier consulted, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Hash of the stage's input payload, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
    /// Hash of the stage's output payload, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_hash: Option<String>,
    /// Allow/deny verdict, if this entry represents a decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Human-readable reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form operator notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Hash of the governing policy treaty document, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treaty_hash: Option<String>,
    /// Version of the governing policy treaty document, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treaty_version: Option<String>,
    /// Hash of the previous entry in the chain, or [`GENESIS`] for the first.
    pub prev_hash: String,
    /// Monotonic, gap-free sequence number per `job_id`.
    pub sequence_number: u64,
    /// HMAC-SHA-256 over this entry's content hash, `prev_hash`, and
    /// `sequence_number` (Invariant L2).
    pub chain_signature: String,
}

/// View of a [`Receipt`] used for content hashing — every field except the
/// chain-linkage fields, which are folded into the signature separately.
#[derive(Serialize)]
struct ReceiptContentView<'a> {
    job_id: Uuid,
    stage: Stage,
    action: &'a str,
    timestamp: DateTime<Utc>,
    policy_id: &'a Option<String>,
    inputs_hash: &'a Option<String>,
    outputs_hash: &'a Option<String>,
    verdict: Option<Verdict>,
    reason: &'a Option<String>,
    notes: &'a Option<String>,
    treaty_hash: &'a Option<String>,
    treaty_version: &'a Option<String>,
}

impl Receipt {
    /// Compute the content hash of this entry's non-linkage fields.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Internal`] if the entry cannot be serialized.
    pub fn content_hash(&self) -> Result<String, GovError> {
        let view = ReceiptContentView {
            job_id: self.job_id,
            stage: self.stage,
            action: &self.action,
            timestamp: self.timestamp,
            policy_id: &self.policy_id,
            inputs_hash: &self.inputs_hash,
            outputs_hash: &self.outputs_hash,
            verdict: self.verdict,
            reason: &self.reason,
            notes: &self.notes,
            treaty_hash: &self.treaty_hash,
            treaty_version: &self.treaty_version,
        };
        gov_crypto::content_hash(&view)
    }

    /// Verify this entry's `chain_signature` under the active HMAC key
    /// (Invariant L2).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Internal`] if the HMAC key is not initialized or
    /// the entry cannot be serialized.
    pub fn verify_signature(&self) -> Result<bool, GovError> {
        let content_hash = self.content_hash()?;
        gov_crypto::verify(&self.chain_signature, &content_hash, &self.prev_hash, self.sequence_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new(OriginKind::Cli, "test")
    }

    #[test]
    fn request_context_rejects_empty_fields() {
        let trace_id = Uuid::new_v4();
        assert!(RequestContext::build(trace_id, "", "n1", "test.ok", origin()).is_err());
        assert!(RequestContext::build(trace_id, "p1", "", "test.ok", origin()).is_err());
        assert!(RequestContext::build(trace_id, "p1", "n1", "", origin()).is_err());
        assert!(RequestContext::build(Uuid::nil(), "p1", "n1", "test.ok", origin()).is_err());
    }

    #[test]
    fn request_context_accepts_valid_fields() {
        let ctx = RequestContext::build(Uuid::new_v4(), "p1", "n1", "test.ok", origin()).unwrap();
        assert_eq!(ctx.principal_id, "p1");
    }

    #[test]
    fn stage_receipt_chain_genesis_and_linkage() {
        let _ = gov_crypto::init_hmac_key(b"unit-test-secret-aaaaaaaaaaaaaaaa");
        let trace_id = Uuid::new_v4();
        let r0 = StageReceipt::new(trace_id, Stage::CifIngress, StageResult::Pass, Metadata::new(), GENESIS).unwrap();
        assert_eq!(r0.prev_hash, GENESIS);
        let r1 = StageReceipt::new(trace_id, Stage::CdiAction, StageResult::Pass, Metadata::new(), r0.hash.clone()).unwrap();

        let chain = ReceiptChain::new(trace_id, vec![r0, r1]);
        let v = chain.verify();
        assert!(v.valid);
        assert!(v.broken_at.is_none());
    }

    #[test]
    fn chain_completeness_requires_five_passing_gated_stages() {
        let trace_id = Uuid::new_v4();
        let mut prev = GENESIS.to_string();
        let mut receipts = Vec::new();
        for stage in Stage::GATED_ORDER {
            let r = StageReceipt::new(trace_id, stage, StageResult::Pass, Metadata::new(), prev.clone()).unwrap();
            prev = r.hash.clone();
            receipts.push(r);
        }
        let chain = ReceiptChain::new(trace_id, receipts);
        assert!(chain.complete);
    }

    #[test]
    fn tampering_with_a_receipt_breaks_verification() {
        let trace_id = Uuid::new_v4();
        let r0 = StageReceipt::new(trace_id, Stage::CifIngress, StageResult::Pass, Metadata::new(), GENESIS).unwrap();
        let mut r1 = StageReceipt::new(trace_id, Stage::CdiAction, StageResult::Pass, Metadata::new(), r0.hash.clone()).unwrap();

        r1.details.insert("tampered".into(), serde_json::json!(true));

        let chain = ReceiptChain::new(trace_id, vec![r0, r1]);
        let v = chain.verify();
        assert!(!v.valid);
        assert_eq!(v.broken_at, Some(1));
    }

    #[test]
    fn wildcard_namespace_matches_anything() {
        let token = CapabilityToken {
            token_id: Uuid::new_v4(),
            capability: "admin.stop".into(),
            namespace_id: WILDCARD_NAMESPACE.into(),
            principal_id: "root".into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            constraints: Metadata::new(),
            revoked: false,
        };
        assert!(token.matches_namespace("n1"));
        assert!(token.matches_namespace("anything"));
    }

    #[test]
    fn receipt_signature_round_trips() {
        let _ = gov_crypto::init_hmac_key(b"unit-test-secret-bbbbbbbbbbbbbbbb");
        let mut receipt = Receipt {
            job_id: Uuid::new_v4(),
            stage: Stage::CifIngress,
            action: "test.ok".into(),
            timestamp: Utc::now(),
            policy_id: None,
            inputs_hash: None,
            outputs_hash: None,
            verdict: Some(Verdict::Allow),
            reason: None,
            notes: None,
            treaty_hash: None,
            treaty_version: None,
            prev_hash: GENESIS.into(),
            sequence_number: 0,
            chain_signature: String::new(),
        };
        let content_hash = receipt.content_hash().unwrap();
        receipt.chain_signature = gov_crypto::sign(&content_hash, &receipt.prev_hash, receipt.sequence_number).unwrap();
        assert!(receipt.verify_signature().unwrap());

        receipt.reason = Some("tampered".into());
        assert!(!receipt.verify_signature().unwrap());
    }
}
