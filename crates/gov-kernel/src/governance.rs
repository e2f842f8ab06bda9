// SPDX-License-Identifier: MIT OR Apache-2.0
//! The governance provider interface (C8) — the contract implemented by the
//! external CIF/CDI policy layer. The kernel treats every method as opaque
//! and fails closed on any `Err`.

use async_trait::async_trait;
use gov_core::{CapabilityToken, CapsuleState, DecisionMeta, DegradationLevel, RequestContext, RiskClass};
use gov_errors::GovError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of `validate_ingress`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IngressOutcome {
    /// Whether the inbound payload passed context-integrity checks.
    pub valid: bool,
    /// The payload to pass downstream, possibly sanitized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_payload: Option<serde_json::Value>,
    /// Taint labels the provider attached to this request.
    #[serde(default)]
    pub taint_labels: Vec<String>,
    /// Human-readable reasons, present when `valid` is false.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Outcome of `check_action`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActionOutcome {
    /// Whether the action is authorized to proceed.
    pub allowed: bool,
    /// Human-readable reason, present regardless of `allowed`.
    pub reason: String,
    /// Capability tokens issued for this decision.
    #[serde(default)]
    pub capability_tokens: Vec<CapabilityToken>,
    /// Redaction rule names CDI intends to apply to the eventual output.
    #[serde(default)]
    pub redaction_rules: Vec<String>,
    /// How far the degradation ladder narrowed this decision.
    pub degradation_level: DegradationLevel,
}

/// Outcome of `check_output`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputOutcome {
    /// Whether the handler's result is valid to return.
    pub valid: bool,
    /// The (possibly redacted) response to carry forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_response: Option<serde_json::Value>,
    /// Human-readable reasons, present when `valid` is false.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Outcome of `validate_egress`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EgressOutcome {
    /// Whether the outbound response passed context-integrity checks.
    pub valid: bool,
    /// The final response to return to the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<serde_json::Value>,
    /// Human-readable reasons, present when `valid` is false.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Outcome of `capsule_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct CapsuleStatusReport {
    /// Freshness of the policy capsule.
    pub state: CapsuleState,
    /// How far the degradation ladder has narrowed permissible risk classes.
    pub degradation_level: DegradationLevel,
}

/// The four gated stage calls plus capsule introspection (C8).
///
/// Implementations are constructed once and passed by reference into the
/// executor — a capability-set interface, not an inheritance hierarchy.
/// Every method is `async` and fallible: an `Err` is treated exactly like a
/// denial (fail closed), distinct from an explicit `{valid: false}`/
/// `{allowed: false}` result, which is a policy decision rather than a
/// provider malfunction.
#[async_trait]
pub trait GovernanceProvider: Send + Sync {
    /// Validate and optionally sanitize the inbound request payload.
    async fn validate_ingress(
        &self,
        ctx: &RequestContext,
        payload: &serde_json::Value,
    ) -> Result<IngressOutcome, GovError>;

    /// Authorize the requested action for this context.
    async fn check_action(
        &self,
        ctx: &RequestContext,
        intent: &str,
        risk_class: RiskClass,
        requested_capabilities: &[String],
    ) -> Result<ActionOutcome, GovError>;

    /// Validate and optionally redact the handler's result.
    async fn check_output(
        &self,
        ctx: &RequestContext,
        handler_result: &serde_json::Value,
        decision_meta: &DecisionMeta,
    ) -> Result<OutputOutcome, GovError>;

    /// Validate the final response before it leaves the pipeline.
    async fn validate_egress(
        &self,
        ctx: &RequestContext,
        response: &serde_json::Value,
    ) -> Result<EgressOutcome, GovError>;

    /// Report the current policy capsule's freshness and degradation level.
    async fn capsule_status(&self) -> Result<CapsuleStatusReport, GovError>;
}

/// A governance provider that passes every stage unconditionally and issues
/// no capability tokens — used by `gov run`'s local smoke-testing path and
/// by tests that only exercise executor mechanics, not policy content.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpGovernanceProvider;

#[async_trait]
impl GovernanceProvider for NoOpGovernanceProvider {
    async fn validate_ingress(
        &self,
        _ctx: &RequestContext,
        payload: &serde_json::Value,
    ) -> Result<IngressOutcome, GovError> {
        Ok(IngressOutcome {
            valid: true,
            sanitized_payload: Some(payload.clone()),
            taint_labels: Vec::new(),
            errors: Vec::new(),
        })
    }

    async fn check_action(
        &self,
        _ctx: &RequestContext,
        _intent: &str,
        _risk_class: RiskClass,
        _requested_capabilities: &[String],
    ) -> Result<ActionOutcome, GovError> {
        Ok(ActionOutcome {
            allowed: true,
            reason: "no-op provider allows everything".to_string(),
            capability_tokens: Vec::new(),
            redaction_rules: Vec::new(),
            degradation_level: DegradationLevel::None,
        })
    }

    async fn check_output(
        &self,
        _ctx: &RequestContext,
        handler_result: &serde_json::Value,
        _decision_meta: &DecisionMeta,
    ) -> Result<OutputOutcome, GovError> {
        Ok(OutputOutcome { valid: true, redacted_response: Some(handler_result.clone()), errors: Vec::new() })
    }

    async fn validate_egress(
        &self,
        _ctx: &RequestContext,
        response: &serde_json::Value,
    ) -> Result<EgressOutcome, GovError> {
        Ok(EgressOutcome { valid: true, final_response: Some(response.clone()), errors: Vec::new() })
    }

    async fn capsule_status(&self) -> Result<CapsuleStatusReport, GovError> {
        Ok(CapsuleStatusReport { state: CapsuleState::Valid, degradation_level: DegradationLevel::None })
    }
}
