// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pipeline executor (C7) — the core algorithm.
//!
//! Drives the five-stage state machine per request, coordinating the
//! capability token store, handler registry, and durable receipt store, and
//! surfaces a sealed [`PipelineResponse`] with the request's receipt chain
//! attached.

use crate::error::PipelineError;
use crate::governance::GovernanceProvider;
use crate::telemetry::PipelineMetrics;
use gov_captoken::TokenStore;
use gov_core::{
    CapabilityToken, DecisionMeta, Metadata, Origin, ReceiptChain, RequestContext, Stage, StageReceipt, StageResult,
    Verdict, GENESIS,
};
use gov_errors::{ErrorCode, ErrorDto, GovError};
use gov_receipt_store::{ReceiptDraft, ReceiptStore};
use gov_registry::{DispatchProof, HandlerRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn meta(pairs: Vec<(&str, serde_json::Value)>) -> Metadata {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Tunables for a [`PipelineExecutor`].
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Per-stage deadline. On expiry, the in-flight stage is treated as a
    /// FAIL (`STAGE_TIMEOUT`) and the pipeline transitions to `FAILED`.
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { stage_timeout: Duration::from_secs(30) }
    }
}

/// The raw inputs an entrypoint adapter supplies to start a pipeline
/// invocation. [`PipelineExecutor::execute`] builds and validates the
/// [`RequestContext`] from these fields as its first step.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Globally unique identifier for this invocation.
    pub trace_id: Uuid,
    /// The authenticated principal driving this request.
    pub principal_id: String,
    /// The authorization-boundary namespace this request operates in.
    pub namespace_id: String,
    /// The registered intent this request wants to perform.
    pub intent: String,
    /// Capability names requested by the caller.
    pub requested_capabilities: Vec<String>,
    /// Transport/taint metadata.
    pub origin: Origin,
    /// Opaque caller-supplied metadata.
    pub metadata: Metadata,
    /// The request payload passed to `validate_ingress` and, once
    /// sanitized, to the handler.
    pub payload: serde_json::Value,
}

impl PipelineRequest {
    /// Construct a request with no requested capabilities and no metadata.
    #[must_use]
    pub fn new(
        trace_id: Uuid,
        principal_id: impl Into<String>,
        namespace_id: impl Into<String>,
        intent: impl Into<String>,
        origin: Origin,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            trace_id,
            principal_id: principal_id.into(),
            namespace_id: namespace_id.into(),
            intent: intent.into(),
            requested_capabilities: Vec::new(),
            origin,
            metadata: Metadata::new(),
            payload,
        }
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

/// The sealed response surfaced to every entrypoint adapter.
///
/// `_sealed` is a private, zero-sized field: no crate outside this one can
/// name it, so no caller can construct a [`PipelineResponse`] via struct
/// literal syntax — only [`PipelineExecutor::execute`] can produce one.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineResponse {
    /// Whether the pipeline reached `COMPLETE`.
    pub success: bool,
    /// The handler's (possibly redacted) result, present iff `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// The denial, present iff `!success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDto>,
    /// The CDI action decision, present from `CDI_ACTION` onward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_meta: Option<DecisionMeta>,
    /// The invocation this response belongs to.
    pub trace_id: Uuid,
    /// The (possibly partial) hash-chained receipt chain for this invocation.
    pub receipt_chain: ReceiptChain,
    #[serde(default, skip)]
    _sealed: (),
}

impl PipelineResponse {
    fn success(data: serde_json::Value, decision_meta: DecisionMeta, trace_id: Uuid, receipt_chain: ReceiptChain) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            decision_meta: Some(decision_meta),
            trace_id,
            receipt_chain,
            _sealed: (),
        }
    }

    fn denied(
        error: ErrorDto,
        decision_meta: Option<DecisionMeta>,
        trace_id: Uuid,
        receipt_chain: ReceiptChain,
    ) -> Self {
        Self { success: false, data: None, error: Some(error), decision_meta, trace_id, receipt_chain, _sealed: () }
    }
}

/// Result of [`PipelineExecutor::stop`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StopOutcome {
    /// Number of tokens revoked by this call.
    pub revoked_tokens: usize,
    /// `Some(FAILED)` if a matching in-flight invocation was found and
    /// signaled; `None` if no invocation with this `trace_id` was active.
    pub state: Option<Stage>,
}

struct ActiveGuard<'a> {
    executor: &'a PipelineExecutor,
    trace_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.executor.active.lock().expect("active map poisoned").remove(&self.trace_id);
    }
}

/// The pipeline executor (C7).
///
/// Holds the handler registry together with the [`DispatchProof`] minted
/// alongside it — the only way to drive `_internal_invoke` — so no other
/// component in this process can dispatch a handler directly.
pub struct PipelineExecutor {
    registry: Arc<HandlerRegistry>,
    dispatch_proof: DispatchProof,
    tokens: Arc<TokenStore>,
    receipts: Arc<dyn ReceiptStore>,
    governance: Arc<dyn GovernanceProvider>,
    metrics: Arc<PipelineMetrics>,
    stage_timeout: Duration,
    active: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl PipelineExecutor {
    /// Construct a new executor over the given component instances.
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        dispatch_proof: DispatchProof,
        tokens: Arc<TokenStore>,
        receipts: Arc<dyn ReceiptStore>,
        governance: Arc<dyn GovernanceProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            dispatch_proof,
            tokens,
            receipts,
            governance,
            metrics: Arc::new(PipelineMetrics::new()),
            stage_timeout: config.stage_timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Access the counters this executor has accumulated.
    #[must_use]
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Access the capability token store backing this executor.
    #[must_use]
    pub fn token_store(&self) -> &TokenStore {
        &self.tokens
    }

    /// Access the handler registry backing this executor.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Access the durable receipt store backing this executor.
    #[must_use]
    pub fn receipt_store(&self) -> Arc<dyn ReceiptStore> {
        Arc::clone(&self.receipts)
    }

    /// Drive a single request through the five-stage pipeline.
    ///
    /// Never panics and never returns an `Err` — every outcome, including
    /// context-normalization failure, is surfaced as a [`PipelineResponse`]
    /// with `success: false`.
    pub async fn execute(&self, request: PipelineRequest) -> PipelineResponse {
        self.metrics.record_started();
        let trace_id = request.trace_id;

        let ctx = match RequestContext::build(
            request.trace_id,
            request.principal_id,
            request.namespace_id,
            request.intent,
            request.origin,
        ) {
            Ok(c) => c
                .with_requested_capabilities(request.requested_capabilities)
                .with_metadata(request.metadata),
            Err(e) => return self.deny_pre_context(trace_id, PipelineError::InvalidContext(e)),
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.active.lock().expect("active map poisoned").insert(ctx.trace_id, Arc::clone(&stop_flag));
        let _guard = ActiveGuard { executor: self, trace_id: ctx.trace_id };

        let mut chain: Vec<StageReceipt> = Vec::new();
        let mut prev_hash = GENESIS.to_string();

        // Handler existence is checked before CIF_INGRESS: an unregistered
        // intent yields a single CDI_ACTION FAIL receipt chained onto
        // GENESIS, matching the documented scenario for unknown intents
        // rather than first appending a CIF_INGRESS PASS receipt.
        let Some(handler_meta) = self.registry.metadata(&ctx.intent) else {
            let details = meta(vec![
                ("intent", serde_json::Value::String(ctx.intent.clone())),
                ("reason", serde_json::Value::String("unknown intent".to_string())),
            ]);
            let _ = self.emit(&ctx, Stage::CdiAction, StageResult::Fail, details, &prev_hash, &mut chain).await;
            return self.fail(ctx.trace_id, chain, Stage::CdiAction, PipelineError::UnknownIntent(ctx.intent.clone()), None);
        };

        if stop_flag.load(Ordering::SeqCst) {
            return self.fail(ctx.trace_id, chain, Stage::CifIngress, PipelineError::StopCommand, None);
        }

        // --- CIF_INGRESS ---
        let ingress = match self
            .call_with_timeout(self.governance.validate_ingress(&ctx, &request.payload), Stage::CifIngress)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                let details = meta(vec![("reason", serde_json::Value::String(e.to_string()))]);
                let _ = self.emit(&ctx, Stage::CifIngress, StageResult::Fail, details, &prev_hash, &mut chain).await;
                return self.fail(ctx.trace_id, chain, Stage::CifIngress, e, None);
            }
        };
        if !ingress.valid {
            let err = PipelineError::CifIngressFailed(ingress.errors.join("; "));
            let details = meta(vec![("errors", serde_json::to_value(&ingress.errors).unwrap_or_default())]);
            let _ = self.emit(&ctx, Stage::CifIngress, StageResult::Fail, details, &prev_hash, &mut chain).await;
            return self.fail(ctx.trace_id, chain, Stage::CifIngress, err, None);
        }
        let sanitized_payload = ingress.sanitized_payload.unwrap_or_else(|| request.payload.clone());
        prev_hash = match self.emit(&ctx, Stage::CifIngress, StageResult::Pass, Metadata::new(), &prev_hash, &mut chain).await {
            Ok(h) => h,
            Err(e) => return self.fail(ctx.trace_id, chain, Stage::CifIngress, e, None),
        };

        if stop_flag.load(Ordering::SeqCst) {
            return self.fail(ctx.trace_id, chain, Stage::CdiAction, PipelineError::StopCommand, None);
        }

        // --- CDI_ACTION ---
        let action = match self
            .call_with_timeout(
                self.governance.check_action(&ctx, &ctx.intent, handler_meta.risk_class, &ctx.requested_capabilities),
                Stage::CdiAction,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                let details = meta(vec![("reason", serde_json::Value::String(e.to_string()))]);
                let _ = self.emit(&ctx, Stage::CdiAction, StageResult::Fail, details, &prev_hash, &mut chain).await;
                return self.fail(ctx.trace_id, chain, Stage::CdiAction, e, None);
            }
        };
        if !action.allowed {
            let err = PipelineError::CdiActionDenied(action.reason.clone());
            let details = meta(vec![("reason", serde_json::Value::String(action.reason.clone()))]);
            let _ = self.emit(&ctx, Stage::CdiAction, StageResult::Fail, details, &prev_hash, &mut chain).await;
            return self.fail(ctx.trace_id, chain, Stage::CdiAction, err, None);
        }
        // An allowed decision with zero issued tokens is not an error — the
        // handler still runs; enforcement happens when a downstream adapter
        // requires a token the caller does not hold (Open Question (a)).
        if !action.capability_tokens.is_empty() {
            self.metrics.record_tokens_issued(action.capability_tokens.len() as u64);
        }
        let decision_meta = DecisionMeta {
            allowed: true,
            reason: action.reason.clone(),
            risk_class: handler_meta.risk_class,
            capability_tokens: action.capability_tokens.clone(),
            redaction_rules: action.redaction_rules.clone(),
            degradation_level: action.degradation_level,
            decided_at: chrono::Utc::now(),
        };
        prev_hash = match self.emit(&ctx, Stage::CdiAction, StageResult::Pass, Metadata::new(), &prev_hash, &mut chain).await {
            Ok(h) => h,
            Err(e) => return self.fail(ctx.trace_id, chain, Stage::CdiAction, e, Some(decision_meta)),
        };

        if stop_flag.load(Ordering::SeqCst) {
            return self.fail(ctx.trace_id, chain, Stage::Handler, PipelineError::StopCommand, Some(decision_meta));
        }

        // --- HANDLER ---
        let handler_result = match self
            .call_handler_with_timeout(&ctx.intent, &ctx, sanitized_payload, &action.capability_tokens)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                let details = meta(vec![("reason", serde_json::Value::String(e.to_string()))]);
                let _ = self.emit(&ctx, Stage::Handler, StageResult::Fail, details, &prev_hash, &mut chain).await;
                return self.fail(ctx.trace_id, chain, Stage::Handler, e, Some(decision_meta));
            }
        };
        let handler_details = meta(vec![("handler_id", serde_json::Value::String(handler_meta.id.clone()))]);
        prev_hash = match self.emit(&ctx, Stage::Handler, StageResult::Pass, handler_details, &prev_hash, &mut chain).await {
            Ok(h) => h,
            Err(e) => return self.fail(ctx.trace_id, chain, Stage::Handler, e, Some(decision_meta)),
        };

        if stop_flag.load(Ordering::SeqCst) {
            return self.fail(ctx.trace_id, chain, Stage::CdiOutput, PipelineError::StopCommand, Some(decision_meta));
        }

        // --- CDI_OUTPUT ---
        let output = match self
            .call_with_timeout(self.governance.check_output(&ctx, &handler_result, &decision_meta), Stage::CdiOutput)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                let details = meta(vec![("reason", serde_json::Value::String(e.to_string()))]);
                let _ = self.emit(&ctx, Stage::CdiOutput, StageResult::Fail, details, &prev_hash, &mut chain).await;
                return self.fail(ctx.trace_id, chain, Stage::CdiOutput, e, Some(decision_meta));
            }
        };
        if !output.valid {
            let err = PipelineError::CdiOutputDenied(output.errors.join("; "));
            let details = meta(vec![("errors", serde_json::to_value(&output.errors).unwrap_or_default())]);
            let _ = self.emit(&ctx, Stage::CdiOutput, StageResult::Fail, details, &prev_hash, &mut chain).await;
            return self.fail(ctx.trace_id, chain, Stage::CdiOutput, err, Some(decision_meta));
        }
        let redacted_response = output.redacted_response.unwrap_or_else(|| handler_result.clone());
        prev_hash = match self.emit(&ctx, Stage::CdiOutput, StageResult::Pass, Metadata::new(), &prev_hash, &mut chain).await {
            Ok(h) => h,
            Err(e) => return self.fail(ctx.trace_id, chain, Stage::CdiOutput, e, Some(decision_meta)),
        };

        if stop_flag.load(Ordering::SeqCst) {
            return self.fail(ctx.trace_id, chain, Stage::CifEgress, PipelineError::StopCommand, Some(decision_meta));
        }

        // --- CIF_EGRESS ---
        let egress = match self
            .call_with_timeout(self.governance.validate_egress(&ctx, &redacted_response), Stage::CifEgress)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                let details = meta(vec![("reason", serde_json::Value::String(e.to_string()))]);
                let _ = self.emit(&ctx, Stage::CifEgress, StageResult::Fail, details, &prev_hash, &mut chain).await;
                return self.fail(ctx.trace_id, chain, Stage::CifEgress, e, Some(decision_meta));
            }
        };
        if !egress.valid {
            let err = PipelineError::CifEgressFailed(egress.errors.join("; "));
            let details = meta(vec![("errors", serde_json::to_value(&egress.errors).unwrap_or_default())]);
            let _ = self.emit(&ctx, Stage::CifEgress, StageResult::Fail, details, &prev_hash, &mut chain).await;
            return self.fail(ctx.trace_id, chain, Stage::CifEgress, err, Some(decision_meta));
        }
        let final_response = egress.final_response.unwrap_or(redacted_response);
        if let Err(e) = self.emit(&ctx, Stage::CifEgress, StageResult::Pass, Metadata::new(), &prev_hash, &mut chain).await {
            return self.fail(ctx.trace_id, chain, Stage::CifEgress, e, Some(decision_meta));
        }

        self.metrics.record_completed();
        tracing::info!(target: "gov.kernel", trace_id = %ctx.trace_id, "pipeline completed");
        let receipt_chain = ReceiptChain::new(ctx.trace_id, chain);
        PipelineResponse::success(final_response, decision_meta, ctx.trace_id, receipt_chain)
    }

    /// Revoke every token in `namespace_id` and, if `trace_id` is currently
    /// executing, signal it to terminate at its next cooperative check.
    pub fn stop(&self, trace_id: Uuid, namespace_id: &str) -> StopOutcome {
        let revoked = self.tokens.revoke_all_for_namespace(namespace_id);
        if revoked > 0 {
            self.metrics.record_tokens_revoked(revoked as u64);
        }
        let state = {
            let active = self.active.lock().expect("active map poisoned");
            active.get(&trace_id).map(|flag| {
                flag.store(true, Ordering::SeqCst);
                Stage::Failed
            })
        };
        if state.is_some() {
            self.metrics.record_denied(ErrorCode::StopCommand);
        }
        tracing::warn!(
            target: "gov.kernel",
            trace_id = %trace_id,
            namespace_id,
            revoked_tokens = revoked,
            signaled = state.is_some(),
            "STOP command issued"
        );
        StopOutcome { revoked_tokens: revoked, state }
    }

    async fn call_with_timeout<T, F>(&self, fut: F, stage: Stage) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, GovError>>,
    {
        match tokio::time::timeout(self.stage_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Self::stage_failure(stage, e.to_string())),
            Err(_) => Err(PipelineError::StageTimeout(stage.to_string())),
        }
    }

    async fn call_handler_with_timeout(
        &self,
        intent: &str,
        ctx: &RequestContext,
        payload: serde_json::Value,
        capability_tokens: &[CapabilityToken],
    ) -> Result<serde_json::Value, PipelineError> {
        match tokio::time::timeout(
            self.stage_timeout,
            self.registry._internal_invoke(intent, ctx, payload, capability_tokens, &self.dispatch_proof),
        )
        .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PipelineError::from(e)),
            Err(_) => Err(PipelineError::StageTimeout(Stage::Handler.to_string())),
        }
    }

    fn stage_failure(stage: Stage, message: String) -> PipelineError {
        match stage {
            Stage::CifIngress => PipelineError::CifIngressFailed(message),
            Stage::CdiAction => PipelineError::CdiActionDenied(message),
            Stage::Handler => PipelineError::HandlerError(message),
            Stage::CdiOutput => PipelineError::CdiOutputDenied(message),
            Stage::CifEgress => PipelineError::CifEgressFailed(message),
            _ => PipelineError::Internal(GovError::new(ErrorCode::Internal, message)),
        }
    }

    /// Append a stage receipt both ephemerally (in-memory, returned to the
    /// caller) and durably (C2). On durable failure, per §7's "transient
    /// failures are treated as stage FAIL" rule, a FAIL receipt replaces the
    /// intended one and the durable error is propagated.
    async fn emit(
        &self,
        ctx: &RequestContext,
        stage: Stage,
        result: StageResult,
        details: Metadata,
        prev_hash: &str,
        chain: &mut Vec<StageReceipt>,
    ) -> Result<String, PipelineError> {
        let verdict = match stage {
            Stage::CdiAction => Some(if result == StageResult::Pass { Verdict::Allow } else { Verdict::Deny }),
            _ => None,
        };
        let mut draft = ReceiptDraft::new(ctx.trace_id, stage, ctx.intent.clone());
        if let Some(v) = verdict {
            draft = draft.with_verdict(v);
        }

        match self.receipts.append(draft).await {
            Ok(_) => {
                let receipt = StageReceipt::new(ctx.trace_id, stage, result, details, prev_hash)?;
                let hash = receipt.hash.clone();
                chain.push(receipt);
                Ok(hash)
            }
            Err(e) => {
                tracing::error!(
                    target: "gov.kernel",
                    trace_id = %ctx.trace_id,
                    stage = %stage,
                    error = %e,
                    "durable receipt append failed; downgrading stage to FAIL"
                );
                let fail_details = meta(vec![("storage_error", serde_json::Value::String(e.to_string()))]);
                let receipt = StageReceipt::new(ctx.trace_id, stage, StageResult::Fail, fail_details, prev_hash)?;
                chain.push(receipt);
                Err(PipelineError::from(e))
            }
        }
    }

    fn deny_pre_context(&self, trace_id: Uuid, err: PipelineError) -> PipelineResponse {
        let code = err.response_code();
        self.metrics.record_denied(code);
        tracing::warn!(target: "gov.kernel", trace_id = %trace_id, code = %code, "context normalization failed");
        let receipt_chain = ReceiptChain::new(trace_id, Vec::new());
        let error_dto = ErrorDto { code, message: err.to_string(), stage: None };
        PipelineResponse::denied(error_dto, None, trace_id, receipt_chain)
    }

    fn fail(
        &self,
        trace_id: Uuid,
        chain: Vec<StageReceipt>,
        stage: Stage,
        err: PipelineError,
        decision_meta: Option<DecisionMeta>,
    ) -> PipelineResponse {
        let code = err.response_code();
        self.metrics.record_denied(code);
        tracing::warn!(
            target: "gov.kernel",
            trace_id = %trace_id,
            stage = %stage,
            code = %code,
            message = %err,
            "pipeline denied"
        );
        let receipt_chain = ReceiptChain::new(trace_id, chain);
        let error_dto = ErrorDto { code, message: err.to_string(), stage: Some(stage.to_string()) };
        PipelineResponse::denied(error_dto, decision_meta, trace_id, receipt_chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{ActionOutcome, CapsuleStatusReport, EgressOutcome, IngressOutcome, OutputOutcome};
    use async_trait::async_trait;
    use gov_core::{CapsuleState, DegradationLevel, OriginKind, RiskClass, StageResult};
    use gov_receipt_store::FileReceiptStore;
    use gov_registry::Handler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn init_crypto() {
        let _ = gov_crypto::init_hmac_key(b"executor-test-secret-0123456789");
    }

    fn store() -> (Arc<dyn ReceiptStore>, tempfile::TempDir) {
        init_crypto();
        let dir = tempfile::tempdir().unwrap();
        let s = FileReceiptStore::open(dir.path(), 4 * 1024 * 1024, None).unwrap();
        (Arc::new(s) as Arc<dyn ReceiptStore>, dir)
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(
            &self,
            _ctx: &RequestContext,
            payload: serde_json::Value,
            _capability_tokens: &[CapabilityToken],
        ) -> Result<serde_json::Value, String> {
            Ok(payload)
        }
    }

    struct Boom;

    #[async_trait]
    impl Handler for Boom {
        async fn call(
            &self,
            _ctx: &RequestContext,
            _payload: serde_json::Value,
            _capability_tokens: &[CapabilityToken],
        ) -> Result<serde_json::Value, String> {
            Err("handler exploded".to_string())
        }
    }

    /// A governance provider whose per-stage outcomes are configurable, so a
    /// single fixture can drive every denial scenario in §8 of the spec.
    struct ScriptedProvider {
        ingress: IngressOutcome,
        action: ActionOutcome,
        output: OutputOutcome,
        egress: EgressOutcome,
        action_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn allow_all() -> Self {
            Self {
                ingress: IngressOutcome { valid: true, sanitized_payload: None, taint_labels: vec![], errors: vec![] },
                action: ActionOutcome {
                    allowed: true,
                    reason: "ok".to_string(),
                    capability_tokens: vec![],
                    redaction_rules: vec![],
                    degradation_level: DegradationLevel::None,
                },
                output: OutputOutcome { valid: true, redacted_response: None, errors: vec![] },
                egress: EgressOutcome { valid: true, final_response: None, errors: vec![] },
                action_calls: AtomicUsize::new(0),
            }
        }

        fn deny_ingress() -> Self {
            let mut p = Self::allow_all();
            p.ingress = IngressOutcome {
                valid: false,
                sanitized_payload: None,
                taint_labels: vec![],
                errors: vec!["bad".to_string()],
            };
            p
        }

        fn deny_action() -> Self {
            let mut p = Self::allow_all();
            p.action = ActionOutcome {
                allowed: false,
                reason: "denied".to_string(),
                capability_tokens: vec![],
                redaction_rules: vec![],
                degradation_level: DegradationLevel::None,
            };
            p
        }

        fn deny_output() -> Self {
            let mut p = Self::allow_all();
            p.output = OutputOutcome { valid: false, redacted_response: None, errors: vec!["bad output".to_string()] };
            p
        }

        fn deny_egress() -> Self {
            let mut p = Self::allow_all();
            p.egress = EgressOutcome { valid: false, final_response: None, errors: vec!["bad egress".to_string()] };
            p
        }
    }

    #[async_trait]
    impl GovernanceProvider for ScriptedProvider {
        async fn validate_ingress(
            &self,
            _ctx: &RequestContext,
            payload: &serde_json::Value,
        ) -> Result<IngressOutcome, GovError> {
            let mut outcome = self.ingress.clone();
            if outcome.sanitized_payload.is_none() {
                outcome.sanitized_payload = Some(payload.clone());
            }
            Ok(outcome)
        }

        async fn check_action(
            &self,
            _ctx: &RequestContext,
            _intent: &str,
            _risk_class: RiskClass,
            _requested_capabilities: &[String],
        ) -> Result<ActionOutcome, GovError> {
            self.action_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.action.clone())
        }

        async fn check_output(
            &self,
            _ctx: &RequestContext,
            handler_result: &serde_json::Value,
            _decision_meta: &DecisionMeta,
        ) -> Result<OutputOutcome, GovError> {
            let mut outcome = self.output.clone();
            if outcome.valid && outcome.redacted_response.is_none() {
                outcome.redacted_response = Some(handler_result.clone());
            }
            Ok(outcome)
        }

        async fn validate_egress(
            &self,
            _ctx: &RequestContext,
            response: &serde_json::Value,
        ) -> Result<EgressOutcome, GovError> {
            let mut outcome = self.egress.clone();
            if outcome.valid && outcome.final_response.is_none() {
                outcome.final_response = Some(response.clone());
            }
            Ok(outcome)
        }

        async fn capsule_status(&self) -> Result<CapsuleStatusReport, GovError> {
            Ok(CapsuleStatusReport { state: CapsuleState::Valid, degradation_level: DegradationLevel::None })
        }
    }

    fn origin() -> Origin {
        Origin::new(OriginKind::Cli, "test")
    }

    fn build_executor(
        governance: Arc<dyn GovernanceProvider>,
    ) -> (PipelineExecutor, Arc<TokenStore>, tempfile::TempDir) {
        let (registry, proof) = HandlerRegistry::new();
        registry
            .register("h1", "test.ok", RiskClass::LowRisk, vec![], Arc::new(Echo))
            .unwrap();
        registry
            .register("h2", "test.fail", RiskClass::LowRisk, vec![], Arc::new(Boom))
            .unwrap();
        registry.seal();
        let tokens = Arc::new(TokenStore::new());
        let (receipts, dir) = store();
        let executor = PipelineExecutor::new(
            Arc::new(registry),
            proof,
            Arc::clone(&tokens),
            receipts,
            governance,
            PipelineConfig::default(),
        );
        (executor, tokens, dir)
    }

    /// Scenario A — happy path.
    #[tokio::test]
    async fn happy_path_yields_five_pass_receipts_and_a_valid_chain() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::allow_all()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.ok", origin(), json!({"ok": true}));

        let response = executor.execute(request).await;

        assert!(response.success);
        assert_eq!(response.data, Some(json!({"ok": true})));
        assert_eq!(response.receipt_chain.receipts.len(), 5);
        assert!(response.receipt_chain.complete);
        let verification = response.receipt_chain.verify();
        assert!(verification.valid);
        assert_eq!(verification.broken_at, None);
        let stages: Vec<Stage> = response.receipt_chain.receipts.iter().map(|r| r.stage).collect();
        assert_eq!(stages, Stage::GATED_ORDER.to_vec());
        assert!(response.receipt_chain.receipts.iter().all(|r| r.result == StageResult::Pass));
        assert_eq!(response.receipt_chain.receipts[0].prev_hash, GENESIS);
        for window in response.receipt_chain.receipts.windows(2) {
            assert_eq!(window[1].prev_hash, window[0].hash);
        }
    }

    /// Scenario B — ingress denial.
    #[tokio::test]
    async fn ingress_denial_stops_before_check_action() {
        let provider = Arc::new(ScriptedProvider::deny_ingress());
        let (executor, _tokens, _dir) = build_executor(Arc::clone(&provider) as Arc<dyn GovernanceProvider>);
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.ok", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        assert_eq!(response.error.as_ref().unwrap().code, ErrorCode::CifIngressFailed);
        assert_eq!(response.receipt_chain.receipts.len(), 1);
        assert_eq!(response.receipt_chain.receipts[0].stage, Stage::CifIngress);
        assert_eq!(response.receipt_chain.receipts[0].result, StageResult::Fail);
        assert_eq!(provider.action_calls.load(Ordering::SeqCst), 0, "check_action must never be called");
    }

    /// Scenario C — action denial.
    #[tokio::test]
    async fn action_denial_reports_reason_and_two_receipts() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::deny_action()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.ok", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::CdiActionDenied);
        assert_eq!(error.message, "denied");
        assert_eq!(response.receipt_chain.receipts.len(), 2);
        assert_eq!(response.receipt_chain.receipts[1].result, StageResult::Fail);
    }

    /// Scenario D — unknown intent.
    #[tokio::test]
    async fn unknown_intent_yields_single_receipt_chain() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::allow_all()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "nonexistent", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::UnknownIntent);
        assert!(response.receipt_chain.receipts.len() <= 1);
        if let Some(receipt) = response.receipt_chain.receipts.first() {
            assert_eq!(receipt.stage, Stage::CdiAction);
            assert_eq!(receipt.result, StageResult::Fail);
            assert_eq!(receipt.details.get("intent"), Some(&json!("nonexistent")));
        }
    }

    /// Scenario E — STOP revokes every token in the namespace.
    #[tokio::test]
    async fn stop_revokes_all_tokens_in_namespace() {
        let (executor, tokens, _dir) = build_executor(Arc::new(ScriptedProvider::allow_all()));
        let t1 = tokens
            .issue("read", "n1", "p1", None, gov_core::Metadata::new())
            .unwrap();
        let t2 = tokens
            .issue("write", "n1", "p1", None, gov_core::Metadata::new())
            .unwrap();
        let unrelated = tokens
            .issue("read", "n2", "p1", None, gov_core::Metadata::new())
            .unwrap();

        let outcome = executor.stop(Uuid::new_v4(), "n1");

        assert_eq!(outcome.revoked_tokens, 2);
        assert!(!tokens.verify(t1.token_id).valid);
        assert!(!tokens.verify(t2.token_id).valid);
        assert!(tokens.verify(unrelated.token_id).valid);
    }

    /// Scenario E (continued) — STOP issued while a trace is mid-HANDLER
    /// transitions it to FAILED with reason STOP_COMMAND at the next
    /// cooperative check, without appending a trailing FAIL receipt (STOP
    /// aborts between stages rather than failing one).
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_handler_terminates_in_flight_trace() {
        struct StoppableHandler {
            started: Arc<tokio::sync::Notify>,
            proceed: Arc<tokio::sync::Notify>,
        }

        #[async_trait]
        impl Handler for StoppableHandler {
            async fn call(
                &self,
                _ctx: &RequestContext,
                _payload: serde_json::Value,
                _capability_tokens: &[CapabilityToken],
            ) -> Result<serde_json::Value, String> {
                self.started.notify_one();
                self.proceed.notified().await;
                Ok(json!({"ok": true}))
            }
        }

        let started = Arc::new(tokio::sync::Notify::new());
        let proceed = Arc::new(tokio::sync::Notify::new());

        let (registry, proof) = HandlerRegistry::new();
        registry
            .register(
                "h1",
                "test.stop",
                RiskClass::LowRisk,
                vec![],
                Arc::new(StoppableHandler { started: Arc::clone(&started), proceed: Arc::clone(&proceed) }),
            )
            .unwrap();
        registry.seal();
        let tokens = Arc::new(TokenStore::new());
        let (receipts, _dir) = store();
        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(registry),
            proof,
            tokens,
            receipts,
            Arc::new(ScriptedProvider::allow_all()) as Arc<dyn GovernanceProvider>,
            PipelineConfig::default(),
        ));

        let trace_id = Uuid::new_v4();
        let request = PipelineRequest::new(trace_id, "p1", "n1", "test.stop", origin(), json!({}));
        let exec2 = Arc::clone(&executor);
        let handle = tokio::spawn(async move { exec2.execute(request).await });

        started.notified().await;
        let outcome = executor.stop(trace_id, "n1");
        assert_eq!(outcome.state, Some(Stage::Failed));
        proceed.notify_one();

        let response = handle.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::StopCommand);
        assert_eq!(response.receipt_chain.receipts.len(), 3);
        assert!(response.receipt_chain.receipts.iter().all(|r| r.result == StageResult::Pass));
    }

    /// Testable property 5 / Scenario F — tamper detection.
    #[tokio::test]
    async fn tampering_with_a_receipt_breaks_chain_verification() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::allow_all()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.ok", origin(), json!({"ok": true}));
        let mut response = executor.execute(request).await;
        assert!(response.success);

        response.receipt_chain.receipts[1]
            .details
            .insert("tampered".to_string(), json!(true));

        let verification = response.receipt_chain.verify();
        assert!(!verification.valid);
        assert_eq!(verification.broken_at, Some(1));
    }

    /// Handler exceptions never surface verbatim; they become HANDLER_ERROR.
    #[tokio::test]
    async fn handler_failure_is_wrapped_as_handler_error() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::allow_all()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.fail", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::HandlerError);
        assert!(error.message.contains("handler exploded"));
        assert_eq!(response.receipt_chain.receipts.len(), 3);
        assert_eq!(response.receipt_chain.receipts.last().unwrap().result, StageResult::Fail);
    }

    /// CDI_OUTPUT denial terminates with the decision metadata attached.
    #[tokio::test]
    async fn output_denial_still_attaches_decision_meta() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::deny_output()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.ok", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::CdiOutputDenied);
        assert!(response.decision_meta.is_some());
        assert_eq!(response.receipt_chain.receipts.len(), 4);
    }

    /// CIF_EGRESS denial terminates at the fifth stage attempt.
    #[tokio::test]
    async fn egress_denial_is_the_final_stage_to_fail() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::deny_egress()));
        let request = PipelineRequest::new(Uuid::new_v4(), "p1", "n1", "test.ok", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::CifEgressFailed);
        assert_eq!(response.receipt_chain.receipts.len(), 5);
        assert_eq!(response.receipt_chain.receipts.last().unwrap().result, StageResult::Fail);
    }

    /// Invalid context (empty principal) is denied before any receipt exists.
    #[tokio::test]
    async fn invalid_context_denies_before_any_receipt() {
        let (executor, _tokens, _dir) = build_executor(Arc::new(ScriptedProvider::allow_all()));
        let request = PipelineRequest::new(Uuid::new_v4(), "", "n1", "test.ok", origin(), json!({}));

        let response = executor.execute(request).await;

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidContext);
        assert!(response.receipt_chain.receipts.is_empty());
    }
}
