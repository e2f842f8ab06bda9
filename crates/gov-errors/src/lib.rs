// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable response codes for the governance substrate.
//!
//! Every error that can reach a pipeline caller carries an [`ErrorCode`] — a
//! machine-readable, stable string tag — a human-readable message, an
//! optional cause chain, and arbitrary key-value context. Use the builder
//! returned by [`GovError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Request-context normalization errors.
    Context,
    /// Governance-provider denials at any of the four gated stages.
    Governance,
    /// Handler execution errors.
    Handler,
    /// Capability token verification errors.
    Capability,
    /// Receipt-chain integrity failures.
    Integrity,
    /// Storage-seal violations.
    Seal,
    /// Misconfiguration detected before or during boot.
    Config,
    /// Transient failures (timeouts, I/O, transport).
    Transient,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Context => "context",
            Self::Governance => "governance",
            Self::Handler => "handler",
            Self::Capability => "capability",
            Self::Integrity => "integrity",
            Self::Seal => "seal",
            Self::Config => "config",
            Self::Transient => "transient",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable response code.
///
/// Each variant serializes to the `SCREAMING_SNAKE_CASE` string named in the
/// external interface contract (`error.code` on a denied pipeline response),
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Context --
    /// `RequestContext` failed normalization (missing/empty required field).
    InvalidContext,

    // -- Governance --
    /// No handler is registered for the requested intent.
    UnknownIntent,
    /// `validate_ingress` returned `valid: false`.
    CifIngressFailed,
    /// `check_action` returned `allowed: false`.
    CdiActionDenied,
    /// `check_output` returned `valid: false`.
    CdiOutputDenied,
    /// `validate_egress` returned `valid: false`.
    CifEgressFailed,
    /// The STOP command terminated this trace.
    StopCommand,

    // -- Handler --
    /// A registered handler raised an exception during invocation.
    HandlerError,

    // -- Capability --
    /// A capability token failed verification at the point of use.
    CapabilityDenied,

    // -- Integrity --
    /// Receipt-chain verification found a broken link or hash mismatch.
    ReceiptChainBroken,

    // -- Seal --
    /// A storage adapter was constructed post-seal without a valid capability.
    GovernanceBypassDetected,

    // -- Config --
    /// `MATHISON_STORE_BACKEND`/`MATHISON_STORE_PATH` missing or invalid.
    StoreMisconfigured,

    // -- Transient --
    /// A stage did not complete before its deadline.
    StageTimeout,
    /// An unclassified pipeline-level failure (storage I/O, transport).
    PipelineError,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidContext => ErrorCategory::Context,

            Self::UnknownIntent
            | Self::CifIngressFailed
            | Self::CdiActionDenied
            | Self::CdiOutputDenied
            | Self::CifEgressFailed
            | Self::StopCommand => ErrorCategory::Governance,

            Self::HandlerError => ErrorCategory::Handler,
            Self::CapabilityDenied => ErrorCategory::Capability,
            Self::ReceiptChainBroken => ErrorCategory::Integrity,
            Self::GovernanceBypassDetected => ErrorCategory::Seal,
            Self::StoreMisconfigured => ErrorCategory::Config,
            Self::StageTimeout | Self::PipelineError => ErrorCategory::Transient,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation (e.g. `"CDI_ACTION_DENIED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidContext => "INVALID_CONTEXT",
            Self::UnknownIntent => "UNKNOWN_INTENT",
            Self::CifIngressFailed => "CIF_INGRESS_FAILED",
            Self::CdiActionDenied => "CDI_ACTION_DENIED",
            Self::CdiOutputDenied => "CDI_OUTPUT_DENIED",
            Self::CifEgressFailed => "CIF_EGRESS_FAILED",
            Self::StopCommand => "STOP_COMMAND",
            Self::HandlerError => "HANDLER_ERROR",
            Self::CapabilityDenied => "CAPABILITY_DENIED",
            Self::ReceiptChainBroken => "RECEIPT_CHAIN_BROKEN",
            Self::GovernanceBypassDetected => "GOVERNANCE_BYPASS_DETECTED",
            Self::StoreMisconfigured => "STORE_MISCONFIGURED",
            Self::StageTimeout => "STAGE_TIMEOUT",
            Self::PipelineError => "PIPELINE_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GovError
// ---------------------------------------------------------------------------

/// Unified governance-substrate error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use gov_errors::{GovError, ErrorCode};
///
/// let err = GovError::new(ErrorCode::CdiActionDenied, "policy denied")
///     .with_context("intent", "payment.refund")
///     .with_context("risk_class", "high_risk");
/// assert_eq!(err.code, ErrorCode::CdiActionDenied);
/// ```
pub struct GovError {
    /// Machine-readable response code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// The pipeline stage active when the error was raised, if any.
    pub stage: Option<String>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl GovError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stage: None,
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach the pipeline stage active when this error occurred.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for GovError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("GovError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref stage) = self.stage {
            d.field("stage", stage);
        }
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for GovError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if let Some(ref stage) = self.stage {
            write!(f, " (stage={stage})")?;
        }
        Ok(())
    }
}

impl std::error::Error for GovError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`GovError`] suitable for wire transmission
/// (the `error` field on a denied pipeline response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ErrorDto {
    /// Response code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Stage active when the error occurred, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl From<&GovError> for ErrorDto {
    fn from(err: &GovError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            stage: err.stage.clone(),
        }
    }
}
