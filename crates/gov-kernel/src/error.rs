// SPDX-License-Identifier: MIT OR Apache-2.0
//! Top-level pipeline error, unifying every component error this crate
//! touches behind a single [`ErrorCode`].

use gov_errors::{ErrorCode, GovError};

/// Everything that can abort a pipeline execution before a response is
/// produced.
///
/// Every variant maps to exactly one [`ErrorCode`] via [`Self::response_code`],
/// matching the response-code table in the external interface contract.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// `RequestContext` construction or normalization failed.
    #[error("invalid context: {0}")]
    InvalidContext(GovError),
    /// No handler is registered for the requested intent.
    #[error("unknown intent: {0}")]
    UnknownIntent(String),
    /// `governance.validate_ingress` returned `valid: false`.
    #[error("CIF ingress failed: {0}")]
    CifIngressFailed(String),
    /// `governance.check_action` returned `allowed: false`.
    #[error("CDI action denied: {0}")]
    CdiActionDenied(String),
    /// The registered handler raised an error during invocation.
    #[error("handler error: {0}")]
    HandlerError(String),
    /// `governance.check_output` returned `valid: false`.
    #[error("CDI output denied: {0}")]
    CdiOutputDenied(String),
    /// `governance.validate_egress` returned `valid: false`.
    #[error("CIF egress failed: {0}")]
    CifEgressFailed(String),
    /// A stage did not complete before its deadline.
    #[error("stage timeout in {0}")]
    StageTimeout(String),
    /// The STOP command terminated this trace.
    #[error("stopped")]
    StopCommand,
    /// Receipt-store or other storage I/O failed while processing a stage.
    #[error("pipeline error: {0}")]
    Storage(GovError),
    /// An otherwise-unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(GovError),
}

impl PipelineError {
    /// The stable response code this error maps to on the wire.
    #[must_use]
    pub fn response_code(&self) -> ErrorCode {
        match self {
            Self::InvalidContext(_) => ErrorCode::InvalidContext,
            Self::UnknownIntent(_) => ErrorCode::UnknownIntent,
            Self::CifIngressFailed(_) => ErrorCode::CifIngressFailed,
            Self::CdiActionDenied(_) => ErrorCode::CdiActionDenied,
            Self::HandlerError(_) => ErrorCode::HandlerError,
            Self::CdiOutputDenied(_) => ErrorCode::CdiOutputDenied,
            Self::CifEgressFailed(_) => ErrorCode::CifEgressFailed,
            Self::StageTimeout(_) => ErrorCode::StageTimeout,
            Self::StopCommand => ErrorCode::StopCommand,
            Self::Storage(_) => ErrorCode::PipelineError,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<GovError> for PipelineError {
    fn from(err: GovError) -> Self {
        Self::Internal(err)
    }
}

impl From<gov_registry::RegistryError> for PipelineError {
    fn from(err: gov_registry::RegistryError) -> Self {
        match err {
            gov_registry::RegistryError::UnknownIntent(intent) => Self::UnknownIntent(intent),
            gov_registry::RegistryError::HandlerFailed(reason) => Self::HandlerError(reason),
            other => Self::Internal(GovError::new(ErrorCode::Internal, other.to_string())),
        }
    }
}

impl From<gov_captoken::TokenError> for PipelineError {
    fn from(err: gov_captoken::TokenError) -> Self {
        Self::Internal(GovError::new(ErrorCode::Internal, err.to_string()))
    }
}

impl From<gov_receipt_store::ChainError> for PipelineError {
    fn from(err: gov_receipt_store::ChainError) -> Self {
        Self::Storage(GovError::new(ErrorCode::PipelineError, err.to_string()).with_source(err))
    }
}
