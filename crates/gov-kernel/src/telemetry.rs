// SPDX-License-Identifier: MIT OR Apache-2.0
//! Basic ambient counters for pipeline activity.
//!
//! This is not the pluggable "metrics system" the spec's Non-goals exclude —
//! it is the same kind of in-process counter set `abp_runtime::telemetry`
//! keeps for its own pipeline, exposed via a `snapshot()` DTO rather than a
//! wire protocol.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one process's pipeline activity.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    requests_denied: AtomicU64,
    cif_ingress_failures: AtomicU64,
    cdi_action_denials: AtomicU64,
    handler_errors: AtomicU64,
    cdi_output_denials: AtomicU64,
    cif_egress_failures: AtomicU64,
    stage_timeouts: AtomicU64,
    stop_commands: AtomicU64,
    tokens_issued: AtomicU64,
    tokens_revoked: AtomicU64,
    chain_verify_failures: AtomicU64,
}

impl PipelineMetrics {
    /// Construct a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self, code: gov_errors::ErrorCode) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
        use gov_errors::ErrorCode;
        match code {
            ErrorCode::CifIngressFailed => self.cif_ingress_failures.fetch_add(1, Ordering::Relaxed),
            ErrorCode::CdiActionDenied | ErrorCode::UnknownIntent => {
                self.cdi_action_denials.fetch_add(1, Ordering::Relaxed)
            }
            ErrorCode::HandlerError => self.handler_errors.fetch_add(1, Ordering::Relaxed),
            ErrorCode::CdiOutputDenied => self.cdi_output_denials.fetch_add(1, Ordering::Relaxed),
            ErrorCode::CifEgressFailed => self.cif_egress_failures.fetch_add(1, Ordering::Relaxed),
            ErrorCode::StageTimeout => self.stage_timeouts.fetch_add(1, Ordering::Relaxed),
            ErrorCode::StopCommand => self.stop_commands.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub(crate) fn record_tokens_issued(&self, count: u64) {
        self.tokens_issued.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_tokens_revoked(&self, count: u64) {
        self.tokens_revoked.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_chain_verify_failure(&self) {
        self.chain_verify_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            cif_ingress_failures: self.cif_ingress_failures.load(Ordering::Relaxed),
            cdi_action_denials: self.cdi_action_denials.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            cdi_output_denials: self.cdi_output_denials.load(Ordering::Relaxed),
            cif_egress_failures: self.cif_egress_failures.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
            stop_commands: self.stop_commands.load(Ordering::Relaxed),
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            tokens_revoked: self.tokens_revoked.load(Ordering::Relaxed),
            chain_verify_failures: self.chain_verify_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, serializable view of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    /// Total pipeline executions started.
    pub requests_started: u64,
    /// Total pipeline executions that reached `COMPLETE`.
    pub requests_completed: u64,
    /// Total pipeline executions that ended denied or failed.
    pub requests_denied: u64,
    /// Denials at `CIF_INGRESS`.
    pub cif_ingress_failures: u64,
    /// Denials at `CDI_ACTION` (including unknown-intent).
    pub cdi_action_denials: u64,
    /// Handler invocation errors.
    pub handler_errors: u64,
    /// Denials at `CDI_OUTPUT`.
    pub cdi_output_denials: u64,
    /// Denials at `CIF_EGRESS`.
    pub cif_egress_failures: u64,
    /// Stage deadlines exceeded.
    pub stage_timeouts: u64,
    /// STOP commands issued.
    pub stop_commands: u64,
    /// Capability tokens issued.
    pub tokens_issued: u64,
    /// Capability tokens revoked.
    pub tokens_revoked: u64,
    /// Receipt-chain verification failures observed.
    pub chain_verify_failures: u64,
}
