// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only, hash-chained durable receipt store (C2).
//!
//! Two interchangeable realizations are provided — [`file::FileReceiptStore`]
//! (segmented JSONL, rotated by size) and [`sqlite::SqliteReceiptStore`]
//! (a single table guarded by triggers that reject `UPDATE`/`DELETE`).
//! Both satisfy the same [`ReceiptStore`] contract: appends are atomic,
//! chain-linked by content hash, and signed with the process HMAC key.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// File-segmented realization.
pub mod file;
/// Relational (SQLite) realization.
pub mod sqlite;

pub use file::FileReceiptStore;
pub use sqlite::SqliteReceiptStore;

use async_trait::async_trait;
use gov_core::{ChainVerification, Receipt, Stage, Verdict};
use uuid::Uuid;

/// The fields a caller supplies when appending a new durable receipt. The
/// store fills in `timestamp`, `prev_hash`, `sequence_number`, and
/// `chain_signature`.
#[derive(Debug, Clone)]
pub struct ReceiptDraft {
    /// The invocation this entry belongs to (`== trace_id`).
    pub job_id: Uuid,
    /// Which stage this entry records.
    pub stage: Stage,
    /// The intent or action name this entry records.
    pub action: String,
    /// The policy identifier consulted, if any.
    pub policy_id: Option<String>,
    /// Hash of the stage's input payload, if recorded.
    pub inputs_hash: Option<String>,
    /// Hash of the stage's output payload, if recorded.
    pub outputs_hash: Option<String>,
    /// Allow/deny verdict, if this entry represents a decision.
    pub verdict: Option<Verdict>,
    /// Human-readable reason, if any.
    pub reason: Option<String>,
    /// Free-form operator notes.
    pub notes: Option<String>,
    /// Hash of the governing policy treaty document, if any.
    pub treaty_hash: Option<String>,
    /// Version of the governing policy treaty document, if any.
    pub treaty_version: Option<String>,
}

impl ReceiptDraft {
    /// Construct a draft with only the required fields set.
    #[must_use]
    pub fn new(job_id: Uuid, stage: Stage, action: impl Into<String>) -> Self {
        Self {
            job_id,
            stage,
            action: action.into(),
            policy_id: None,
            inputs_hash: None,
            outputs_hash: None,
            verdict: None,
            reason: None,
            notes: None,
            treaty_hash: None,
            treaty_version: None,
        }
    }

    /// Attach an allow/deny verdict (builder-style).
    #[must_use]
    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    /// Attach a human-readable reason (builder-style).
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Errors a [`ReceiptStore`] realization can raise.
///
/// Every variant is fail-closed: on any of these, the caller must treat the
/// append as not having happened, even if some bytes reached disk.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The HMAC key was not initialized, or signing otherwise failed.
    #[error("signing failed: {0}")]
    Signing(gov_errors::GovError),
    /// The process is sealed and no valid governance capability was presented
    /// (C6's `assert_capability` gate on this adapter's factory function).
    #[error("{0}")]
    Seal(gov_errors::GovError),
    /// Underlying filesystem I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Underlying SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored entry could not be deserialized.
    #[error("malformed receipt entry: {0}")]
    Malformed(String),
    /// The chain was found to be empty where a tail was required.
    #[error("receipt chain is empty")]
    Empty,
}

/// The append-only durable receipt store contract (C2).
///
/// Implementations MUST serialize `append` calls through a single mutex so
/// that the tail-hash read, hash/signature computation, and durable write
/// happen atomically with respect to other appends — and MUST perform no
/// `.await` suspension inside that critical section.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Atomically append one durable receipt, chained onto the store's tail.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if signing or the durable write fails. On
    /// error, no partial state is visible to subsequent readers.
    async fn append(&self, draft: ReceiptDraft) -> Result<Receipt, ChainError>;

    /// Return every receipt for `job_id`, in insertion order, across all
    /// rotated segments.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the store cannot be read.
    async fn query_by_job(&self, job_id: Uuid) -> Result<Vec<Receipt>, ChainError>;

    /// Return the most recently appended receipt for `job_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the store cannot be read.
    async fn latest(&self, job_id: Uuid) -> Result<Option<Receipt>, ChainError>;

    /// Recompute every entry's content hash and signature, verify the
    /// `prev_hash` linkage across the entire store, and report the first
    /// offending position, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the store cannot be read.
    async fn verify_chain(&self) -> Result<ChainVerification, ChainError>;
}
