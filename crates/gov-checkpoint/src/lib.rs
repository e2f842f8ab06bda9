// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable per-request checkpoint store (C3).
//!
//! One JSON file per `job_id`, written with full-record-replace semantics
//! (write to a temp file in the same directory, then rename — so a reader
//! never observes a partially written checkpoint). Unlike the receipt store,
//! checkpoints are mutable records: each call replaces the whole file.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use gov_core::Stage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Terminal or in-progress status of a checkpointed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    /// The job is actively executing.
    Running,
    /// The job failed in a way an operator can retry from the last good stage.
    ResumableFailure,
    /// The job completed successfully.
    Done,
    /// The job failed terminally.
    Failed,
}

/// The outcome recorded for a single `update_stage` call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageOutcome {
    /// Whether this stage succeeded.
    pub success: bool,
    /// Stage output payload, present when `success` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    /// Error description, present when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageOutcome {
    /// A successful outcome carrying `outputs`.
    #[must_use]
    pub fn success(outputs: serde_json::Value) -> Self {
        Self { success: true, outputs: Some(outputs), error: None }
    }

    /// A failed outcome carrying an error description.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, outputs: None, error: Some(error.into()) }
    }
}

/// One entry in a checkpoint's stage history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageRecord {
    /// Which stage this entry records.
    pub stage: Stage,
    /// The recorded outcome.
    pub outcome: StageOutcome,
    /// When this entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// A durable checkpoint for one job's execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CheckpointRecord {
    /// The job this checkpoint tracks.
    pub job_id: Uuid,
    /// Caller-defined job type/kind tag.
    pub job_type: String,
    /// The original input payload.
    pub inputs: serde_json::Value,
    /// Current status.
    pub status: CheckpointStatus,
    /// Stage history, in call order.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    /// Set when `status` is `FAILED` or `RESUMABLE_FAILURE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When this checkpoint was first created.
    pub created_at: DateTime<Utc>,
    /// When this checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

/// Errors raised by [`CheckpointStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// No checkpoint exists for the requested `job_id`.
    #[error("no checkpoint for job {0}")]
    NotFound(Uuid),
    /// A checkpoint already exists for the `job_id` passed to `create`.
    #[error("checkpoint already exists for job {0}")]
    AlreadyExists(Uuid),
    /// Underlying filesystem I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored checkpoint could not be deserialized.
    #[error("malformed checkpoint: {0}")]
    Serde(#[from] serde_json::Error),
    /// The process is sealed and no valid governance capability was presented
    /// (C6's `assert_capability` gate on this adapter's factory function).
    #[error("{0}")]
    Seal(gov_errors::GovError),
}

/// File-backed durable checkpoint store (C3).
pub struct CheckpointStore {
    root: PathBuf,
    // Serializes create/update/mark_* so a concurrent writer for the same
    // store never interleaves a temp-write with a rename.
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Open (or create) a checkpoint store rooted at `root`.
    ///
    /// `capability` must be `Some` and match the process governance
    /// capability once [`gov_seal::seal`] has been called (C6); before seal,
    /// it is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Seal`] if the process is sealed and
    /// `capability` does not match, or [`CheckpointError::Io`] if `root`
    /// cannot be created.
    pub fn open(root: impl Into<PathBuf>, capability: Option<&[u8]>) -> Result<Self, CheckpointError> {
        gov_seal::assert_capability(capability).map_err(CheckpointError::Seal)?;
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, write_lock: Mutex::new(()) })
    }

    fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("{job_id}.json"))
    }

    /// Create a new `RUNNING` checkpoint for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::AlreadyExists`] if a checkpoint for this
    /// job already exists, or [`CheckpointError::Io`]/[`CheckpointError::Serde`]
    /// on a write failure.
    pub fn create(
        &self,
        job_id: Uuid,
        job_type: impl Into<String>,
        inputs: serde_json::Value,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let _guard = self.write_lock.lock().expect("checkpoint store mutex poisoned");
        let path = self.path_for(job_id);
        if path.exists() {
            return Err(CheckpointError::AlreadyExists(job_id));
        }
        let now = Utc::now();
        let record = CheckpointRecord {
            job_id,
            job_type: job_type.into(),
            inputs,
            status: CheckpointStatus::Running,
            stages: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.write_record(&record)?;
        tracing::info!(target: "gov.checkpoint", job_id = %job_id, "checkpoint created");
        Ok(record)
    }

    /// Load the checkpoint for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if no checkpoint exists, or
    /// [`CheckpointError::Io`]/[`CheckpointError::Serde`] on a read failure.
    pub fn load(&self, job_id: Uuid) -> Result<CheckpointRecord, CheckpointError> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Err(CheckpointError::NotFound(job_id));
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Append a stage outcome to the job's history and persist the whole
    /// record via full-record replace.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if no checkpoint exists for
    /// `job_id`.
    pub fn update_stage(
        &self,
        job_id: Uuid,
        stage: Stage,
        outcome: StageOutcome,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let _guard = self.write_lock.lock().expect("checkpoint store mutex poisoned");
        let mut record = self.load(job_id)?;
        record.stages.push(StageRecord { stage, outcome, recorded_at: Utc::now() });
        record.updated_at = Utc::now();
        self.write_record(&record)?;
        Ok(record)
    }

    /// Mark a checkpoint `DONE`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if no checkpoint exists.
    pub fn mark_complete(&self, job_id: Uuid) -> Result<CheckpointRecord, CheckpointError> {
        self.set_terminal_status(job_id, CheckpointStatus::Done, None)
    }

    /// Mark a checkpoint `FAILED` with a terminal `reason`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if no checkpoint exists.
    pub fn mark_failed(&self, job_id: Uuid, reason: impl Into<String>) -> Result<CheckpointRecord, CheckpointError> {
        self.set_terminal_status(job_id, CheckpointStatus::Failed, Some(reason.into()))
    }

    /// Mark a checkpoint `RESUMABLE_FAILURE` with a `reason`, signaling an
    /// operator can retry from the last good stage.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if no checkpoint exists.
    pub fn mark_resumable_failure(
        &self,
        job_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<CheckpointRecord, CheckpointError> {
        self.set_terminal_status(job_id, CheckpointStatus::ResumableFailure, Some(reason.into()))
    }

    fn set_terminal_status(
        &self,
        job_id: Uuid,
        status: CheckpointStatus,
        reason: Option<String>,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let _guard = self.write_lock.lock().expect("checkpoint store mutex poisoned");
        let mut record = self.load(job_id)?;
        record.status = status;
        record.failure_reason = reason;
        record.updated_at = Utc::now();
        self.write_record(&record)?;
        tracing::info!(target: "gov.checkpoint", job_id = %job_id, ?status, "checkpoint status updated");
        Ok(record)
    }

    /// List every job id with a checkpoint in this store.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the store directory cannot be read.
    pub fn list(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn write_record(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.path_for(record.job_id);
        let tmp_path = self.root.join(format!("{}.json.tmp", record.job_id));
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// Compute the hex-encoded SHA-256 digest of a file's raw bytes. Used to
/// detect drift in checkpointed artifacts (e.g. a staged workspace) across
/// restarts; deterministic because it hashes raw bytes, not a
/// process-local representation.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if `path` cannot be read.
pub fn hash_content(path: &Path) -> Result<String, CheckpointError> {
    let bytes = std::fs::read(path)?;
    Ok(gov_crypto::sha256_hex(&bytes))
}

/// Verify that the file at `path` hashes to `expected`.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if `path` cannot be read.
pub fn verify_content_hash(path: &Path, expected: &str) -> Result<bool, CheckpointError> {
    Ok(hash_content(path)? == expected)
}
