// SPDX-License-Identifier: MIT OR Apache-2.0
//! File-segmented realization of the durable receipt store.
//!
//! One JSON object per line, UTF-8, LF-terminated. Segments are named
//! `eventlog-NNNN.jsonl` with a zero-padded four-digit ordinal; once the
//! current segment's size crosses `rotation_bytes` on the *next* append, a
//! new ordinal starts. Prior segments are never mutated again.

use crate::{ChainError, ReceiptDraft};
use gov_core::{ChainVerification, Receipt, GENESIS};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Default rotation threshold: 4 MiB per segment.
pub const DEFAULT_ROTATION_BYTES: u64 = 4 * 1024 * 1024;

struct AppendState {
    tail_hash: String,
    job_sequences: HashMap<Uuid, u64>,
    current_ordinal: u32,
    current_size: u64,
}

/// File-segmented [`crate::ReceiptStore`] realization.
pub struct FileReceiptStore {
    root: PathBuf,
    rotation_bytes: u64,
    state: Mutex<AppendState>,
}

impl FileReceiptStore {
    /// Open (or create) a store rooted at `root`, scanning existing segments
    /// to recover chain tail state, per-job sequence counters, and the
    /// current segment's size — so rotation and linkage survive a restart.
    ///
    /// `capability` must be `Some` and match the process governance
    /// capability once [`gov_seal::seal`] has been called (C6); before seal,
    /// it is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Seal`] if the process is sealed and `capability`
    /// does not match, or [`ChainError::Io`] if `root` cannot be created or
    /// an existing segment cannot be read or parsed.
    pub fn open(root: impl Into<PathBuf>, rotation_bytes: u64, capability: Option<&[u8]>) -> Result<Self, ChainError> {
        gov_seal::assert_capability(capability).map_err(ChainError::Seal)?;
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let segments = list_segments(&root)?;
        let mut tail_hash = GENESIS.to_string();
        let mut job_sequences: HashMap<Uuid, u64> = HashMap::new();
        let mut current_ordinal = 0u32;
        let mut current_size = 0u64;

        for (ordinal, path) in &segments {
            current_ordinal = *ordinal;
            let contents = std::fs::read_to_string(path)?;
            current_size = contents.len() as u64;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let receipt: Receipt = serde_json::from_str(line)
                    .map_err(|e| ChainError::Malformed(e.to_string()))?;
                tail_hash = receipt.content_hash()?;
                job_sequences.insert(receipt.job_id, receipt.sequence_number + 1);
            }
        }

        Ok(Self {
            root,
            rotation_bytes: rotation_bytes.max(1),
            state: Mutex::new(AppendState {
                tail_hash,
                job_sequences,
                current_ordinal,
                current_size,
            }),
        })
    }

    /// Open with the [`DEFAULT_ROTATION_BYTES`] threshold.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub fn open_default(root: impl Into<PathBuf>, capability: Option<&[u8]>) -> Result<Self, ChainError> {
        Self::open(root, DEFAULT_ROTATION_BYTES, capability)
    }

    fn segment_path(&self, ordinal: u32) -> PathBuf {
        segment_path(&self.root, ordinal)
    }
}

fn segment_path(root: &Path, ordinal: u32) -> PathBuf {
    root.join(format!("eventlog-{ordinal:04}.jsonl"))
}

fn list_segments(root: &Path) -> Result<Vec<(u32, PathBuf)>, ChainError> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(ordinal_str) = stem.strip_prefix("eventlog-") else {
            continue;
        };
        if let Ok(ordinal) = ordinal_str.parse::<u32>() {
            out.push((ordinal, path));
        }
    }
    out.sort_by_key(|(ordinal, _)| *ordinal);
    Ok(out)
}

#[async_trait::async_trait]
impl crate::ReceiptStore for FileReceiptStore {
    async fn append(&self, draft: ReceiptDraft) -> Result<Receipt, ChainError> {
        // Single mutex guards tail-hash read, hash/signature computation, and
        // the durable write — no `.await` occurs anywhere in this block.
        let mut state = self.state.lock().expect("receipt store mutex poisoned");

        let sequence_number = *state.job_sequences.get(&draft.job_id).unwrap_or(&0);
        let prev_hash = state.tail_hash.clone();
        let timestamp = chrono::Utc::now();

        let mut receipt = Receipt {
            job_id: draft.job_id,
            stage: draft.stage,
            action: draft.action,
            timestamp,
            policy_id: draft.policy_id,
            inputs_hash: draft.inputs_hash,
            outputs_hash: draft.outputs_hash,
            verdict: draft.verdict,
            reason: draft.reason,
            notes: draft.notes,
            treaty_hash: draft.treaty_hash,
            treaty_version: draft.treaty_version,
            prev_hash: prev_hash.clone(),
            sequence_number,
            chain_signature: String::new(),
        };
        let content_hash = receipt.content_hash()?;
        receipt.chain_signature =
            gov_crypto::sign(&content_hash, &prev_hash, sequence_number).map_err(ChainError::Signing)?;

        let mut line = serde_json::to_string(&receipt).map_err(|e| ChainError::Malformed(e.to_string()))?;
        line.push('\n');

        if state.current_size > 0 && state.current_size + line.len() as u64 > self.rotation_bytes {
            state.current_ordinal += 1;
            state.current_size = 0;
        }

        let path = self.segment_path(state.current_ordinal);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        state.current_size += line.len() as u64;
        state.tail_hash = content_hash;
        state.job_sequences.insert(draft.job_id, sequence_number + 1);

        tracing::info!(
            target: "gov.receipt_store",
            job_id = %receipt.job_id,
            stage = %receipt.stage,
            sequence_number,
            "appended durable receipt"
        );

        Ok(receipt)
    }

    async fn query_by_job(&self, job_id: Uuid) -> Result<Vec<Receipt>, ChainError> {
        let mut out = Vec::new();
        for (_, path) in list_segments(&self.root)? {
            let contents = std::fs::read_to_string(&path)?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let receipt: Receipt = serde_json::from_str(line)
                    .map_err(|e| ChainError::Malformed(e.to_string()))?;
                if receipt.job_id == job_id {
                    out.push(receipt);
                }
            }
        }
        Ok(out)
    }

    async fn latest(&self, job_id: Uuid) -> Result<Option<Receipt>, ChainError> {
        Ok(self.query_by_job(job_id).await?.into_iter().next_back())
    }

    async fn verify_chain(&self) -> Result<ChainVerification, ChainError> {
        let mut expected_prev = GENESIS.to_string();
        let mut index: usize = 0;

        for (_, path) in list_segments(&self.root)? {
            let contents = std::fs::read_to_string(&path)?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let receipt: Receipt = serde_json::from_str(line)
                    .map_err(|e| ChainError::Malformed(e.to_string()))?;

                if receipt.prev_hash != expected_prev {
                    return Ok(ChainVerification { valid: false, broken_at: Some(index) });
                }
                let content_hash = receipt.content_hash()?;
                let sig_ok = receipt.verify_signature().unwrap_or(false);
                if !sig_ok {
                    return Ok(ChainVerification { valid: false, broken_at: Some(index) });
                }

                expected_prev = content_hash;
                index += 1;
            }
        }

        Ok(ChainVerification { valid: true, broken_at: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReceiptStore;
    use gov_core::Stage;

    fn keyed() {
        let _ = gov_crypto::init_hmac_key(b"file-store-test-secret-aaaaaaaaa");
    }

    #[tokio::test]
    async fn append_chains_and_verifies() {
        keyed();
        let dir = tempfile::tempdir().unwrap();
        let store = FileReceiptStore::open_default(dir.path(), None).unwrap();

        let job_id = Uuid::new_v4();
        store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();
        store.append(ReceiptDraft::new(job_id, Stage::CdiAction, "test.ok")).await.unwrap();

        let chain = store.verify_chain().await.unwrap();
        assert!(chain.valid);

        let receipts = store.query_by_job(job_id).await.unwrap();
        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[0].sequence_number, 0);
        assert_eq!(receipts[1].sequence_number, 1);
        assert_eq!(receipts[1].prev_hash, receipts[0].content_hash().unwrap());
    }

    #[tokio::test]
    async fn tampering_is_detected_by_verify_chain() {
        keyed();
        let dir = tempfile::tempdir().unwrap();
        let store = FileReceiptStore::open_default(dir.path(), None).unwrap();
        let job_id = Uuid::new_v4();
        store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();
        store.append(ReceiptDraft::new(job_id, Stage::CdiAction, "test.ok")).await.unwrap();

        // Tamper with the second entry's `action` field directly on disk.
        let path = dir.path().join("eventlog-0000.jsonl");
        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered: String = contents
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 1 {
                    line.replace("test.ok", "test.tampered")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        std::fs::write(&path, tampered).unwrap();

        let result = store.verify_chain().await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.broken_at, Some(1));
    }

    #[tokio::test]
    async fn rotation_starts_a_new_segment() {
        keyed();
        let dir = tempfile::tempdir().unwrap();
        let store = FileReceiptStore::open(dir.path(), 64, None).unwrap();
        let job_id = Uuid::new_v4();
        for _ in 0..20 {
            store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();
        }
        let segments = list_segments(dir.path()).unwrap();
        assert!(segments.len() > 1, "expected rotation to produce multiple segments");
    }

    #[tokio::test]
    async fn state_recovers_across_reopen() {
        keyed();
        let dir = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        {
            let store = FileReceiptStore::open_default(dir.path(), None).unwrap();
            store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();
        }
        let store = FileReceiptStore::open_default(dir.path(), None).unwrap();
        store.append(ReceiptDraft::new(job_id, Stage::CdiAction, "test.ok")).await.unwrap();
        let receipts = store.query_by_job(job_id).await.unwrap();
        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[1].sequence_number, 1);
    }
}
