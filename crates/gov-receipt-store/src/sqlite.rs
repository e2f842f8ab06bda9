// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relational (SQLite) realization of the durable receipt store.
//!
//! A single `receipts` table, append-only enforced at the database layer by
//! `BEFORE UPDATE`/`BEFORE DELETE` triggers that raise the distinctive error
//! text `"Receipts are append-only: <OP> not allowed"`. Chain verification
//! does not rely on the triggers holding — it recomputes every hash and
//! signature independently, so tampering that bypasses the triggers (e.g. a
//! raw file-level edit of the database) is still caught.

use crate::{ChainError, ReceiptDraft};
use gov_core::{ChainVerification, Receipt, Stage, Verdict, GENESIS};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS receipts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id          TEXT NOT NULL,
    stage           TEXT NOT NULL,
    action          TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    policy_id       TEXT,
    inputs_hash     TEXT,
    outputs_hash    TEXT,
    verdict         TEXT,
    reason          TEXT,
    notes           TEXT,
    treaty_hash     TEXT,
    treaty_version  TEXT,
    prev_hash       TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    chain_signature TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_receipts_job_id ON receipts(job_id);
CREATE TRIGGER IF NOT EXISTS receipts_no_update
BEFORE UPDATE ON receipts
BEGIN
    SELECT RAISE(ABORT, 'Receipts are append-only: UPDATE not allowed');
END;
CREATE TRIGGER IF NOT EXISTS receipts_no_delete
BEFORE DELETE ON receipts
BEGIN
    SELECT RAISE(ABORT, 'Receipts are append-only: DELETE not allowed');
END;
"#;

struct State {
    conn: Connection,
    tail_hash: String,
    job_sequences: HashMap<Uuid, u64>,
}

/// SQLite-backed [`crate::ReceiptStore`] realization.
pub struct SqliteReceiptStore {
    state: Mutex<State>,
}

impl SqliteReceiptStore {
    /// Open (or create) the database at `path`, applying schema and
    /// recovering chain tail state from existing rows.
    ///
    /// `capability` must be `Some` and match the process governance
    /// capability once [`gov_seal::seal`] has been called (C6); before seal,
    /// it is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Seal`] if the process is sealed and `capability`
    /// does not match, or [`ChainError::Sqlite`] if the database cannot be
    /// opened, migrated, or scanned.
    pub fn open(path: impl AsRef<Path>, capability: Option<&[u8]>) -> Result<Self, ChainError> {
        gov_seal::assert_capability(capability).map_err(ChainError::Seal)?;
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        let mut tail_hash = GENESIS.to_string();
        let mut job_sequences: HashMap<Uuid, u64> = HashMap::new();

        {
            let mut stmt = conn.prepare("SELECT * FROM receipts ORDER BY id ASC")?;
            let rows = stmt.query_map([], row_to_receipt)?;
            for row in rows {
                let receipt = row?;
                tail_hash = receipt
                    .content_hash()
                    .map_err(|e| ChainError::Malformed(e.to_string()))?;
                job_sequences.insert(receipt.job_id, receipt.sequence_number + 1);
            }
        }

        Ok(Self {
            state: Mutex::new(State { conn, tail_hash, job_sequences }),
        })
    }

    /// Open an in-memory database, useful for tests and the CLI's
    /// no-op smoke-test mode.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub fn open_in_memory(capability: Option<&[u8]>) -> Result<Self, ChainError> {
        gov_seal::assert_capability(capability).map_err(ChainError::Seal)?;
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            state: Mutex::new(State {
                conn,
                tail_hash: GENESIS.to_string(),
                job_sequences: HashMap::new(),
            }),
        })
    }
}

fn row_to_receipt(row: &Row<'_>) -> rusqlite::Result<Receipt> {
    let job_id: String = row.get("job_id")?;
    let stage: String = row.get("stage")?;
    let verdict: Option<String> = row.get("verdict")?;
    let timestamp: String = row.get("timestamp")?;

    Ok(Receipt {
        job_id: Uuid::parse_str(&job_id).unwrap_or_default(),
        stage: serde_json::from_value(serde_json::Value::String(stage)).unwrap_or(Stage::Failed),
        action: row.get("action")?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        policy_id: row.get("policy_id")?,
        inputs_hash: row.get("inputs_hash")?,
        outputs_hash: row.get("outputs_hash")?,
        verdict: verdict.and_then(|v| match v.as_str() {
            "allow" => Some(Verdict::Allow),
            "deny" => Some(Verdict::Deny),
            _ => None,
        }),
        reason: row.get("reason")?,
        notes: row.get("notes")?,
        treaty_hash: row.get("treaty_hash")?,
        treaty_version: row.get("treaty_version")?,
        prev_hash: row.get("prev_hash")?,
        sequence_number: {
            let n: i64 = row.get("sequence_number")?;
            n as u64
        },
        chain_signature: row.get("chain_signature")?,
    })
}

fn stage_str(stage: Stage) -> String {
    serde_json::to_value(stage)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| "FAILED".to_string())
}

fn verdict_str(verdict: Option<Verdict>) -> Option<String> {
    verdict.map(|v| match v {
        Verdict::Allow => "allow".to_string(),
        Verdict::Deny => "deny".to_string(),
    })
}

#[async_trait::async_trait]
impl crate::ReceiptStore for SqliteReceiptStore {
    async fn append(&self, draft: ReceiptDraft) -> Result<Receipt, ChainError> {
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
        let content_hash = receipt.content_hash().map_err(ChainError::Signing)?;
        receipt.chain_signature =
            gov_crypto::sign(&content_hash, &prev_hash, sequence_number).map_err(ChainError::Signing)?;

        state.conn.execute(
            "INSERT INTO receipts (
                job_id, stage, action, timestamp, policy_id, inputs_hash, outputs_hash,
                verdict, reason, notes, treaty_hash, treaty_version,
                prev_hash, sequence_number, chain_signature
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                receipt.job_id.to_string(),
                stage_str(receipt.stage),
                receipt.action,
                receipt.timestamp.to_rfc3339(),
                receipt.policy_id,
                receipt.inputs_hash,
                receipt.outputs_hash,
                verdict_str(receipt.verdict),
                receipt.reason,
                receipt.notes,
                receipt.treaty_hash,
                receipt.treaty_version,
                receipt.prev_hash,
                receipt.sequence_number as i64,
                receipt.chain_signature,
            ],
        )?;

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
        let state = self.state.lock().expect("receipt store mutex poisoned");
        let mut stmt = state
            .conn
            .prepare("SELECT * FROM receipts WHERE job_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![job_id.to_string()], row_to_receipt)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn latest(&self, job_id: Uuid) -> Result<Option<Receipt>, ChainError> {
        let state = self.state.lock().expect("receipt store mutex poisoned");
        let receipt = state
            .conn
            .query_row(
                "SELECT * FROM receipts WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                params![job_id.to_string()],
                row_to_receipt,
            )
            .optional()?;
        Ok(receipt)
    }

    async fn verify_chain(&self) -> Result<ChainVerification, ChainError> {
        let state = self.state.lock().expect("receipt store mutex poisoned");
        let mut stmt = state.conn.prepare("SELECT * FROM receipts ORDER BY id ASC")?;
        let rows = stmt.query_map([], row_to_receipt)?;

        let mut expected_prev = GENESIS.to_string();
        let mut index: usize = 0;

        for row in rows {
            let receipt = row?;
            if receipt.prev_hash != expected_prev {
                return Ok(ChainVerification { valid: false, broken_at: Some(index) });
            }
            let content_hash = receipt
                .content_hash()
                .map_err(|e| ChainError::Malformed(e.to_string()))?;
            if !receipt.verify_signature().unwrap_or(false) {
                return Ok(ChainVerification { valid: false, broken_at: Some(index) });
            }
            expected_prev = content_hash;
            index += 1;
        }

        Ok(ChainVerification { valid: true, broken_at: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReceiptStore;

    fn keyed() {
        let _ = gov_crypto::init_hmac_key(b"sqlite-store-test-secret-aaaaaaaa");
    }

    #[tokio::test]
    async fn append_and_verify_round_trip() {
        keyed();
        let store = SqliteReceiptStore::open_in_memory(None).unwrap();
        let job_id = Uuid::new_v4();
        store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();
        store.append(ReceiptDraft::new(job_id, Stage::CdiAction, "test.ok")).await.unwrap();

        let chain = store.verify_chain().await.unwrap();
        assert!(chain.valid);

        let latest = store.latest(job_id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 1);
    }

    #[tokio::test]
    async fn update_trigger_rejects_mutation() {
        keyed();
        let store = SqliteReceiptStore::open_in_memory(None).unwrap();
        let job_id = Uuid::new_v4();
        store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();

        let state = store.state.lock().unwrap();
        let result = state.conn.execute("UPDATE receipts SET action = 'hacked' WHERE id = 1", []);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("append-only"));
    }

    #[tokio::test]
    async fn delete_trigger_rejects_deletion() {
        keyed();
        let store = SqliteReceiptStore::open_in_memory(None).unwrap();
        let job_id = Uuid::new_v4();
        store.append(ReceiptDraft::new(job_id, Stage::CifIngress, "test.ok")).await.unwrap();

        let state = store.state.lock().unwrap();
        let result = state.conn.execute("DELETE FROM receipts WHERE id = 1", []);
        assert!(result.is_err());
    }
}
