use crate::error::CreditError;
use crate::flow::RequestStage;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryKind {
    Transition,
    Decision,
    Settlement,
    Outcome,
    Advisory,
}

impl AuditEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transition => "transition",
            Self::Decision => "decision",
            Self::Settlement => "settlement",
            Self::Outcome => "outcome",
            Self::Advisory => "advisory",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CreditError> {
        match value {
            "transition" => Ok(Self::Transition),
            "decision" => Ok(Self::Decision),
            "settlement" => Ok(Self::Settlement),
            "outcome" => Ok(Self::Outcome),
            "advisory" => Ok(Self::Advisory),
            other => Err(CreditError::Storage(format!(
                "unknown audit entry kind '{other}'"
            ))),
        }
    }
}

/// Hash-chained decision log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    pub request_id: String,
    pub kind: AuditEntryKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Stage change recorded for a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionEvent {
    pub from: Option<RequestStage>,
    pub to: RequestStage,
    pub detail: String,
}

/// Append-only decision log with a blake3 hash chain.
///
/// There is no way to edit or remove an entry; corrections are new entries.
#[derive(Debug, Default, Clone)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a trail from persisted entries, rejecting gaps and broken links.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, CreditError> {
        let trail = Self { entries };

        for (expected_index, entry) in trail.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(CreditError::Storage(format!(
                    "audit index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !trail.verify_chain() {
            return Err(CreditError::Storage(
                "persisted audit hash-chain verification failed".to_string(),
            ));
        }

        Ok(trail)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for(&self, request_id: &str) -> Vec<AuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected_hash = compute_entry_hash(
                entry.index,
                &entry.request_id,
                entry.kind,
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash || entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    pub fn append(
        &mut self,
        request_id: &str,
        kind: AuditEntryKind,
        payload: Value,
    ) -> Result<AuditEntry, CreditError> {
        let entry = self.build_entry(request_id, kind, payload);
        self.commit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Build the next entry without touching the chain.
    pub fn build_entry(&self, request_id: &str, kind: AuditEntryKind, payload: Value) -> AuditEntry {
        let index = self.entries.len() as u64;
        // Postgres TIMESTAMPTZ keeps microseconds; hashing more would break reloads.
        let timestamp = Utc::now().trunc_subsecs(6);
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            request_id,
            kind,
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );

        AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            request_id: request_id.to_string(),
            kind,
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        }
    }

    /// Commit a built entry once it is durable elsewhere.
    pub fn commit_entry(&mut self, entry: AuditEntry) -> Result<(), CreditError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(CreditError::InvariantViolation(format!(
                "audit commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous = self.entries.last().map(|e| e.entry_hash.clone());
        if entry.previous_hash != expected_previous {
            return Err(CreditError::InvariantViolation(
                "audit commit previous hash mismatch".to_string(),
            ));
        }

        let expected_hash = compute_entry_hash(
            entry.index,
            &entry.request_id,
            entry.kind,
            entry.timestamp,
            &entry.payload,
            entry.previous_hash.as_deref(),
        );
        if entry.entry_hash != expected_hash {
            return Err(CreditError::InvariantViolation(
                "audit commit hash mismatch".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(
    index: u64,
    request_id: &str,
    kind: AuditEntryKind,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "request_id": request_id,
        "kind": kind,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
