use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tglc_core::RequestOutcome;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutcomeIndexError {
    #[error("outcome index IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("outcome index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedOutcome {
    pub outcome: RequestOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct IndexData {
    entries: BTreeMap<String, IndexedOutcome>,
}

/// File-backed index of terminal request outcomes.
///
/// Lets a restarted service answer repeated idempotency keys and status queries for requests
/// it finished before the restart. Rewritten atomically after every insert.
#[derive(Debug)]
pub struct PersistedOutcomeIndex {
    path: PathBuf,
    data: IndexData,
}

impl PersistedOutcomeIndex {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, OutcomeIndexError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                IndexData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            IndexData::default()
        };

        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a terminal outcome. The first outcome stored for a request id wins.
    pub fn record(&mut self, outcome: &RequestOutcome) -> Result<bool, OutcomeIndexError> {
        if self.data.entries.contains_key(&outcome.request_id) {
            return Ok(false);
        }
        self.data.entries.insert(
            outcome.request_id.clone(),
            IndexedOutcome {
                outcome: outcome.clone(),
                recorded_at: Utc::now(),
            },
        );
        self.persist()?;
        Ok(true)
    }

    pub fn get(&self, request_id: &str) -> Option<&RequestOutcome> {
        self.data
            .entries
            .get(request_id)
            .map(|entry| &entry.outcome)
    }

    pub fn len(&self) -> usize {
        self.data.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.entries.is_empty()
    }

    fn persist(&self) -> Result<(), OutcomeIndexError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(&self.data)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tglc_core::{CreditDecision, ReasonCode, RequestStage};
    use uuid::Uuid;

    fn rejected(request_id: &str, reason: ReasonCode) -> RequestOutcome {
        RequestOutcome {
            request_id: request_id.to_string(),
            stage: RequestStage::Rejected,
            decision: Some(CreditDecision::reject(reason)),
            settlement: None,
            detail: None,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn outcomes_persist_across_reload() {
        let dir = std::env::temp_dir().join(format!("tglc-outcomes-{}", Uuid::new_v4()));
        let path = dir.join("outcomes.json");

        let mut index = PersistedOutcomeIndex::load(&path).unwrap();
        assert!(index.record(&rejected("req-1", ReasonCode::Headroom)).unwrap());
        assert!(!index
            .record(&rejected("req-1", ReasonCode::Duration))
            .unwrap());

        let reloaded = PersistedOutcomeIndex::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.get("req-1").unwrap().reason(),
            Some(ReasonCode::Headroom)
        );
    }
}
