//! Read-mostly registries for credentials and bank policies.
//!
//! Both stores replace entries wholesale; nothing is edited in place. Writers hold the lock
//! only for a map insert, so a poisoned lock still guards consistent data and is recovered.

use crate::error::CreditError;
use crate::types::{CreditCredential, CreditPolicy, Corridor, ExposureKey};
use crate::validation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Why a credential stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deactivation {
    Superseded,
    Revoked,
}

/// Registry entry wrapping an issued credential with its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub credential: CreditCredential,
    pub active: bool,
    pub issued_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivation: Option<Deactivation>,
}

impl CredentialRecord {
    fn deactivate(mut self, reason: Deactivation, at: DateTime<Utc>) -> Self {
        self.active = false;
        self.deactivated_at = Some(at);
        self.deactivation = Some(reason);
        self
    }
}

/// Result of a credential lookup. A miss is an expected answer, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(CreditCredential),
    NotFound,
}

impl Lookup {
    pub fn found(self) -> Option<CreditCredential> {
        match self {
            Self::Found(credential) => Some(credential),
            Self::NotFound => None,
        }
    }
}

#[derive(Debug, Default)]
struct CredentialState {
    active: HashMap<ExposureKey, CredentialRecord>,
    history: HashMap<ExposureKey, Vec<CredentialRecord>>,
}

/// Holds at most one active credential per (issuer, business) pair.
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    state: RwLock<CredentialState>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a credential as of `at` without registering it.
    pub fn validate(credential: &CreditCredential, at: DateTime<Utc>) -> Result<(), CreditError> {
        validation::validate_identifier("issuer", &credential.issuer)?;
        validation::validate_identifier("business_id", &credential.business_id)?;
        validation::validate_amount("credit_limit_minor", credential.credit_limit_minor)?;
        if credential.corridors.is_empty() {
            return Err(CreditError::validation(
                "credential must authorize at least one corridor",
            ));
        }
        if credential.expires_at <= at {
            return Err(CreditError::validation(format!(
                "credential expiry {} is not in the future",
                credential.expires_at
            )));
        }
        Ok(())
    }

    pub fn register(&self, credential: CreditCredential) -> Result<CredentialRecord, CreditError> {
        self.register_at(credential, Utc::now())
    }

    /// Register `credential`, superseding any active one for the same pair.
    pub fn register_at(
        &self,
        credential: CreditCredential,
        at: DateTime<Utc>,
    ) -> Result<CredentialRecord, CreditError> {
        Self::validate(&credential, at)?;

        let key = credential.exposure_key();
        let record = CredentialRecord {
            credential,
            active: true,
            issued_at: at,
            deactivated_at: None,
            deactivation: None,
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = state.active.insert(key.clone(), record.clone()) {
            state
                .history
                .entry(key.clone())
                .or_default()
                .push(previous.deactivate(Deactivation::Superseded, at));
            info!(key = %key, "credential superseded by re-issuance");
        } else {
            info!(key = %key, "credential registered");
        }

        Ok(record)
    }

    /// Restore a persisted record without re-validating its expiry.
    pub fn restore(&self, record: CredentialRecord) {
        let key = record.credential.exposure_key();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if record.active {
            state.active.insert(key, record);
        } else {
            state.history.entry(key).or_default().push(record);
        }
    }

    pub fn lookup(&self, business_id: &str, bank_id: &str, corridor: &Corridor) -> Lookup {
        self.lookup_at(business_id, bank_id, corridor, Utc::now())
    }

    pub fn lookup_at(
        &self,
        business_id: &str,
        bank_id: &str,
        corridor: &Corridor,
        at: DateTime<Utc>,
    ) -> Lookup {
        let key = ExposureKey::new(business_id, bank_id);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.active.get(&key) {
            Some(record)
                if record.active
                    && !record.credential.is_expired_at(at)
                    && record.credential.covers(corridor) =>
            {
                Lookup::Found(record.credential.clone())
            }
            _ => {
                debug!(key = %key, corridor = %corridor, "no eligible credential");
                Lookup::NotFound
            }
        }
    }

    /// Deactivate the pair's credential. Returns the revoked record, if there was one.
    pub fn revoke(&self, business_id: &str, bank_id: &str) -> Option<CredentialRecord> {
        self.revoke_at(business_id, bank_id, Utc::now())
    }

    pub fn revoke_at(
        &self,
        business_id: &str,
        bank_id: &str,
        at: DateTime<Utc>,
    ) -> Option<CredentialRecord> {
        let key = ExposureKey::new(business_id, bank_id);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let revoked = state
            .active
            .remove(&key)?
            .deactivate(Deactivation::Revoked, at);
        state
            .history
            .entry(key.clone())
            .or_default()
            .push(revoked.clone());
        info!(key = %key, "credential revoked");
        Some(revoked)
    }

    /// Superseded and revoked records for a pair, oldest first.
    pub fn history(&self, business_id: &str, bank_id: &str) -> Vec<CredentialRecord> {
        let key = ExposureKey::new(business_id, bank_id);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.history.get(&key).cloned().unwrap_or_default()
    }

    pub fn active_record(&self, business_id: &str, bank_id: &str) -> Option<CredentialRecord> {
        let key = ExposureKey::new(business_id, bank_id);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.active.get(&key).cloned()
    }
}

/// Bank policies keyed by bank id.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, CreditPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bank's policy wholesale. Returns the previous policy.
    pub fn set(&self, policy: CreditPolicy) -> Result<Option<CreditPolicy>, CreditError> {
        policy.validate()?;
        let bank_id = policy.bank_id.clone();
        let mut policies = self
            .policies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = policies.insert(bank_id.clone(), policy);
        info!(bank_id = %bank_id, replaced = previous.is_some(), "credit policy set");
        Ok(previous)
    }

    pub fn get(&self, bank_id: &str) -> Option<CreditPolicy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bank_id)
            .cloned()
    }
}
