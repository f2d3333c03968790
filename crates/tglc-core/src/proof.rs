use crate::error::CreditError;
use crate::types::{ProofPayload, ProofSource, ProofVerificationResult, DEFAULT_RATE_METRIC};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Default tolerance for proof timestamps ahead of the verifier clock.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

/// Signature authority consulted for oracle and audited proofs.
///
/// Async because production anchors may call out to a key service.
#[async_trait]
pub trait TrustAnchor: Send + Sync {
    async fn verify_signature(&self, message: &[u8], signature: &str, source: ProofSource) -> bool;
}

/// Trust anchor holding one Ed25519 verifying key per proof source.
#[derive(Debug, Clone, Default)]
pub struct Ed25519TrustAnchor {
    keys: HashMap<ProofSource, VerifyingKey>,
}

impl Ed25519TrustAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, source: ProofSource, key: VerifyingKey) -> Self {
        self.keys.insert(source, key);
        self
    }

    /// Register a hex-encoded 32-byte public key for `source`.
    pub fn with_hex_key(self, source: ProofSource, key_hex: &str) -> Result<Self, CreditError> {
        let bytes: [u8; 32] = hex::decode(key_hex.trim())
            .map_err(|e| CreditError::validation(format!("trust anchor key is not hex: {e}")))?
            .try_into()
            .map_err(|_| CreditError::validation("trust anchor key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
            CreditError::validation(format!("invalid {} trust anchor key: {e}", source.as_str()))
        })?;
        Ok(self.with_key(source, key))
    }

    pub fn has_key(&self, source: ProofSource) -> bool {
        self.keys.contains_key(&source)
    }
}

#[async_trait]
impl TrustAnchor for Ed25519TrustAnchor {
    async fn verify_signature(&self, message: &[u8], signature: &str, source: ProofSource) -> bool {
        let Some(key) = self.keys.get(&source) else {
            return false;
        };
        let Ok(bytes) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&bytes)).is_ok()
    }
}

/// Sign `proof` with `key` and return it carrying the hex signature.
pub fn sign_proof(proof: ProofPayload, key: &SigningKey) -> ProofPayload {
    let signature = key.sign(&proof.signing_bytes());
    proof.with_signature(hex::encode(signature.to_bytes()))
}

/// Step function from default rate to confidence.
pub fn confidence_for(default_rate: f64) -> u8 {
    if default_rate < 0.05 {
        100
    } else if default_rate < 0.10 {
        75
    } else {
        50
    }
}

/// Validates and scores proof payloads.
///
/// Holds no mutable state; results depend only on the proof, the evaluation instant and the
/// trust anchor's answer.
#[derive(Clone)]
pub struct ProofVerifier {
    anchor: Arc<dyn TrustAnchor>,
    clock_skew: Duration,
}

impl ProofVerifier {
    pub fn new(anchor: Arc<dyn TrustAnchor>) -> Self {
        Self {
            anchor,
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
        }
    }

    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    pub async fn verify(
        &self,
        proof: &ProofPayload,
        at: DateTime<Utc>,
    ) -> Result<ProofVerificationResult, CreditError> {
        let default_rate = proof.default_rate().ok_or_else(|| {
            CreditError::validation(format!("proof metrics lack '{DEFAULT_RATE_METRIC}'"))
        })?;
        if !default_rate.is_finite() || !(0.0..=1.0).contains(&default_rate) {
            return Err(CreditError::validation(format!(
                "default_rate {default_rate} is outside [0, 1]"
            )));
        }
        if proof.timestamp > at + self.clock_skew {
            return Err(CreditError::validation(format!(
                "proof timestamp {} is in the future",
                proof.timestamp
            )));
        }

        if proof.source.requires_signature() {
            let signature = proof.signature.as_deref().ok_or_else(|| {
                CreditError::ProofInvalid(format!("{} proof is unsigned", proof.source.as_str()))
            })?;
            let trusted = self
                .anchor
                .verify_signature(&proof.signing_bytes(), signature, proof.source)
                .await;
            if !trusted {
                return Err(CreditError::ProofInvalid(format!(
                    "{} proof signature rejected by trust anchor",
                    proof.source.as_str()
                )));
            }
        }

        let confidence_score = confidence_for(default_rate);
        let mut violations = Vec::new();
        if confidence_score == 50 {
            violations.push("elevated_default_rate".to_string());
        }
        debug!(
            source = proof.source.as_str(),
            default_rate,
            confidence_score,
            "proof verified"
        );

        Ok(ProofVerificationResult {
            valid: confidence_score >= 50,
            confidence_score,
            default_rate,
            violations,
        })
    }
}
