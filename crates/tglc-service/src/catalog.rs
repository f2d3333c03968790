use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tglc_core::{CreditCredential, CreditPolicy};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Startup catalog of credentials and bank policies.
///
/// ```json
/// {
///   "policies": [{"bank_id": "bank-1", "max_duration_days": 30, "max_default_rate": 0.1,
///                 "max_exposure_minor": 800000}],
///   "credentials": [{"issuer": "bank-1", "business_id": "biz-1",
///                    "credit_limit_minor": 1000000, "corridors": ["SGD-USDC"],
///                    "expires_at": "2027-01-01T00:00:00Z"}]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub policies: Vec<CreditPolicy>,
    #[serde(default)]
    pub credentials: Vec<CreditCredential>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
