//! TGLC credit decision engine.
//!
//! Decides whether a bank extends liquidity to a business against a registered credit
//! credential, an optional signed proof of business metrics and the bank's policy. Exposure
//! per business/bank pair is reserved under a per-key lock and only committed once settlement
//! succeeds; every step lands in a hash-chained audit trail.

#![deny(unsafe_code)]

pub mod advisor;
pub mod audit;
pub mod dispatch;
pub mod error;
pub mod exposure;
pub mod flow;
pub mod pipeline;
pub mod policy;
pub mod proof;
pub mod registry;
pub mod settlement;
pub mod storage;
pub mod types;
pub mod validation;

pub use advisor::{Advisory, DecisionAdvisor};
pub use audit::{AuditEntry, AuditEntryKind, AuditTrail, TransitionEvent};
pub use dispatch::{DispatchStatus, RequestDispatcher};
pub use error::CreditError;
pub use exposure::{
    EvaluatedReservation, ExposureLedger, ExposureLimits, ExposureStore, MemoryExposureStore,
    ReservationChange, ReservationHandle, ReservationRecord, ReservationStatus,
};
pub use flow::{RequestStage, RequestStateMachine};
pub use pipeline::{
    CancelDisposition, LiquidityPipeline, PipelineBuilder, PipelineConfig, RecoveryReport,
};
pub use policy::{EvaluatorConfig, PolicyEvaluator, PricingTable, PricingTier};
pub use proof::{confidence_for, sign_proof, Ed25519TrustAnchor, ProofVerifier, TrustAnchor};
pub use registry::{CredentialRecord, CredentialRegistry, Deactivation, Lookup, PolicyRegistry};
pub use settlement::{
    EscrowInstruction, SettlementConnector, SettlementError, SettlementFailure,
    SettlementInstruction, SettlementKind, SettlementMode, SettlementOutcome, TxHandle,
};
pub use storage::{AuditSink, EngineStorage, PersistentAuditTrail, StorageConfig};
pub use types::{
    Corridor, CreditCredential, CreditDecision, CreditPolicy, ExposureKey, ExposureState,
    LiquidityRequest, ProofPayload, ProofSource, ProofVerificationResult, ReasonCode,
    RequestOutcome,
};
