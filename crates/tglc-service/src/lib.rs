//! `tglcd` service library: bootstrap, catalog loading and the JSON-lines ingress.

#![deny(unsafe_code)]

pub mod catalog;
pub mod outcome;

use catalog::{Catalog, CatalogError};
use outcome::{OutcomeIndexError, PersistedOutcomeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tglc_adapters::{
    AlwaysFailConnector, FlakyConnector, SimulatedLedgerConnector, SlowConnector, StaticAdvisor,
};
use tglc_core::dispatch::DEFAULT_WORKERS;
use tglc_core::{
    AuditEntry, CancelDisposition, CredentialRecord, CredentialRegistry, CreditCredential,
    CreditError, CreditPolicy, DispatchStatus, Ed25519TrustAnchor, EngineStorage, ExposureKey,
    ExposureLedger, ExposureState, LiquidityPipeline, LiquidityRequest, PipelineConfig,
    PolicyRegistry, ProofPayload, ProofSource, ProofVerifier, RequestDispatcher, RequestOutcome,
    SettlementConnector, StorageConfig,
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Replies buffered between in-flight commands and the writer.
const REPLY_BUFFER: usize = 64;

/// Settlement rail the service submits to. Every rail is simulated in-process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectorKind {
    #[default]
    Simulated,
    /// Outcomes arrive only after `delay`.
    Slow { delay: Duration },
    /// The first `failures` outcomes are retryable ledger failures.
    Flaky { failures: u32 },
    /// Every submission is refused.
    Refusing { retryable: bool },
}

impl ConnectorKind {
    fn connector(self) -> Arc<dyn SettlementConnector> {
        match self {
            Self::Simulated => Arc::new(SimulatedLedgerConnector::new()),
            Self::Slow { delay } => Arc::new(SlowConnector::new(delay)),
            Self::Flaky { failures } => Arc::new(FlakyConnector::new(failures)),
            Self::Refusing { retryable: true } => Arc::new(AlwaysFailConnector::retryable(
                "refusing",
                "submissions refused by configuration",
            )),
            Self::Refusing { retryable: false } => Arc::new(AlwaysFailConnector::fatal(
                "refusing",
                "submissions refused by configuration",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub catalog_path: Option<PathBuf>,
    pub outcome_index_path: PathBuf,
    pub pipeline: PipelineConfig,
    pub connector: ConnectorKind,
    pub workers: usize,
    /// Hex-encoded Ed25519 verifying keys per proof source.
    pub trust_anchor_keys: Vec<(ProofSource, String)>,
    pub advisor: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            catalog_path: None,
            outcome_index_path: PathBuf::from("tglc/data/outcomes.json"),
            pipeline: PipelineConfig::default(),
            connector: ConnectorKind::default(),
            workers: DEFAULT_WORKERS,
            trust_anchor_keys: Vec::new(),
            advisor: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] CreditError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("outcome index error: {0}")]
    Outcomes(#[from] OutcomeIndexError),
    #[error("ingress IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct ServiceState {
    pub pipeline: LiquidityPipeline,
    pub dispatcher: RequestDispatcher,
    pub storage: Arc<EngineStorage>,
    pub outcomes: Arc<Mutex<PersistedOutcomeIndex>>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let storage = Arc::new(EngineStorage::bootstrap(config.storage).await?);

        let credentials = Arc::new(CredentialRegistry::new());
        let restored = storage.load_credentials().await?;
        let restored_count = restored.len();
        for record in restored {
            credentials.restore(record);
        }
        let policies = Arc::new(PolicyRegistry::new());
        for policy in storage.load_policies().await? {
            policies.set(policy)?;
        }
        info!(
            backend = storage.backend_label(),
            credentials = restored_count,
            "registries restored"
        );

        if let Some(path) = &config.catalog_path {
            let catalog = Catalog::load(path)?;
            apply_catalog(&storage, &credentials, &policies, catalog).await?;
        }

        let mut anchor = Ed25519TrustAnchor::new();
        for (source, key_hex) in &config.trust_anchor_keys {
            anchor = anchor.with_hex_key(*source, key_hex)?;
        }
        for source in [ProofSource::Oracle, ProofSource::Audited] {
            if !anchor.has_key(source) {
                warn!(
                    source = source.as_str(),
                    "no trust anchor key configured; proofs from this source will be rejected"
                );
            }
        }

        let connector = config.connector.connector();
        info!(rail = connector.rail(), "settlement connector selected");
        let ledger = ExposureLedger::open(storage.exposure_store()).await?;
        let mut builder = LiquidityPipeline::builder(connector, ProofVerifier::new(Arc::new(anchor)))
            .credentials(credentials)
            .policies(policies)
            .ledger(Arc::new(ledger))
            .audit(storage.audit())
            .config(config.pipeline);
        if config.advisor {
            builder = builder.advisor(Arc::new(StaticAdvisor::default()));
        }
        let pipeline = builder.build()?;

        let mut outcomes = PersistedOutcomeIndex::load(config.outcome_index_path)?;
        let recovery = pipeline.recover_reservations().await?;
        for outcome in &recovery.settled {
            outcomes.record(outcome)?;
        }

        let dispatcher = RequestDispatcher::new(pipeline.clone(), config.workers);
        info!(
            outcomes = outcomes.len(),
            workers = config.workers,
            recovered_settled = recovery.settled.len(),
            recovered_released = recovery.released.len(),
            "tglc service ready"
        );

        Ok(Self {
            pipeline,
            dispatcher,
            storage,
            outcomes: Arc::new(Mutex::new(outcomes)),
        })
    }

    async fn stored_outcome(&self, request_id: &str) -> Option<RequestOutcome> {
        self.outcomes.lock().await.get(request_id).cloned()
    }

    async fn record_outcome(&self, outcome: &RequestOutcome) -> Result<(), ServiceError> {
        self.outcomes.lock().await.record(outcome)?;
        Ok(())
    }
}

/// Register catalog entries that differ from what storage already holds.
async fn apply_catalog(
    storage: &EngineStorage,
    credentials: &CredentialRegistry,
    policies: &PolicyRegistry,
    catalog: Catalog,
) -> Result<(), ServiceError> {
    for policy in catalog.policies {
        if policies.get(&policy.bank_id).as_ref() == Some(&policy) {
            continue;
        }
        policies.set(policy.clone())?;
        storage.persist_policy(&policy).await?;
        info!(bank_id = %policy.bank_id, "catalog policy applied");
    }

    for credential in catalog.credentials {
        let unchanged = credentials
            .active_record(&credential.business_id, &credential.issuer)
            .is_some_and(|record| record.credential == credential);
        if unchanged {
            continue;
        }
        let record = credentials.register(credential)?;
        storage.persist_credential(&record).await?;
        info!(
            key = %record.credential.exposure_key(),
            "catalog credential applied"
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait for the terminal outcome.
    #[default]
    Sync,
    /// Return a correlation id straight away.
    Async,
}

/// Liquidity request as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub business_did: String,
    pub business_id: String,
    pub bank_id: String,
    pub principal_address: String,
    pub corridor: String,
    pub requested_amount_minor: u64,
    #[serde(default)]
    pub proof: Option<Value>,
    #[serde(default)]
    pub requested_duration_days: Option<u32>,
}

impl SubmitRequest {
    pub fn into_request(self) -> Result<LiquidityRequest, CreditError> {
        let mut request = LiquidityRequest::new(
            self.business_did,
            self.business_id,
            self.bank_id,
            self.principal_address,
            self.corridor.parse()?,
            self.requested_amount_minor,
        );
        if let Some(key) = self.idempotency_key {
            request = request.with_request_id(key);
        }
        if let Some(proof) = self.proof {
            request = request.with_proof(ProofPayload::from_value(proof)?);
        }
        request.requested_duration_days = self.requested_duration_days;
        Ok(request)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IngressCommand {
    Submit {
        #[serde(default)]
        mode: SubmitMode,
        request: SubmitRequest,
    },
    Status {
        correlation_id: String,
    },
    Cancel {
        request_id: String,
    },
    RegisterCredential {
        credential: CreditCredential,
    },
    RevokeCredential {
        business_id: String,
        bank_id: String,
    },
    SetPolicy {
        policy: CreditPolicy,
    },
    Exposure {
        business_id: String,
        bank_id: String,
    },
    Audit {
        request_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngressResponse {
    Outcome {
        outcome: RequestOutcome,
    },
    Accepted {
        correlation_id: String,
    },
    Status {
        correlation_id: String,
        #[serde(flatten)]
        status: DispatchStatus,
    },
    Cancel {
        request_id: String,
        #[serde(flatten)]
        disposition: CancelDisposition,
    },
    Credential {
        record: CredentialRecord,
    },
    Revoked {
        record: Option<CredentialRecord>,
    },
    Policy {
        policy: CreditPolicy,
        replaced: bool,
    },
    Exposure {
        state: ExposureState,
    },
    Audit {
        entries: Vec<AuditEntry>,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

impl IngressResponse {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<CreditError> for IngressResponse {
    fn from(err: CreditError) -> Self {
        let code = match &err {
            CreditError::Validation(_) => "validation",
            CreditError::NotFound(_) => "not_found",
            CreditError::Storage(_) => "storage",
            _ => "internal",
        };
        Self::error(code, err.to_string())
    }
}

impl From<ServiceError> for IngressResponse {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Core(core) => core.into(),
            other => Self::error("internal", other.to_string()),
        }
    }
}

pub async fn handle_command(state: &ServiceState, command: IngressCommand) -> IngressResponse {
    let result = match command {
        IngressCommand::Submit { mode, request } => submit(state, mode, request).await,
        IngressCommand::Status { correlation_id } => status(state, correlation_id).await,
        IngressCommand::Cancel { request_id } => {
            let disposition = state.pipeline.cancel(&request_id);
            Ok(IngressResponse::Cancel {
                request_id,
                disposition,
            })
        }
        IngressCommand::RegisterCredential { credential } => {
            register_credential(state, credential).await
        }
        IngressCommand::RevokeCredential {
            business_id,
            bank_id,
        } => revoke_credential(state, &business_id, &bank_id).await,
        IngressCommand::SetPolicy { policy } => set_policy(state, policy).await,
        IngressCommand::Exposure {
            business_id,
            bank_id,
        } => state
            .pipeline
            .ledger()
            .snapshot(&ExposureKey::new(business_id, bank_id))
            .await
            .map(|state| IngressResponse::Exposure { state })
            .map_err(ServiceError::from),
        IngressCommand::Audit { request_id } => Ok(IngressResponse::Audit {
            entries: state.pipeline.audit().entries_for(&request_id).await,
        }),
    };
    result.unwrap_or_else(IngressResponse::from)
}

async fn submit(
    state: &ServiceState,
    mode: SubmitMode,
    request: SubmitRequest,
) -> Result<IngressResponse, ServiceError> {
    let request = request.into_request()?;
    if let Some(outcome) = state.stored_outcome(&request.request_id).await {
        debug!(request_id = %request.request_id, "answered from outcome index");
        return Ok(match mode {
            SubmitMode::Sync => IngressResponse::Outcome { outcome },
            SubmitMode::Async => IngressResponse::Accepted {
                correlation_id: outcome.request_id,
            },
        });
    }

    match mode {
        SubmitMode::Sync => {
            let outcome = state.pipeline.submit(request).await?;
            state.record_outcome(&outcome).await?;
            Ok(IngressResponse::Outcome { outcome })
        }
        SubmitMode::Async => {
            let correlation_id = state.dispatcher.submit(request);
            let watcher = state.clone();
            let watched_id = correlation_id.clone();
            tokio::spawn(async move {
                match watcher.dispatcher.wait(&watched_id).await {
                    Ok(DispatchStatus::Completed { outcome }) => {
                        if let Err(err) = watcher.record_outcome(&outcome).await {
                            warn!(correlation_id = %watched_id, error = %err, "outcome not indexed");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(correlation_id = %watched_id, error = %err, "lost track of request")
                    }
                }
            });
            Ok(IngressResponse::Accepted { correlation_id })
        }
    }
}

async fn status(
    state: &ServiceState,
    correlation_id: String,
) -> Result<IngressResponse, ServiceError> {
    let status = match state.dispatcher.status(&correlation_id) {
        Some(status) => status,
        None => match state.stored_outcome(&correlation_id).await {
            Some(outcome) => DispatchStatus::Completed { outcome },
            None => {
                return Err(CreditError::NotFound(format!("correlation id {correlation_id}")).into())
            }
        },
    };
    Ok(IngressResponse::Status {
        correlation_id,
        status,
    })
}

async fn register_credential(
    state: &ServiceState,
    credential: CreditCredential,
) -> Result<IngressResponse, ServiceError> {
    let record = state.pipeline.credentials().register(credential)?;
    state.storage.persist_credential(&record).await?;
    Ok(IngressResponse::Credential { record })
}

async fn revoke_credential(
    state: &ServiceState,
    business_id: &str,
    bank_id: &str,
) -> Result<IngressResponse, ServiceError> {
    let record = state.pipeline.credentials().revoke(business_id, bank_id);
    if let Some(record) = &record {
        state.storage.persist_revocation(record).await?;
    }
    Ok(IngressResponse::Revoked { record })
}

async fn set_policy(
    state: &ServiceState,
    policy: CreditPolicy,
) -> Result<IngressResponse, ServiceError> {
    let previous = state.pipeline.policies().set(policy.clone())?;
    state.storage.persist_policy(&policy).await?;
    Ok(IngressResponse::Policy {
        policy,
        replaced: previous.is_some(),
    })
}

/// Reply envelope: the response plus the caller's `id`, when the command carried one.
#[derive(Serialize)]
struct IngressReply<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Value>,
    #[serde(flatten)]
    response: &'a IngressResponse,
}

/// Handle one JSON line and render the reply as one JSON line.
///
/// Any `id` field on the command is echoed on the reply so callers can correlate replies
/// that arrive out of order.
pub async fn handle_line(state: &ServiceState, line: &str) -> String {
    let (id, response) = match serde_json::from_str::<Value>(line) {
        Ok(value) => {
            let id = value.get("id").filter(|id| !id.is_null()).cloned();
            let response = match serde_json::from_value::<IngressCommand>(value) {
                Ok(command) => handle_command(state, command).await,
                Err(err) => {
                    IngressResponse::error("malformed", format!("unreadable command: {err}"))
                }
            };
            (id, response)
        }
        Err(err) => (
            None,
            IngressResponse::error("malformed", format!("unreadable command: {err}")),
        ),
    };
    let reply = IngressReply {
        id: id.as_ref(),
        response: &response,
    };
    serde_json::to_string(&reply).unwrap_or_else(|err| {
        serde_json::json!({
            "id": id,
            "kind": "error",
            "code": "internal",
            "message": format!("reply could not be encoded: {err}"),
        })
        .to_string()
    })
}

/// Serve newline-delimited JSON commands until the reader is exhausted.
///
/// Every command runs on its own task, so a slow submission never holds up a later cancel or
/// status query. Replies are written in completion order; once the reader is done, the
/// commands still in flight are drained before returning.
pub async fn serve_lines<R, W>(state: &ServiceState, reader: R, mut writer: W) -> Result<(), ServiceError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let (sender, mut replies) = mpsc::channel::<String>(REPLY_BUFFER);
    let mut sender = Some(sender);
    loop {
        tokio::select! {
            line = lines.next_line(), if sender.is_some() => {
                let Some(line) = line? else {
                    debug!("ingress reader exhausted; draining in-flight commands");
                    sender = None;
                    continue;
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let Some(reply_to) = sender.clone() else {
                    continue;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let reply = handle_line(&state, &line).await;
                    if reply_to.send(reply).await.is_err() {
                        warn!("ingress writer gone; reply dropped");
                    }
                });
            }
            reply = replies.recv() => {
                let Some(reply) = reply else {
                    break;
                };
                writer.write_all(reply.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
    }
    Ok(())
}
