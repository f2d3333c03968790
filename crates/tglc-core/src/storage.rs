use crate::audit::{AuditEntry, AuditEntryKind, AuditTrail};
use crate::error::CreditError;
use crate::exposure::{
    ExposureStore, MemoryExposureStore, ReservationChange, ReservationHandle, ReservationRecord,
    ReservationStatus,
};
use crate::registry::{CredentialRecord, Deactivation};
use crate::types::{CreditCredential, CreditPolicy, ExposureKey, ExposureState};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep audit, exposure and catalog state in process memory only.
    #[default]
    Memory,
    /// Persist everything in PostgreSQL and hydrate on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Durable destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn label(&self) -> &'static str;

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<(), CreditError>;
}

/// Audit trail that mirrors each entry to an optional [`AuditSink`].
///
/// Entries are hashed against the in-memory chain, persisted, and only then committed in
/// memory. The mutex is held across the write so concurrent requests cannot interleave
/// indexes.
pub struct PersistentAuditTrail {
    trail: Mutex<AuditTrail>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl PersistentAuditTrail {
    pub fn memory() -> Self {
        Self {
            trail: Mutex::new(AuditTrail::new()),
            sink: None,
        }
    }

    /// Rehydrate from already persisted entries, verifying the chain.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, CreditError> {
        Ok(Self {
            trail: Mutex::new(AuditTrail::from_entries(entries)?),
            sink: None,
        })
    }

    /// Rehydrate from `entries` and mirror every new entry to `sink`.
    pub fn with_sink(
        entries: Vec<AuditEntry>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, CreditError> {
        Ok(Self {
            trail: Mutex::new(AuditTrail::from_entries(entries)?),
            sink: Some(sink),
        })
    }

    pub fn backend_label(&self) -> &'static str {
        self.sink.as_ref().map_or("memory", |sink| sink.label())
    }

    pub async fn append(
        &self,
        request_id: &str,
        kind: AuditEntryKind,
        payload: Value,
    ) -> Result<AuditEntry, CreditError> {
        let mut trail = self.trail.lock().await;
        let entry = trail.build_entry(request_id, kind, payload);
        if let Some(sink) = &self.sink {
            sink.insert_audit_entry(&entry).await?;
        }
        trail.commit_entry(entry.clone())?;
        Ok(entry)
    }

    pub async fn record<T: Serialize + ?Sized>(
        &self,
        request_id: &str,
        kind: AuditEntryKind,
        payload: &T,
    ) -> Result<AuditEntry, CreditError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| CreditError::Serialization(e.to_string()))?;
        self.append(request_id, kind, payload).await
    }

    pub async fn entries_for(&self, request_id: &str) -> Vec<AuditEntry> {
        self.trail.lock().await.entries_for(request_id)
    }

    pub async fn len(&self) -> usize {
        self.trail.lock().await.len()
    }

    pub async fn verify_chain(&self) -> bool {
        self.trail.lock().await.verify_chain()
    }
}

/// Every backend handle the engine needs, built from one [`StorageConfig`].
pub struct EngineStorage {
    audit: Arc<PersistentAuditTrail>,
    exposure: Arc<dyn ExposureStore>,
    catalog: Option<PostgresStore>,
}

impl EngineStorage {
    pub fn memory() -> Self {
        Self {
            audit: Arc::new(PersistentAuditTrail::memory()),
            exposure: Arc::new(MemoryExposureStore::new()),
            catalog: None,
        }
    }

    pub async fn bootstrap(config: StorageConfig) -> Result<Self, CreditError> {
        match config {
            StorageConfig::Memory => Ok(Self::memory()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                let entries = store.load_audit_entries().await?;
                let audit = PersistentAuditTrail::with_sink(entries, Arc::new(store.clone()))?;
                Ok(Self {
                    audit: Arc::new(audit),
                    exposure: Arc::new(store.clone()),
                    catalog: Some(store),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.audit.backend_label()
    }

    pub fn audit(&self) -> Arc<PersistentAuditTrail> {
        self.audit.clone()
    }

    pub fn exposure_store(&self) -> Arc<dyn ExposureStore> {
        self.exposure.clone()
    }

    pub async fn load_credentials(&self) -> Result<Vec<CredentialRecord>, CreditError> {
        match &self.catalog {
            Some(store) => store.load_credentials().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn load_policies(&self) -> Result<Vec<CreditPolicy>, CreditError> {
        match &self.catalog {
            Some(store) => store.load_policies().await,
            None => Ok(Vec::new()),
        }
    }

    /// Persist a newly registered credential, deactivating the row it supersedes.
    pub async fn persist_credential(&self, record: &CredentialRecord) -> Result<(), CreditError> {
        match &self.catalog {
            Some(store) => store.insert_credential(record).await,
            None => Ok(()),
        }
    }

    pub async fn persist_revocation(&self, record: &CredentialRecord) -> Result<(), CreditError> {
        match &self.catalog {
            Some(store) => store.deactivate_credential(record).await,
            None => Ok(()),
        }
    }

    pub async fn persist_policy(&self, policy: &CreditPolicy) -> Result<(), CreditError> {
        match &self.catalog {
            Some(store) => store.upsert_policy(policy).await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct PostgresStore {
    pool: PgPool,
}

fn pg_error(action: &str) -> impl FnOnce(sqlx::Error) -> CreditError + '_ {
    move |e| CreditError::Storage(format!("postgres {action} failed: {e}"))
}

fn to_bigint(field: &str, value: u64) -> Result<i64, CreditError> {
    i64::try_from(value)
        .map_err(|_| CreditError::Storage(format!("{field} {value} exceeds BIGINT range")))
}

fn from_bigint(field: &str, value: i64) -> Result<u64, CreditError> {
    u64::try_from(value)
        .map_err(|_| CreditError::Storage(format!("negative {field} {value} in storage")))
}

impl PostgresStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CreditError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(pg_error("connect"))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), CreditError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tglc_credentials (
                issuer TEXT NOT NULL,
                business_id TEXT NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                active BOOLEAN NOT NULL,
                deactivated_at TIMESTAMPTZ NULL,
                deactivation TEXT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (issuer, business_id, issued_at)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tglc_credentials_active
                ON tglc_credentials (issuer, business_id) WHERE active
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tglc_policies (
                bank_id TEXT PRIMARY KEY,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tglc_exposure (
                business_id TEXT NOT NULL,
                bank_id TEXT NOT NULL,
                current_exposure_minor BIGINT NOT NULL CHECK (current_exposure_minor >= 0),
                version BIGINT NOT NULL,
                PRIMARY KEY (business_id, bank_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tglc_decision_audit (
                ledger_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                request_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tglc_audit_request_id ON tglc_decision_audit (request_id)",
            r#"
            CREATE TABLE IF NOT EXISTS tglc_reservations (
                reservation_id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                bank_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
                reserved_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                closed_at TIMESTAMPTZ NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_tglc_reservations_outstanding
                ON tglc_reservations (reserved_at) WHERE status = 'outstanding'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_tglc_reservations_key
                ON tglc_reservations (business_id, bank_id)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(pg_error("schema create"))?;
        }
        Ok(())
    }

    async fn load_audit_entries(&self) -> Result<Vec<AuditEntry>, CreditError> {
        let rows = sqlx::query(
            r#"
            SELECT ledger_index, entry_id, request_id, kind, entry_timestamp,
                   payload, previous_hash, entry_hash
            FROM tglc_decision_audit
            ORDER BY ledger_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_error("audit load"))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = row.try_get("ledger_index").map_err(pg_error("decode ledger_index"))?;
            let kind: String = row.try_get("kind").map_err(pg_error("decode kind"))?;
            entries.push(AuditEntry {
                entry_id: row.try_get("entry_id").map_err(pg_error("decode entry_id"))?,
                index: from_bigint("ledger_index", index)?,
                request_id: row.try_get("request_id").map_err(pg_error("decode request_id"))?,
                kind: AuditEntryKind::parse(&kind)?,
                timestamp: row
                    .try_get("entry_timestamp")
                    .map_err(pg_error("decode entry_timestamp"))?,
                payload: row.try_get("payload").map_err(pg_error("decode payload"))?,
                previous_hash: row
                    .try_get("previous_hash")
                    .map_err(pg_error("decode previous_hash"))?,
                entry_hash: row.try_get("entry_hash").map_err(pg_error("decode entry_hash"))?,
            });
        }
        Ok(entries)
    }

    async fn load_credentials(&self) -> Result<Vec<CredentialRecord>, CreditError> {
        let rows = sqlx::query(
            r#"
            SELECT issued_at, active, deactivated_at, deactivation, payload
            FROM tglc_credentials
            ORDER BY issued_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_error("credential load"))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Value = row.try_get("payload").map_err(pg_error("decode payload"))?;
            let credential: CreditCredential = serde_json::from_value(payload)
                .map_err(|e| CreditError::Serialization(e.to_string()))?;
            let deactivation: Option<String> = row
                .try_get("deactivation")
                .map_err(pg_error("decode deactivation"))?;
            records.push(CredentialRecord {
                credential,
                active: row.try_get("active").map_err(pg_error("decode active"))?,
                issued_at: row.try_get("issued_at").map_err(pg_error("decode issued_at"))?,
                deactivated_at: row
                    .try_get("deactivated_at")
                    .map_err(pg_error("decode deactivated_at"))?,
                deactivation: deactivation.as_deref().map(parse_deactivation).transpose()?,
            });
        }
        Ok(records)
    }

    async fn insert_credential(&self, record: &CredentialRecord) -> Result<(), CreditError> {
        let payload = serde_json::to_value(&record.credential)
            .map_err(|e| CreditError::Serialization(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(pg_error("begin"))?;

        sqlx::query(
            r#"
            UPDATE tglc_credentials
            SET active = FALSE, deactivated_at = $3, deactivation = $4
            WHERE issuer = $1 AND business_id = $2 AND active
            "#,
        )
        .bind(&record.credential.issuer)
        .bind(&record.credential.business_id)
        .bind(record.issued_at)
        .bind(deactivation_to_str(Deactivation::Superseded))
        .execute(&mut *tx)
        .await
        .map_err(pg_error("credential supersede"))?;

        sqlx::query(
            r#"
            INSERT INTO tglc_credentials (
                issuer, business_id, issued_at, active, deactivated_at, deactivation, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.credential.issuer)
        .bind(&record.credential.business_id)
        .bind(record.issued_at)
        .bind(record.active)
        .bind(record.deactivated_at)
        .bind(record.deactivation.map(deactivation_to_str))
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(pg_error("credential insert"))?;

        tx.commit().await.map_err(pg_error("commit"))?;
        Ok(())
    }

    async fn deactivate_credential(&self, record: &CredentialRecord) -> Result<(), CreditError> {
        let deactivation = record.deactivation.unwrap_or(Deactivation::Revoked);
        sqlx::query(
            r#"
            UPDATE tglc_credentials
            SET active = FALSE, deactivated_at = $3, deactivation = $4
            WHERE issuer = $1 AND business_id = $2 AND active
            "#,
        )
        .bind(&record.credential.issuer)
        .bind(&record.credential.business_id)
        .bind(record.deactivated_at.unwrap_or_else(Utc::now))
        .bind(deactivation_to_str(deactivation))
        .execute(&self.pool)
        .await
        .map_err(pg_error("credential revoke"))?;
        Ok(())
    }

    async fn load_policies(&self) -> Result<Vec<CreditPolicy>, CreditError> {
        let rows = sqlx::query("SELECT payload FROM tglc_policies ORDER BY bank_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(pg_error("policy load"))?;

        rows.into_iter()
            .map(|row| {
                let payload: Value = row.try_get("payload").map_err(pg_error("decode payload"))?;
                serde_json::from_value(payload).map_err(|e| CreditError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn upsert_policy(&self, policy: &CreditPolicy) -> Result<(), CreditError> {
        let payload =
            serde_json::to_value(policy).map_err(|e| CreditError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO tglc_policies (bank_id, payload, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (bank_id) DO UPDATE
            SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&policy.bank_id)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(pg_error("policy upsert"))?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PostgresStore {
    fn label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<(), CreditError> {
        sqlx::query(
            r#"
            INSERT INTO tglc_decision_audit (
                ledger_index, entry_id, request_id, kind, entry_timestamp,
                payload, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(to_bigint("ledger_index", entry.index)?)
        .bind(&entry.entry_id)
        .bind(&entry.request_id)
        .bind(entry.kind.as_str())
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(pg_error("audit insert"))?;
        Ok(())
    }
}

#[async_trait]
impl ExposureStore for PostgresStore {
    fn label(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self, key: &ExposureKey) -> Result<ExposureState, CreditError> {
        let row = sqlx::query(
            r#"
            SELECT current_exposure_minor, version
            FROM tglc_exposure
            WHERE business_id = $1 AND bank_id = $2
            "#,
        )
        .bind(&key.business_id)
        .bind(&key.bank_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_error("exposure load"))?;

        let Some(row) = row else {
            return Ok(ExposureState::initial(key.clone()));
        };
        let exposure: i64 = row
            .try_get("current_exposure_minor")
            .map_err(pg_error("decode current_exposure_minor"))?;
        let version: i64 = row.try_get("version").map_err(pg_error("decode version"))?;
        Ok(ExposureState {
            key: key.clone(),
            current_exposure_minor: from_bigint("current_exposure_minor", exposure)?,
            version: from_bigint("version", version)?,
        })
    }

    async fn compare_and_swap(
        &self,
        expected: &ExposureState,
        exposure_minor: u64,
        change: ReservationChange<'_>,
    ) -> Result<ExposureState, CreditError> {
        let exposure = to_bigint("current_exposure_minor", exposure_minor)?;
        let mut tx = self.pool.begin().await.map_err(pg_error("begin"))?;
        let result = if expected.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO tglc_exposure (business_id, bank_id, current_exposure_minor, version)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (business_id, bank_id) DO NOTHING
                "#,
            )
            .bind(&expected.key.business_id)
            .bind(&expected.key.bank_id)
            .bind(exposure)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE tglc_exposure
                SET current_exposure_minor = $3, version = version + 1
                WHERE business_id = $1 AND bank_id = $2 AND version = $4
                "#,
            )
            .bind(&expected.key.business_id)
            .bind(&expected.key.bank_id)
            .bind(exposure)
            .bind(to_bigint("version", expected.version)?)
            .execute(&mut *tx)
            .await
        };
        let result = result.map_err(pg_error("exposure update"))?;

        // Dropping `tx` uncommitted rolls the exposure write back.
        if result.rows_affected() == 0 {
            return Err(CreditError::ConcurrencyConflict {
                key: expected.key.to_string(),
                expected: expected.version,
            });
        }

        match change {
            ReservationChange::Open(handle) => {
                sqlx::query(
                    r#"
                    INSERT INTO tglc_reservations (
                        reservation_id, business_id, bank_id, request_id, amount_minor,
                        reserved_at, status, closed_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, NULL)
                    "#,
                )
                .bind(&handle.reservation_id)
                .bind(&handle.key.business_id)
                .bind(&handle.key.bank_id)
                .bind(&handle.request_id)
                .bind(to_bigint("amount_minor", handle.amount_minor)?)
                .bind(handle.reserved_at)
                .bind(ReservationStatus::Outstanding.as_str())
                .execute(&mut *tx)
                .await
                .map_err(pg_error("reservation insert"))?;
            }
            ReservationChange::Close {
                reservation_id,
                status,
            } => close_reservation(&mut tx, reservation_id, status).await?,
        }

        tx.commit().await.map_err(pg_error("commit"))?;
        Ok(ExposureState {
            key: expected.key.clone(),
            current_exposure_minor: exposure_minor,
            version: expected.version + 1,
        })
    }

    async fn commit_reservation(&self, reservation_id: &str) -> Result<(), CreditError> {
        let mut tx = self.pool.begin().await.map_err(pg_error("begin"))?;
        close_reservation(&mut tx, reservation_id, ReservationStatus::Committed).await?;
        tx.commit().await.map_err(pg_error("commit"))?;
        Ok(())
    }

    async fn outstanding_reservations(&self) -> Result<Vec<ReservationHandle>, CreditError> {
        let rows = sqlx::query(
            r#"
            SELECT reservation_id, business_id, bank_id, request_id, amount_minor,
                   reserved_at, status, closed_at
            FROM tglc_reservations
            WHERE status = 'outstanding'
            ORDER BY reserved_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_error("reservation load"))?;

        rows.iter()
            .map(|row| decode_reservation(row).map(|record| record.handle))
            .collect()
    }

    async fn reservations(
        &self,
        key: &ExposureKey,
        history: usize,
    ) -> Result<Vec<ReservationRecord>, CreditError> {
        let rows = sqlx::query(
            r#"
            (SELECT reservation_id, business_id, bank_id, request_id, amount_minor,
                    reserved_at, status, closed_at, 0 AS bucket
             FROM tglc_reservations
             WHERE business_id = $1 AND bank_id = $2 AND status = 'outstanding')
            UNION ALL
            (SELECT reservation_id, business_id, bank_id, request_id, amount_minor,
                    reserved_at, status, closed_at, 1 AS bucket
             FROM tglc_reservations
             WHERE business_id = $1 AND bank_id = $2 AND status <> 'outstanding'
             ORDER BY closed_at DESC
             LIMIT $3)
            ORDER BY bucket ASC, closed_at DESC NULLS FIRST, reserved_at ASC
            "#,
        )
        .bind(&key.business_id)
        .bind(&key.bank_id)
        .bind(to_bigint("history", history as u64)?)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_error("reservation history"))?;

        rows.iter().map(decode_reservation).collect()
    }
}

async fn close_reservation(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    reservation_id: &str,
    status: ReservationStatus,
) -> Result<(), CreditError> {
    let closed = sqlx::query(
        r#"
        UPDATE tglc_reservations
        SET status = $2, closed_at = $3
        WHERE reservation_id = $1 AND status = 'outstanding'
        "#,
    )
    .bind(reservation_id)
    .bind(status.as_str())
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(pg_error("reservation close"))?;

    if closed.rows_affected() == 0 {
        return Err(CreditError::InvariantViolation(format!(
            "reservation {reservation_id} is not outstanding in postgres"
        )));
    }
    Ok(())
}

fn decode_reservation(row: &PgRow) -> Result<ReservationRecord, CreditError> {
    let amount: i64 = row
        .try_get("amount_minor")
        .map_err(pg_error("decode amount_minor"))?;
    let status: String = row.try_get("status").map_err(pg_error("decode status"))?;
    Ok(ReservationRecord {
        handle: ReservationHandle {
            reservation_id: row
                .try_get("reservation_id")
                .map_err(pg_error("decode reservation_id"))?,
            key: ExposureKey::new(
                row.try_get::<String, _>("business_id")
                    .map_err(pg_error("decode business_id"))?,
                row.try_get::<String, _>("bank_id")
                    .map_err(pg_error("decode bank_id"))?,
            ),
            request_id: row
                .try_get("request_id")
                .map_err(pg_error("decode request_id"))?,
            amount_minor: from_bigint("amount_minor", amount)?,
            reserved_at: row
                .try_get("reserved_at")
                .map_err(pg_error("decode reserved_at"))?,
        },
        status: ReservationStatus::parse(&status)?,
        closed_at: row.try_get("closed_at").map_err(pg_error("decode closed_at"))?,
    })
}

fn deactivation_to_str(deactivation: Deactivation) -> &'static str {
    match deactivation {
        Deactivation::Superseded => "superseded",
        Deactivation::Revoked => "revoked",
    }
}

fn parse_deactivation(value: &str) -> Result<Deactivation, CreditError> {
    match value {
        "superseded" => Ok(Deactivation::Superseded),
        "revoked" => Ok(Deactivation::Revoked),
        other => Err(CreditError::Storage(format!(
            "unknown credential deactivation '{other}' in postgres"
        ))),
    }
}
