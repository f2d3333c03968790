use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tglc_core::dispatch::DEFAULT_WORKERS;
use tglc_core::{PipelineConfig, ProofSource, SettlementMode, StorageConfig};
use tglc_service::{serve_lines, ConnectorKind, ServiceConfig, ServiceState};
use tokio::io::BufReader;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConnectorArg {
    Simulated,
    Slow,
    Flaky,
    Refusing,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SettlementKindArg {
    TrustLine,
    Escrow,
}

#[derive(Debug, Parser)]
#[command(
    name = "tglcd",
    version,
    about = "TGLC credit decision engine (JSON lines on stdin/stdout)"
)]
struct Cli {
    /// JSON catalog of credentials and bank policies applied at startup.
    #[arg(long, env = "TGLC_CATALOG")]
    catalog: Option<PathBuf>,
    /// File used to persist terminal request outcomes.
    #[arg(long, default_value = "tglc/data/outcomes.json", env = "TGLC_OUTCOME_INDEX")]
    outcome_index: PathBuf,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "TGLC_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for credentials, policies, exposure and the decision audit.
    #[arg(long, env = "TGLC_DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, default_value_t = 5, env = "TGLC_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Requests evaluated concurrently in async mode.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "TGLC_WORKERS")]
    workers: usize,
    #[arg(long, default_value_t = 5_000, env = "TGLC_PROOF_TIMEOUT_MS")]
    proof_timeout_ms: u64,
    #[arg(long, default_value_t = 30_000, env = "TGLC_SETTLEMENT_TIMEOUT_MS")]
    settlement_timeout_ms: u64,
    #[arg(long, default_value_t = 2, env = "TGLC_SETTLEMENT_RETRIES")]
    settlement_retries: u32,
    #[arg(long, default_value_t = 250, env = "TGLC_SETTLEMENT_BACKOFF_MS")]
    settlement_backoff_ms: u64,
    #[arg(long, value_enum, default_value_t = SettlementKindArg::TrustLine, env = "TGLC_SETTLEMENT_MODE")]
    settlement_mode: SettlementKindArg,
    /// Settlement rail. Every rail is an in-process simulation.
    #[arg(long, value_enum, default_value_t = ConnectorArg::Simulated, env = "TGLC_CONNECTOR")]
    connector: ConnectorArg,
    /// Outcome delay of the `slow` connector.
    #[arg(long, default_value_t = 2_000, env = "TGLC_CONNECTOR_DELAY_MS")]
    connector_delay_ms: u64,
    /// Retryable failures reported by the `flaky` connector before it succeeds.
    #[arg(long, default_value_t = 1, env = "TGLC_CONNECTOR_FAILURES")]
    connector_failures: u32,
    /// Whether the `refusing` connector's refusals are retryable.
    #[arg(long, default_value_t = false, env = "TGLC_CONNECTOR_RETRYABLE")]
    connector_retryable: bool,
    #[arg(long, default_value_t = 300, env = "TGLC_ESCROW_FINISH_AFTER_SECS")]
    escrow_finish_after_secs: u64,
    #[arg(long, default_value_t = 86_400, env = "TGLC_ESCROW_CANCEL_AFTER_SECS")]
    escrow_cancel_after_secs: u64,
    /// Hex Ed25519 verifying key for oracle proofs.
    #[arg(long, env = "TGLC_ORACLE_KEY")]
    oracle_key: Option<String>,
    /// Hex Ed25519 verifying key for audited proofs.
    #[arg(long, env = "TGLC_AUDITED_KEY")]
    audited_key: Option<String>,
    /// Record a non-binding advisory next to every decision.
    #[arg(long, default_value_t = false, env = "TGLC_ADVISOR")]
    advisor: bool,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn pipeline_config(cli: &Cli) -> PipelineConfig {
    let settlement_mode = match cli.settlement_mode {
        SettlementKindArg::TrustLine => SettlementMode::TrustLine,
        SettlementKindArg::Escrow => SettlementMode::Escrow {
            finish_after_secs: cli.escrow_finish_after_secs,
            cancel_after_secs: cli.escrow_cancel_after_secs,
        },
    };
    PipelineConfig {
        proof_timeout: Duration::from_millis(cli.proof_timeout_ms),
        settlement_timeout: Duration::from_millis(cli.settlement_timeout_ms),
        settlement_retry_budget: cli.settlement_retries,
        settlement_backoff: Duration::from_millis(cli.settlement_backoff_ms),
        settlement_mode,
        ..PipelineConfig::default()
    }
}

fn connector_kind(cli: &Cli) -> ConnectorKind {
    match cli.connector {
        ConnectorArg::Simulated => ConnectorKind::Simulated,
        ConnectorArg::Slow => ConnectorKind::Slow {
            delay: Duration::from_millis(cli.connector_delay_ms),
        },
        ConnectorArg::Flaky => ConnectorKind::Flaky {
            failures: cli.connector_failures,
        },
        ConnectorArg::Refusing => ConnectorKind::Refusing {
            retryable: cli.connector_retryable,
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tglc_service=info,tglc_core=info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let mut trust_anchor_keys = Vec::new();
    if let Some(key) = &cli.oracle_key {
        trust_anchor_keys.push((ProofSource::Oracle, key.clone()));
    }
    if let Some(key) = &cli.audited_key {
        trust_anchor_keys.push((ProofSource::Audited, key.clone()));
    }

    let config = ServiceConfig {
        storage,
        catalog_path: cli.catalog.clone(),
        outcome_index_path: cli.outcome_index.clone(),
        pipeline: pipeline_config(&cli),
        connector: connector_kind(&cli),
        workers: cli.workers,
        trust_anchor_keys,
        advisor: cli.advisor,
    };
    let state = ServiceState::bootstrap(config).await?;
    info!(backend = state.storage.backend_label(), "tglcd reading commands from stdin");

    serve_lines(
        &state,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;
    info!("stdin closed; shutting down");
    Ok(())
}
