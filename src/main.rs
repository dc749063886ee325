use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use nckh_flow::{
    dispatch, init_telemetry, shutdown_telemetry, ApiRequest, ApiResponse, FileSystemPersistence,
    MemoryStore, NckhFlowConfig, Repository, SnapshotPersistence, StaticFacultyDirectory,
    WorkflowService,
};

#[derive(Parser)]
#[command(name = "nckh-flow")]
#[command(about = "Research proposal approval workflow")]
#[command(long_about = "Applies workflow operations to a local proposal store. Each invocation \
                       loads the store snapshot, executes one JSON request and writes the \
                       snapshot back. Responses are printed to stdout as JSON.")]
struct Cli {
    /// Store snapshot file, overriding the configured path
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Extra configuration file layered over nckh-flow.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSON object mapping user ids to faculty ids
    #[arg(long, global = true)]
    directory: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one JSON request
    Apply {
        /// Request file, or '-' for stdin
        #[arg(long, short, default_value = "-")]
        request: String,
    },
    /// Print a proposal
    Show { proposal_id: String },
    /// Print a proposal's workflow log
    Log { proposal_id: String },
    /// Print aggregate scores for the current review cycle
    Aggregate { proposal_id: String },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| runtime.block_on(run(cli)))
    {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nckh-flow: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    NckhFlowConfig::load_env_file()?;
    let mut config = NckhFlowConfig::load_with(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.snapshot_path = store;
    }
    if let Err(e) = init_telemetry(&config.observability) {
        eprintln!("nckh-flow: logging disabled: {e}");
    }

    let request = match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Apply { request } => match parse_request(&read_request(&request)?) {
            Ok(request) => request,
            Err(response) => {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(ExitCode::from(2));
            }
        },
        Commands::Show { proposal_id } => ApiRequest::GetProposal { proposal_id },
        Commands::Log { proposal_id } => ApiRequest::GetWorkflowLog { proposal_id },
        Commands::Aggregate { proposal_id } => ApiRequest::GetAggregateScores { proposal_id },
    };

    let directory = match &cli.directory {
        Some(path) => load_directory(path)?,
        None => StaticFacultyDirectory::new(),
    };

    let persistence = FileSystemPersistence::new(&config.store.snapshot_path);
    let snapshot = persistence
        .load()
        .await
        .with_context(|| format!("loading store from {}", persistence.path().display()))?
        .unwrap_or_else(nckh_flow::store::StoreSnapshot::empty);
    let store = Arc::new(MemoryStore::from_snapshot(snapshot));
    let (repo, audit) = attach_database(Repository::in_memory(store.clone()), &config).await?;
    let service = WorkflowService::new(repo, Arc::new(directory), &config);

    let proposal_id = request.proposal_id().map(str::to_string);
    let logged_before = match &proposal_id {
        Some(id) => log_len(&service, id).await,
        None => 0,
    };
    let response = dispatch(&service, request).await;
    if response.is_ok() {
        persistence.save(&store.snapshot().await).await?;
        if let (Some(audit), Some(id)) = (&audit, &proposal_id) {
            mirror_audit(audit, &service, id, logged_before).await;
        }
    }
    info!(ok = response.is_ok(), "Request completed");
    service.log_metrics();

    println!("{}", serde_json::to_string_pretty(&response)?);
    close_audit(audit).await;
    shutdown_telemetry();
    Ok(if response.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_request(source: &str) -> Result<String> {
    if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading request from stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading request file {source}"))
    }
}

fn parse_request(raw: &str) -> Result<ApiRequest, ApiResponse> {
    serde_json::from_str(raw).map_err(|e| {
        warn!(error = %e, "Malformed request");
        ApiResponse::Error {
            code: "BAD_REQUEST".to_string(),
            message: e.to_string(),
            retryable: false,
            field: None,
            missing: Vec::new(),
        }
    })
}

fn load_directory(path: &Path) -> Result<StaticFacultyDirectory> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading faculty directory {}", path.display()))?;
    let members: HashMap<String, String> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing faculty directory {}", path.display()))?;
    Ok(StaticFacultyDirectory::from_map(members))
}

async fn log_len(service: &WorkflowService, proposal_id: &str) -> usize {
    service
        .get_workflow_log(proposal_id)
        .await
        .map(|log| log.len())
        .unwrap_or(0)
}

#[cfg(feature = "database")]
type AuditTrail = nckh_flow::database::DatabaseManager;

#[cfg(not(feature = "database"))]
type AuditTrail = ();

#[cfg(feature = "database")]
async fn attach_database(
    repo: Repository,
    config: &NckhFlowConfig,
) -> Result<(Repository, Option<AuditTrail>)> {
    match &config.database {
        Some(db) => {
            let manager =
                nckh_flow::database::DatabaseManager::new(&db.url, db.max_connections, db.auto_migrate)
                    .await?;
            info!(url = %db.url, "Idempotency records and audit trail kept in SQLite");
            Ok((repo.with_idempotency(Arc::new(manager.clone())), Some(manager)))
        }
        None => Ok((repo, None)),
    }
}

#[cfg(not(feature = "database"))]
async fn attach_database(
    repo: Repository,
    config: &NckhFlowConfig,
) -> Result<(Repository, Option<AuditTrail>)> {
    if config.database.is_some() {
        warn!("Database configured but the `database` feature is not enabled");
    }
    Ok((repo, None))
}

/// Copies log entries appended by this invocation into the audit table.
#[cfg(feature = "database")]
async fn mirror_audit(audit: &AuditTrail, service: &WorkflowService, proposal_id: &str, from: usize) {
    let Ok(log) = service.get_workflow_log(proposal_id).await else {
        return;
    };
    for entry in log.iter().skip(from) {
        if let Err(e) = audit.record_audit(proposal_id, entry).await {
            warn!(proposal_id, error = %e, "Failed to mirror workflow log entry");
        }
    }
}

#[cfg(not(feature = "database"))]
async fn mirror_audit(_: &AuditTrail, _: &WorkflowService, _: &str, _: usize) {}

#[cfg(feature = "database")]
async fn close_audit(audit: Option<AuditTrail>) {
    if let Some(manager) = audit {
        manager.shutdown().await;
    }
}

#[cfg(not(feature = "database"))]
async fn close_audit(_: Option<AuditTrail>) {}
