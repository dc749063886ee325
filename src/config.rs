use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for nckh-flow
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NckhFlowConfig {
    /// Proposal/council/evaluation storage
    pub store: StoreConfig,
    /// Council composition rules
    pub council: CouncilConfig,
    /// Idempotency record retention
    pub idempotency: IdempotencyConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Database settings (optional, used with the `database` feature)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Snapshot file used by the CLI between invocations
    pub snapshot_path: PathBuf,
    /// Upper bound for a single store call
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CouncilConfig {
    /// Apply the odd, at-least-three voting rule to every council type,
    /// not only FACULTY_* councils
    pub strict_voting_for_all_types: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotencyConfig {
    /// Records older than this are eligible for purging
    pub retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (overridden by RUST_LOG)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from(".nckh-flow/store.json"),
            timeout_ms: 5_000,
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24 * 7,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for NckhFlowConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            council: CouncilConfig::default(),
            idempotency: IdempotencyConfig::default(),
            observability: ObservabilityConfig::default(),
            database: None,
        }
    }
}

impl NckhFlowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (nckh-flow.toml, .nckh-flow-rc)
    /// 3. Environment variables (prefixed with NCKH_FLOW_, e.g. NCKH_FLOW_STORE__TIMEOUT_MS)
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Same as [`load`](Self::load), with an explicit file layered after the defaults files.
    pub fn load_with(extra_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("nckh-flow.toml").exists() {
            builder = builder.add_source(File::with_name("nckh-flow"));
        }

        if Path::new(".nckh-flow-rc").exists() {
            builder = builder.add_source(
                File::with_name(".nckh-flow-rc").format(config::FileFormat::Toml),
            );
        }

        if let Some(path) = extra_file {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("NCKH_FLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: NckhFlowConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
