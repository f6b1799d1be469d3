use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::{env, path::PathBuf, time::Duration};

use crate::models::kind::FileKind;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub storage_config: Option<PathBuf>,
    pub metrics_timeout: Duration,
    pub sweep_interval: Duration,
    pub stale_upload_after: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "File storage and sharing service")]
pub struct Args {
    /// Host to bind to (overrides FILES_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILES_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root of the default local backend (overrides FILES_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILES_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// JSON file describing backends and file kinds (overrides FILES_SERVICE_STORAGE_CONFIG)
    #[arg(long)]
    pub storage_config: Option<PathBuf>,

    /// Per-backend timeout for usage metrics, in milliseconds
    #[arg(long)]
    pub metrics_timeout_ms: Option<u64>,

    /// Seconds between reconciliation sweeps; 0 disables the sweep
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds after which an unfinished upload claim is released
    #[arg(long)]
    pub stale_upload_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("FILES_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("FILES_SERVICE_PORT", 3000u16)?;
        let env_storage =
            env::var("FILES_SERVICE_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = env::var("FILES_SERVICE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/files_service.db".into());
        let env_storage_config = env::var("FILES_SERVICE_STORAGE_CONFIG").ok().map(PathBuf::from);
        let env_metrics_timeout = env_number("FILES_SERVICE_METRICS_TIMEOUT_MS", 3000u64)?;
        let env_sweep_interval = env_number("FILES_SERVICE_SWEEP_INTERVAL_SECS", 300u64)?;
        let env_stale_upload = env_number("FILES_SERVICE_STALE_UPLOAD_SECS", 3600u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            storage_config: args.storage_config.or(env_storage_config),
            metrics_timeout: Duration::from_millis(
                args.metrics_timeout_ms.unwrap_or(env_metrics_timeout),
            ),
            sweep_interval: Duration::from_secs(
                args.sweep_interval_secs.unwrap_or(env_sweep_interval),
            ),
            stale_upload_after: Duration::from_secs(
                args.stale_upload_secs.unwrap_or(env_stale_upload),
            ),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load the storage topology, falling back to a single local backend.
    pub fn load_storage_config(&self) -> Result<StorageConfig> {
        match &self.storage_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading storage config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing storage config {}", path.display()))
            }
            None => Ok(StorageConfig::single_local(&self.storage_dir)),
        }
    }
}

fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    Memory,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    /// Root directory, required for `local`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

/// Backends and the kinds routed to them.
#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub backends: Vec<BackendConfig>,
    pub kinds: Vec<FileKind>,
}

impl StorageConfig {
    pub const DEFAULT_BACKEND: &'static str = "local";
    pub const DEFAULT_KIND: &'static str = "default";

    pub fn single_local(storage_dir: &str) -> Self {
        Self {
            backends: vec![BackendConfig {
                name: Self::DEFAULT_BACKEND.into(),
                backend_type: BackendType::Local,
                path: Some(PathBuf::from(storage_dir)),
                capacity_bytes: None,
            }],
            kinds: vec![FileKind::new(Self::DEFAULT_KIND, Self::DEFAULT_BACKEND)],
        }
    }
}
