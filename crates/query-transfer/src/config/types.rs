//! Configuration type definitions with auto-tuning based on system resources.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::executor::RetryPolicy;
use crate::planner::Dialect;
use crate::pool::FailurePolicy;
use crate::serialize::OutputFormat;
use crate::transfer::TargetDescriptor;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source cluster connection.
    pub source: SourceConfig,

    /// Chunking, execution and retry behavior.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Default destination for transferred files.
    #[serde(default)]
    pub target: TargetDescriptor,

    /// Ordered fallback chain of transfer methods.
    #[serde(default)]
    pub methods: Vec<MethodConfig>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.transfer = self.transfer.with_auto_tuning(&resources);
        self
    }

    /// Immutable settings handed to the transfer engine.
    pub fn settings(&self) -> TransferSettings {
        self.transfer.settings()
    }
}

/// Source connection (PostgreSQL wire protocol).
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source type (always "postgres" for now).
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password. `${NAME}` is replaced with the environment variable NAME at load time.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable or require (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// How chunk queries select their row range.
    #[serde(default)]
    pub dialect: Dialect,

    /// Rows per streamed batch (default: 10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_batch_size: Option<usize>,

    /// Connect timeout in seconds (default: 30).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("dialect", &self.dialect)
            .field("fetch_batch_size", &self.fetch_batch_size)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl SourceConfig {
    pub fn get_fetch_batch_size(&self) -> usize {
        self.fetch_batch_size.unwrap_or(10_000)
    }

    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(30))
    }
}

/// Retry budget for transient chunk failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per chunk including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 500ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (default: 30s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Transfer behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferConfig {
    /// Rows per chunk. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    /// Parallel chunk workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Chunk file format (default: csv).
    #[serde(default)]
    pub output_format: OutputFormat,

    /// Local directory for chunk files (default: system temp dir + "query-transfer").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    /// Behavior after a chunk fails (default: fail_fast).
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Failed chunks tolerated in best_effort mode before the job fails (default: 0).
    #[serde(default)]
    pub max_failed_chunks: usize,

    /// Files transferred concurrently. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_transfers: Option<usize>,

    /// Retry budget for transient errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl TransferConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, between 2 and 16
        let workers = *self
            .max_workers
            .get_or_insert_with(|| cores.saturating_sub(2).clamp(2, 16));

        // Transfers: a quarter of the cores, between 2 and 8
        let transfers = *self
            .max_parallel_transfers
            .get_or_insert_with(|| (cores / 4).clamp(2, 8));

        // Chunk size: 100K rows per 8GB of RAM, between 100K and 1M
        let chunk_size = *self
            .chunk_size
            .get_or_insert_with(|| ((ram_gb / 8.0) as u64 * 100_000).clamp(100_000, 1_000_000));

        info!(
            "Auto-tuned config: max_workers={}, max_parallel_transfers={}, chunk_size={}",
            workers, transfers, chunk_size
        );

        self
    }

    // Accessors returning the effective value when auto-tuning has not run.

    pub fn get_chunk_size(&self) -> u64 {
        self.chunk_size.unwrap_or(1_000_000)
    }

    pub fn get_max_workers(&self) -> usize {
        self.max_workers.unwrap_or(4)
    }

    pub fn get_max_parallel_transfers(&self) -> usize {
        self.max_parallel_transfers.unwrap_or(2)
    }

    pub fn get_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("query-transfer"))
    }

    /// Immutable settings handed to the transfer engine.
    pub fn settings(&self) -> TransferSettings {
        TransferSettings {
            temp_dir: self.get_temp_dir(),
            chunk_size: self.get_chunk_size(),
            max_workers: self.get_max_workers(),
            output_format: self.output_format,
            failure_policy: self.failure_policy,
            max_failed_chunks: self.max_failed_chunks,
            max_parallel_transfers: self.get_max_parallel_transfers(),
            retry: self.retry.policy(),
        }
    }
}

/// Transfer method kinds available in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// `hadoop distcp` to another cluster.
    Distcp,
    /// `hdfs dfs -put`.
    HdfsPut,
    /// `hdfs dfs -cp`.
    HdfsCopy,
    /// `scp` to a remote host.
    Scp,
    /// Copy into a local or mounted directory.
    LocalCopy,
    /// Arbitrary program with an argument template.
    Command,
}

/// One entry of the transfer method chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodConfig {
    pub kind: MethodKind,

    /// Name in the attempt log (default: the kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Program to run. Required for `command`, overrides the preset otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,

    /// Argument template. Overrides the preset when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Kill the program after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl MethodConfig {
    /// A method entry with preset behavior.
    pub fn of(kind: MethodKind) -> Self {
        Self {
            kind,
            name: None,
            program: None,
            args: Vec::new(),
            timeout_secs: None,
        }
    }
}

/// Immutable engine settings, threaded through every component of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub temp_dir: PathBuf,
    pub chunk_size: u64,
    pub max_workers: usize,
    pub output_format: OutputFormat,
    pub failure_policy: FailurePolicy,
    pub max_failed_chunks: usize,
    pub max_parallel_transfers: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        TransferConfig::default().settings()
    }
}

// Default value functions for serde
fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}
