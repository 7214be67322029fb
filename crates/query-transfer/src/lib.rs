//! # query-transfer
//!
//! Chunked, parallel export of large query results with fallback file transfer.
//!
//! A job counts the rows of a base query, splits them into contiguous row
//! ranges, runs the ranges in parallel and writes each one to a local file,
//! then moves every file to the destination through an ordered chain of
//! transfer methods:
//!
//! - **Chunk planning** with pluggable row-range rewriting (`LIMIT/OFFSET`,
//!   `OFFSET/FETCH`, `ROW_NUMBER()`)
//! - **Bounded parallel execution** with fail-fast or best-effort policies
//!   and exponential backoff for transient errors
//! - **Atomic chunk files** in CSV, gzip CSV, JSON lines or Parquet
//! - **Fallback transfer chain** (distcp, hdfs put/copy, scp, local copy, or
//!   any external command)
//! - **Guaranteed cleanup** of local files on every exit path
//!
//! ## Example
//!
//! ```rust,no_run
//! use query_transfer::{methods, Config, JobRequest, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!     let request = JobRequest::new(
//!         "SELECT * FROM events",
//!         config.target.clone(),
//!         methods::from_config(&config.methods)?,
//!         orchestrator.settings(),
//!     );
//!     let result = orchestrator.submit(request).await;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod serialize;
pub mod source;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, MethodConfig, MethodKind, SourceConfig, TransferConfig, TransferSettings};
pub use core::{RowSerializer, RowStream, SourceConnection, SqlValue, TransferMethod};
pub use error::{Result, TransferError};
pub use executor::{ChunkExecutor, ChunkResult, ChunkStatus, RetryPolicy};
pub use orchestrator::{JobRequest, JobResult, JobStatus, Orchestrator, Phase, ProgressObserver};
pub use planner::{ChunkSpec, Dialect, PlanSummary, RangeRewriter};
pub use pool::{ExecutionPool, FailurePolicy};
pub use serialize::{FileSerializer, OutputFormat};
pub use transfer::{
    methods, TargetDescriptor, TransferAttempt, TransferChain, TransferCoordinator,
    TransferOutcome,
};
