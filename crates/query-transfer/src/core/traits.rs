//! Capability traits the transfer engine depends on.
//!
//! - [`SourceConnection`]: runs queries and streams rows from the source cluster
//! - [`RowSerializer`]: writes a row stream into a local file
//! - [`TransferMethod`]: relocates one local file to the destination
//!
//! The engine only ever sees these traits; concrete drivers and tools are
//! injected by the caller.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::serialize::OutputFormat;
use crate::transfer::TargetDescriptor;

use super::value::RowStream;

/// Query execution against the source cluster.
///
/// Errors must be classified: transient failures (connection reset, timeout)
/// are reported so that [`crate::TransferError::is_transient`] returns true,
/// everything else is treated as permanent.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Count the rows the query would return.
    async fn get_row_count(&self, query: &str) -> Result<u64>;

    /// Start streaming the rows of `query`.
    ///
    /// The returned stream is fed by a background task through a bounded
    /// channel, so the caller never holds more than a few batches at once.
    async fn execute(&self, query: &str) -> Result<RowStream>;

    /// Verify the source is reachable with the configured credentials.
    async fn test_connection(&self) -> Result<()> {
        self.get_row_count("SELECT 1").await.map(|_| ())
    }

    /// Short name for logging.
    fn name(&self) -> &str;
}

/// Row stream to file encoder.
#[async_trait]
pub trait RowSerializer: Send + Sync {
    /// Drain `rows` into `path` using `format`, returning the number of rows written.
    async fn write(&self, rows: RowStream, path: &Path, format: OutputFormat) -> Result<u64>;
}

/// One mechanism for relocating a file to the destination.
#[async_trait]
pub trait TransferMethod: Send + Sync {
    /// Name recorded in the attempt log.
    fn name(&self) -> &str;

    /// Attempt to move `local_path` to `target`. An `Err` marks the attempt Failed.
    async fn try_transfer(&self, local_path: &Path, target: &TargetDescriptor) -> Result<()>;
}
