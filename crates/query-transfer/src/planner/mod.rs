//! Chunk planning: partitions a result set into contiguous row ranges.
//!
//! Planning is a pure function of its inputs. The SQL for each range comes
//! from a [`RangeRewriter`], so the planner itself never looks at the dialect.

mod dialect;

pub use dialect::{Dialect, LimitOffset, OffsetFetch, RangeRewriter, RowNumberRange};

use serde::Serialize;

use crate::error::{Result, TransferError};

/// Chunk sizes below this produce an advisory warning.
const MIN_ADVISED_CHUNK_SIZE: u64 = 100;

/// One row range of the base query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSpec {
    /// Chunk id, ascending with offset, starting at 0.
    pub id: usize,

    /// First row of the range (0-based).
    pub start_offset: u64,

    /// Number of rows in the range.
    pub row_limit: u64,

    /// Query selecting exactly this range.
    pub query_text: String,
}

impl ChunkSpec {
    /// Exclusive end of the row range.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.row_limit
    }
}

/// Partition `[0, total_rows)` into chunks of `chunk_size` rows.
///
/// Every chunk except possibly the last holds exactly `chunk_size` rows.
/// A `chunk_size` of 0 is rejected before any chunk is created.
pub fn plan(
    base_query: &str,
    total_rows: u64,
    chunk_size: u64,
    rewriter: &dyn RangeRewriter,
) -> Result<Vec<ChunkSpec>> {
    if chunk_size == 0 {
        return Err(TransferError::Config(
            "chunk_size must be greater than 0".into(),
        ));
    }
    if base_query.trim().is_empty() {
        return Err(TransferError::Config("base query must not be empty".into()));
    }

    let num_chunks = total_rows.div_ceil(chunk_size);
    let mut specs = Vec::with_capacity(num_chunks as usize);

    let mut offset = 0u64;
    while offset < total_rows {
        let row_limit = chunk_size.min(total_rows - offset);
        specs.push(ChunkSpec {
            id: specs.len(),
            start_offset: offset,
            row_limit,
            query_text: rewriter.rewrite(base_query, offset, row_limit),
        });
        offset += row_limit;
    }

    Ok(specs)
}

/// Summary of a plan, reported by dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub total_rows: u64,
    pub chunk_size: u64,
    pub num_chunks: usize,
    /// Row count of each chunk, in id order.
    pub estimated_chunk_sizes: Vec<u64>,
    /// Advisories from [`advise_chunk_size`].
    pub warnings: Vec<String>,
}

impl PlanSummary {
    /// Summarize an existing plan.
    pub fn from_specs(total_rows: u64, chunk_size: u64, specs: &[ChunkSpec]) -> Self {
        Self {
            total_rows,
            chunk_size,
            num_chunks: specs.len(),
            estimated_chunk_sizes: specs.iter().map(|s| s.row_limit).collect(),
            warnings: advise_chunk_size(total_rows, chunk_size),
        }
    }
}

/// Advisory warnings about a chunk size. Never an error.
pub fn advise_chunk_size(total_rows: u64, chunk_size: u64) -> Vec<String> {
    let mut warnings = Vec::new();

    if chunk_size > 0 && chunk_size < MIN_ADVISED_CHUNK_SIZE {
        warnings.push(format!(
            "chunk size {} is very small; per-chunk overhead will dominate",
            chunk_size
        ));
    }
    if total_rows > 0 && chunk_size > total_rows / 2 {
        warnings.push(format!(
            "chunk size {} is more than half of {} total rows; little parallelism is possible",
            chunk_size, total_rows
        ));
    }

    warnings
}
