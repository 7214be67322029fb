//! Core abstractions shared by every stage of a transfer job.
//!
//! - [`value`]: owned SQL values, row batches and the streaming result set
//! - [`traits`]: capability traits for connections, serializers and transfer methods

pub mod traits;
pub mod value;

pub use traits::{RowSerializer, SourceConnection, TransferMethod};
pub use value::{Batch, Row, RowStream, SqlValue};
