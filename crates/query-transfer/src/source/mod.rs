//! Source connections.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PgConnection;

use std::sync::Arc;

use crate::config::SourceConfig;
use crate::core::SourceConnection;
use crate::error::{Result, TransferError};

/// Build the source connection described by `config`.
pub fn connect_source(config: &SourceConfig) -> Result<Arc<dyn SourceConnection>> {
    match config.r#type.as_str() {
        #[cfg(feature = "postgres")]
        "postgres" => Ok(Arc::new(PgConnection::new(config)?)),
        other => Err(TransferError::Config(format!(
            "unsupported source type '{}'",
            other
        ))),
    }
}
