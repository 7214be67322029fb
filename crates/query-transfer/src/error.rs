//! Error types for the transfer library.

use thiserror::Error;

/// Main error type for chunked transfer operations.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Configuration error (invalid chunk size, empty method chain, bad YAML values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source connection error. `transient` marks it as eligible for retry.
    #[error("Connection error: {message}")]
    Connection { message: String, transient: bool },

    /// Query failed on the source (syntax error, permission denied, ...). Never retried.
    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    /// Rows could not be encoded into the requested output format.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A single transfer method failed for a file.
    #[error("Transfer via {method} failed: {message}")]
    Transfer { method: String, message: String },

    /// Unexpected failure inside a job phase.
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Job was cancelled (SIGINT, etc.)
    #[error("Transfer job cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// PostgreSQL driver error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl TransferError {
    /// Create a transient connection error (retried with backoff).
    pub fn transient(message: impl Into<String>) -> Self {
        TransferError::Connection {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a connection error that must not be retried.
    pub fn connection(message: impl Into<String>) -> Self {
        TransferError::Connection {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a Transfer error for a named method.
    pub fn transfer(method: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Transfer {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Whether the operation that produced this error may succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Connection { transient, .. } => *transient,
            TransferError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::BrokenPipe
            ),
            #[cfg(feature = "postgres")]
            TransferError::Postgres(e) => crate::source::postgres::is_transient_pg_error(e),
            _ => false,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferError::Config(_) | TransferError::Yaml(_) => 2,
            TransferError::Connection { .. } | TransferError::QueryExecution(_) => 3,
            #[cfg(feature = "postgres")]
            TransferError::Postgres(_) => 3,
            TransferError::Transfer { .. } => 4,
            TransferError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
