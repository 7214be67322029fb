//! Configuration validation.

use super::{Config, MethodKind};
use crate::error::{Result, TransferError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(TransferError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(TransferError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(TransferError::Config("source.user is required".into()));
    }
    if config.source.r#type != "postgres" {
        return Err(TransferError::Config(format!(
            "source.type must be 'postgres', got '{}'",
            config.source.r#type
        )));
    }
    if !matches!(
        config.source.ssl_mode.as_str(),
        "disable" | "require" | "verify-ca" | "verify-full"
    ) {
        return Err(TransferError::Config(format!(
            "source.ssl_mode must be one of disable, require, verify-ca, verify-full; got '{}'",
            config.source.ssl_mode
        )));
    }
    if let Some(0) = config.source.fetch_batch_size {
        return Err(TransferError::Config(
            "source.fetch_batch_size must be at least 1".into(),
        ));
    }

    // Transfer config validation - only check if explicitly set
    let transfer = &config.transfer;
    if let Some(0) = transfer.chunk_size {
        return Err(TransferError::Config(
            "transfer.chunk_size must be at least 1".into(),
        ));
    }
    if let Some(0) = transfer.max_workers {
        return Err(TransferError::Config(
            "transfer.max_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = transfer.max_parallel_transfers {
        return Err(TransferError::Config(
            "transfer.max_parallel_transfers must be at least 1".into(),
        ));
    }
    if transfer.retry.max_attempts == 0 {
        return Err(TransferError::Config(
            "transfer.retry.max_attempts must be at least 1".into(),
        ));
    }
    if transfer.retry.base_delay_ms > transfer.retry.max_delay_ms {
        return Err(TransferError::Config(
            "transfer.retry.base_delay_ms must not exceed max_delay_ms".into(),
        ));
    }

    // Methods validation
    for (i, method) in config.methods.iter().enumerate() {
        if method.kind == MethodKind::Command && method.program.is_none() {
            return Err(TransferError::Config(format!(
                "methods[{}]: command method requires 'program'",
                i
            )));
        }
        if let Some(0) = method.timeout_secs {
            return Err(TransferError::Config(format!(
                "methods[{}]: timeout_secs must be at least 1",
                i
            )));
        }
    }

    Ok(())
}
