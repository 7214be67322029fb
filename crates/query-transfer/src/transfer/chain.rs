//! Ordered fallback across transfer methods.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::core::TransferMethod;
use crate::error::{Result, TransferError};

use super::{AttemptStatus, TargetDescriptor, TransferAttempt, TransferOutcome};

/// Methods tried strictly in priority order until one succeeds.
#[derive(Clone)]
pub struct TransferChain {
    methods: Arc<[Arc<dyn TransferMethod>]>,
}

impl std::fmt::Debug for TransferChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.methods.iter().map(|m| m.name()))
            .finish()
    }
}

impl TransferChain {
    /// Build a chain. An empty method list is a configuration error.
    pub fn new(methods: Vec<Arc<dyn TransferMethod>>) -> Result<Self> {
        if methods.is_empty() {
            return Err(TransferError::Config(
                "transfer method chain must contain at least one method".into(),
            ));
        }
        Ok(Self {
            methods: methods.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name().to_string()).collect()
    }

    /// Try each method for `file_path`, stopping at the first success.
    ///
    /// Errors and panics from a method are recorded as a Failed attempt and
    /// never prevent the next method from running.
    pub async fn attempt(&self, file_path: &Path, target: &TargetDescriptor) -> TransferOutcome {
        let mut attempts = Vec::with_capacity(self.methods.len());
        let destination = target.destination_for(file_path);

        for method in self.methods.iter() {
            let start = Instant::now();
            debug!(
                "Transferring {} via {}",
                file_path.display(),
                method.name()
            );

            let result = AssertUnwindSafe(method.try_transfer(file_path, target))
                .catch_unwind()
                .await;
            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!(
                    "method panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            let status = if error.is_none() {
                AttemptStatus::Success
            } else {
                AttemptStatus::Failed
            };
            if let Some(e) = &error {
                warn!(
                    "{}: {} failed, trying next method: {}",
                    file_path.display(),
                    method.name(),
                    e
                );
            }

            attempts.push(TransferAttempt {
                method_name: method.name().to_string(),
                target: destination.clone(),
                status,
                error,
                duration_ms,
            });

            if status == AttemptStatus::Success {
                info!(
                    "{}: delivered to {} via {}",
                    file_path.display(),
                    destination,
                    method.name()
                );
                return TransferOutcome {
                    file_path: file_path.to_path_buf(),
                    attempts,
                    final_status: AttemptStatus::Success,
                };
            }
        }

        warn!(
            "{}: all {} transfer methods failed",
            file_path.display(),
            attempts.len()
        );
        TransferOutcome {
            file_path: file_path.to_path_buf(),
            attempts,
            final_status: AttemptStatus::Failed,
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
