//! Relocation of chunk files to the destination.
//!
//! - [`TransferChain`]: ordered fallback over transfer methods for one file
//! - [`TransferCoordinator`]: runs the chain for every file with bounded parallelism
//! - [`methods`]: concrete methods (external commands, local copy)

mod chain;
mod coordinator;
pub mod methods;

pub use chain::TransferChain;
pub(crate) use chain::panic_message;
pub use coordinator::{all_succeeded, TransferCoordinator};
pub use methods::{CommandMethod, LocalCopyMethod};

#[cfg(test)]
pub(crate) use chain::tests::{Behavior, ScriptedMethod};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where transferred files should end up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Destination directory (HDFS path, remote directory or local mount).
    pub location: String,

    /// Remote host for secure copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Destination cluster URI prefix for distributed copy, e.g. `hdfs://nn2:8020`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Logical table name, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl TargetDescriptor {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Destination path for `file`: its file name under `location`.
    pub fn destination_for(&self, file: &Path) -> String {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = self.location.trim_end_matches('/');
        if base.is_empty() && self.location.starts_with('/') {
            format!("/{}", name)
        } else if base.is_empty() {
            name
        } else {
            format!("{}/{}", base, name)
        }
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.host, &self.cluster) {
            (Some(host), _) => write!(f, "{}:{}", host, self.location),
            (None, Some(cluster)) => write!(f, "{}{}", cluster, self.location),
            (None, None) => f.write_str(&self.location),
        }
    }
}

/// Status of a single method attempt or of a whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failed,
}

/// One method invocation for one file.
#[derive(Debug, Clone, Serialize)]
pub struct TransferAttempt {
    pub method_name: String,
    pub target: String,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Every attempt made for one file, in order.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub file_path: PathBuf,
    pub attempts: Vec<TransferAttempt>,
    /// Success iff some attempt succeeded.
    pub final_status: AttemptStatus,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.final_status == AttemptStatus::Success
    }

    /// Name of the method that delivered the file.
    pub fn delivered_by(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.status == AttemptStatus::Success)
            .map(|a| a.method_name.as_str())
    }

    /// Last recorded error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.iter().rev().find_map(|a| a.error.as_deref())
    }
}
