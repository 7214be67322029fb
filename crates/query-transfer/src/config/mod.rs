//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, TransferError};
use std::path::Path;

/// Substrings marking a configuration key as sensitive.
const SENSITIVE_KEYS: &[&str] = &["password", "secret", "key", "token", "credential", "pwd"];

/// Replacement shown for sensitive values.
pub const MASK: &str = "***MASKED***";

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.source.password = expand_env(&config.source.password)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Configuration as a JSON tree with every sensitive value masked, for display.
    pub fn masked(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        mask_value(&mut value);
        value
    }
}

/// Replace a whole-value `${NAME}` reference with the environment variable NAME.
fn expand_env(value: &str) -> Result<String> {
    match value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(name) => std::env::var(name).map_err(|_| {
            TransferError::Config(format!("environment variable {} is not set", name))
        }),
        None => Ok(value.to_string()),
    }
}

fn mask_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let lower = key.to_lowercase();
                if v.is_string() && SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                    *v = serde_json::Value::String(MASK.to_string());
                } else {
                    mask_value(v);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(mask_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: impala-gw.internal
  database: analytics
  user: etl
  password: hunter2
  ssl_mode: disable
transfer:
  chunk_size: 500000
  output_format: jsonl
  failure_policy: best_effort
  max_failed_chunks: 2
  retry:
    max_attempts: 5
target:
  location: /warehouse/landing
  cluster: hdfs://nn2:8020
methods:
  - kind: distcp
  - kind: hdfs_put
    timeout_secs: 600
  - kind: command
    name: rsync
    program: rsync
    args: ["{file}", "backup:{location}/"]
"#;

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.transfer.chunk_size, Some(500_000));
        assert_eq!(config.transfer.max_workers, None);
        assert_eq!(config.methods.len(), 3);
        assert_eq!(config.methods[1].kind, MethodKind::HdfsPut);
        assert_eq!(config.target.cluster.as_deref(), Some("hdfs://nn2:8020"));

        let settings = config.settings();
        assert_eq!(settings.chunk_size, 500_000);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.max_failed_chunks, 2);
    }

    #[test]
    fn test_masked_hides_password() {
        let config = Config::from_yaml(YAML).unwrap();
        let masked = config.masked();
        assert_eq!(masked["source"]["password"], MASK);
        assert_eq!(masked["source"]["user"], "etl");
        assert!(!masked.to_string().contains("hunter2"));
    }

    #[test]
    fn test_env_password_expansion() {
        std::env::set_var("QT_TEST_SOURCE_PASSWORD", "from-env");
        let yaml = YAML.replace("hunter2", "${QT_TEST_SOURCE_PASSWORD}");
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.source.password, "from-env");

        let yaml = YAML.replace("hunter2", "${QT_TEST_UNSET_VARIABLE_XYZ}");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_auto_tuning_respects_explicit_values() {
        let resources = SystemResources {
            total_memory_bytes: 64 * 1024 * 1024 * 1024,
            total_memory_gb: 64.0,
            cpu_cores: 32,
        };
        let tuned = TransferConfig {
            chunk_size: Some(1234),
            ..TransferConfig::default()
        }
        .with_auto_tuning(&resources);

        assert_eq!(tuned.chunk_size, Some(1234));
        assert_eq!(tuned.max_workers, Some(16));
        assert_eq!(tuned.max_parallel_transfers, Some(8));

        let small = SystemResources {
            total_memory_bytes: 2 * 1024 * 1024 * 1024,
            total_memory_gb: 2.0,
            cpu_cores: 1,
        };
        let tuned = TransferConfig::default().with_auto_tuning(&small);
        assert_eq!(tuned.max_workers, Some(2));
        assert_eq!(tuned.chunk_size, Some(100_000));
    }
}
