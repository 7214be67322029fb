//! Concrete transfer methods.
//!
//! [`CommandMethod`] wraps an external tool (hadoop distcp, hdfs dfs, scp or
//! any user supplied program) behind an argument template; [`LocalCopyMethod`]
//! copies into a local or mounted directory.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::{MethodConfig, MethodKind};
use crate::core::TransferMethod;
use crate::error::{Result, TransferError};

use super::TargetDescriptor;

/// Longest stderr excerpt kept in an error message.
const MAX_STDERR_CHARS: usize = 2000;

/// A program invocation with placeholder arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Substitute placeholders for one file.
    ///
    /// Supported: `{file}`, `{file_name}`, `{location}`, `{dest}`, `{host}`,
    /// `{cluster}`, `{table}`. Referencing `{host}`, `{cluster}` or `{table}`
    /// when the target does not define it is an error.
    pub fn render(&self, method: &str, file: &Path, target: &TargetDescriptor) -> Result<Vec<String>> {
        let file_str = file.to_string_lossy();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = target.destination_for(file);

        self.args
            .iter()
            .map(|arg| {
                let mut out = arg
                    .replace("{file_name}", &file_name)
                    .replace("{file}", &file_str)
                    .replace("{location}", &target.location)
                    .replace("{dest}", &dest);
                for (key, value) in [
                    ("{host}", &target.host),
                    ("{cluster}", &target.cluster),
                    ("{table}", &target.table),
                ] {
                    if out.contains(key) {
                        let value = value.as_deref().ok_or_else(|| {
                            TransferError::transfer(
                                method,
                                format!("target has no {} configured", key.trim_matches(&['{', '}'][..])),
                            )
                        })?;
                        out = out.replace(key, value);
                    }
                }
                Ok(out)
            })
            .collect()
    }
}

/// Runs an external program per file; a nonzero exit fails the attempt.
#[derive(Debug, Clone)]
pub struct CommandMethod {
    name: String,
    command: CommandTemplate,
    /// Run before the transfer, e.g. to create the destination directory.
    prepare: Option<CommandTemplate>,
    timeout: Option<Duration>,
}

impl CommandMethod {
    pub fn new(name: impl Into<String>, command: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            command,
            prepare: None,
            timeout: None,
        }
    }

    pub fn with_prepare(mut self, prepare: CommandTemplate) -> Self {
        self.prepare = Some(prepare);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// `hadoop distcp -overwrite file://{file} {cluster}{dest}`
    pub fn distcp() -> Self {
        Self::new(
            "distcp",
            CommandTemplate::new("hadoop", &["distcp", "-overwrite", "file://{file}", "{cluster}{dest}"]),
        )
    }

    /// `hdfs dfs -put -f {file} {dest}` after `hdfs dfs -mkdir -p {location}`
    pub fn hdfs_put() -> Self {
        Self::new(
            "hdfs_put",
            CommandTemplate::new("hdfs", &["dfs", "-put", "-f", "{file}", "{dest}"]),
        )
        .with_prepare(CommandTemplate::new("hdfs", &["dfs", "-mkdir", "-p", "{location}"]))
    }

    /// `hdfs dfs -cp -f file://{file} {dest}` after `hdfs dfs -mkdir -p {location}`
    pub fn hdfs_copy() -> Self {
        Self::new(
            "hdfs_copy",
            CommandTemplate::new("hdfs", &["dfs", "-cp", "-f", "file://{file}", "{dest}"]),
        )
        .with_prepare(CommandTemplate::new("hdfs", &["dfs", "-mkdir", "-p", "{location}"]))
    }

    /// `scp {file} {host}:{location}/` after `ssh {host} mkdir -p {location}`
    pub fn scp() -> Self {
        Self::new(
            "scp",
            CommandTemplate::new("scp", &["-q", "-o", "BatchMode=yes", "{file}", "{host}:{location}/"]),
        )
        .with_prepare(CommandTemplate::new(
            "ssh",
            &["-o", "BatchMode=yes", "{host}", "mkdir", "-p", "{location}"],
        ))
    }

    async fn run(&self, template: &CommandTemplate, file: &Path, target: &TargetDescriptor) -> Result<()> {
        let args = template.render(&self.name, file, target)?;
        debug!("{}: {} {}", self.name, template.program, args.join(" "));

        let child = Command::new(&template.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransferError::transfer(&self.name, format!("cannot start {}: {}", template.program, e))
            })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    TransferError::transfer(&self.name, format!("timed out after {:?}", limit))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| TransferError::transfer(&self.name, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
        let status = output
            .status
            .code()
            .map(|c| format!("exit status {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        Err(TransferError::transfer(
            &self.name,
            if stderr.is_empty() {
                status
            } else {
                format!("{}: {}", status, stderr)
            },
        ))
    }
}

#[async_trait]
impl TransferMethod for CommandMethod {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_transfer(&self, local_path: &Path, target: &TargetDescriptor) -> Result<()> {
        if let Some(prepare) = &self.prepare {
            self.run(prepare, local_path, target).await?;
        }
        self.run(&self.command, local_path, target).await
    }
}

/// Copies files into a directory on a local or mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalCopyMethod {
    name: String,
}

impl Default for LocalCopyMethod {
    fn default() -> Self {
        Self {
            name: "local_copy".to_string(),
        }
    }
}

impl LocalCopyMethod {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl TransferMethod for LocalCopyMethod {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_transfer(&self, local_path: &Path, target: &TargetDescriptor) -> Result<()> {
        if target.location.is_empty() {
            return Err(TransferError::transfer(&self.name, "target location is empty"));
        }
        let dest = std::path::PathBuf::from(target.destination_for(local_path));
        let dir = Path::new(&target.location);

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TransferError::transfer(&self.name, format!("create {}: {}", dir.display(), e)))?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = dest.with_file_name(format!(".{}.tmp", file_name));

        if let Err(e) = tokio::fs::copy(local_path, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TransferError::transfer(&self.name, format!("copy: {}", e)));
        }
        tokio::fs::rename(&staging, &dest)
            .await
            .map_err(|e| TransferError::transfer(&self.name, format!("rename: {}", e)))?;

        Ok(())
    }
}

/// Build the fallback chain from configuration, preserving order.
pub fn from_config(configs: &[MethodConfig]) -> Result<Vec<Arc<dyn TransferMethod>>> {
    configs.iter().map(build_method).collect()
}

fn build_method(config: &MethodConfig) -> Result<Arc<dyn TransferMethod>> {
    let timeout = config.timeout_secs.map(Duration::from_secs);

    let mut method = match config.kind {
        MethodKind::LocalCopy => {
            let name = config.name.clone().unwrap_or_else(|| "local_copy".to_string());
            return Ok(Arc::new(LocalCopyMethod::new(name)));
        }
        MethodKind::Distcp => CommandMethod::distcp(),
        MethodKind::HdfsPut => CommandMethod::hdfs_put(),
        MethodKind::HdfsCopy => CommandMethod::hdfs_copy(),
        MethodKind::Scp => CommandMethod::scp(),
        MethodKind::Command => {
            let program = config.program.clone().ok_or_else(|| {
                TransferError::Config("command transfer method requires 'program'".into())
            })?;
            CommandMethod::new(
                "command",
                CommandTemplate {
                    program,
                    args: config.args.clone(),
                },
            )
        }
    };

    if config.kind != MethodKind::Command {
        if let Some(program) = &config.program {
            method.command.program = program.clone();
        }
        if !config.args.is_empty() {
            method.command.args = config.args.clone();
        }
    }
    if let Some(name) = &config.name {
        method.name = name.clone();
    }

    Ok(Arc::new(method.with_timeout(timeout)))
}
