//! [`LocalConnector`]: the in-process fallback every workflow can target
//! when a task has no remote `target` — commands run directly as child
//! processes of the engine, and copies are plain filesystem operations.
//!
//! Grounded in `wdl-engine`'s `LocalTaskExecutionBackend`
//! (`backend/local.rs`): no ssh-like wrapping, no tar transport, just
//! `Command::new(shell)` and `tokio::fs`.

use std::path::Path;
use std::process::Stdio;

use anyhow::anyhow;
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use streamflow_core::connector::CapturedOutput;
use streamflow_core::connector::Connector;
use streamflow_core::connector::ConnectorCopyKind;
use streamflow_core::connector::Location;
use streamflow_core::connector::RunOptions;
use streamflow_core::error::StreamFlowError;
use streamflow_core::utils::create_command;
use streamflow_core::utils::CommandOptions;
use streamflow_core::utils::DEFAULT_SHELL;
use tokio::process::Command;
use tracing::debug;

/// Deserializable configuration for a [`LocalConnector`], mirroring
/// [`crate::base::BaseConnector`]'s siblings in
/// `streamflow-connector-kubernetes::config` — the local backend has no
/// connection details to carry, only the shell used to interpret commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConnectorConfig {
    /// The shell used to interpret assembled commands, e.g. `"sh"`.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl Default for LocalConnectorConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

/// Runs commands as direct child processes on the host and treats every
/// [`Location`] as the same local filesystem.
pub struct LocalConnector {
    /// The shell used to interpret assembled commands, e.g. `"sh"`.
    shell: String,
}

impl LocalConnector {
    /// Constructs a connector using the default shell.
    pub fn new() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
        }
    }

    /// Constructs a connector from a deserialized [`LocalConnectorConfig`].
    pub fn from_config(config: LocalConnectorConfig) -> Self {
        Self {
            shell: config.shell,
        }
    }

    /// Overrides the shell used to interpret assembled commands.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn run(
        &self,
        location: &Location,
        command: &[String],
        options: RunOptions,
    ) -> anyhow::Result<Option<CapturedOutput>> {
        let assembled = create_command(&CommandOptions {
            command: command.to_vec(),
            environment: options.env.into_iter().collect(),
            workdir: options.workdir,
            stdin: options.stdin,
            stdout: options.stdout,
            stderr: options.stderr,
        });
        debug!(
            location = %location,
            job = options.job_name.as_deref().unwrap_or(""),
            "executing local command {assembled}"
        );

        let (stdout_io, stderr_io) = if options.capture_output {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::null(), Stdio::null())
        };
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&assembled)
            .stdin(Stdio::null())
            .stdout(stdout_io)
            .stderr(stderr_io)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.shell))?;

        if options.capture_output {
            let output = match options.timeout {
                Some(duration) => tokio::time::timeout(duration, child.wait_with_output())
                    .await
                    .map_err(|_| StreamFlowError::Timeout(duration))??,
                None => child.wait_with_output().await?,
            };
            let exit_code = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(CapturedOutput { stdout, exit_code }))
        } else {
            match options.timeout {
                Some(duration) => {
                    tokio::time::timeout(duration, child.wait())
                        .await
                        .map_err(|_| StreamFlowError::Timeout(duration))??;
                }
                None => {
                    child.wait().await?;
                }
            }
            Ok(None)
        }
    }

    async fn copy(
        &self,
        src: &str,
        dst: &str,
        locations: &[Location],
        kind: ConnectorCopyKind,
        _source_connector: Option<&(dyn Connector + 'static)>,
        _source_location: Option<&Location>,
    ) -> anyhow::Result<()> {
        if locations.is_empty() {
            return Err(anyhow!("copy requires at least one destination location"));
        }
        if matches!(kind, ConnectorCopyKind::RemoteToLocal) && locations.len() > 1 {
            return Err(StreamFlowError::WorkflowExecution(
                "copy from multiple locations is not supported".to_string(),
            )
            .into());
        }

        // Every location a `LocalConnector` reports is the same host
        // filesystem, so every copy kind reduces to the same filesystem
        // operation regardless of topology.
        copy_recursive(Path::new(src), Path::new(dst))
            .await
            .with_context(|| format!("failed to copy {src} to {dst}"))
    }
}

fn copy_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        // Symlinks are dereferenced, matching the `dereference=True` tar
        // archiving used for the remote copy paths in `crate::transfer`.
        let metadata = tokio::fs::metadata(src).await?;
        if metadata.is_dir() {
            tokio::fs::create_dir_all(dst).await?;
            let mut entries = tokio::fs::read_dir(src).await?;
            while let Some(entry) = entries.next_entry().await? {
                let child_dst = dst.join(entry.file_name());
                copy_recursive(&entry.path(), &child_dst).await?;
            }
            Ok(())
        } else {
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(src, dst).await.map(|_| ())
        }
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let connector = LocalConnector::new();
        let location = Location::new(streamflow_core::connector::LOCAL_LOCATION);
        let output = connector
            .run(
                &location,
                &["echo".to_string(), "hello".to_string()],
                RunOptions {
                    capture_output: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.exit_code, 0);
    }

    #[test]
    fn from_config_carries_the_configured_shell() {
        let config = LocalConnectorConfig {
            shell: "bash".to_string(),
        };
        let connector = LocalConnector::from_config(config);
        assert_eq!(connector.shell, "bash");
    }

    #[test]
    fn config_defaults_to_the_default_shell() {
        assert_eq!(LocalConnectorConfig::default().shell, DEFAULT_SHELL);
    }

    #[tokio::test]
    async fn copy_recreates_directory_tree() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(src_dir.path().join("f1"), b"one").await.unwrap();
        tokio::fs::write(src_dir.path().join("f2"), b"two").await.unwrap();

        let connector = LocalConnector::new();
        let location = Location::new(streamflow_core::connector::LOCAL_LOCATION);
        let dst_path = dst_dir.path().join("copied");
        connector
            .copy(
                src_dir.path().to_str().unwrap(),
                dst_path.to_str().unwrap(),
                &[location],
                ConnectorCopyKind::LocalToRemote,
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(dst_path.join("f1")).await.unwrap(),
            b"one"
        );
        assert_eq!(
            tokio::fs::read(dst_path.join("f2")).await.unwrap(),
            b"two"
        );
    }
}
