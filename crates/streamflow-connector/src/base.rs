//! [`BaseConnector`]: the shared [`Connector`] implementation — command
//! execution and the tar-over-pipe data transfer engine — parameterised by
//! how a concrete backend turns a shell command into something it can
//! actually spawn.
//!
//! Grounded in `streamflow/deployment/connector/base.py`'s `BaseConnector`.
//! The Python original expresses this as an abstract base class with one
//! abstract method (`_get_run_command`); composing a
//! [`RunCommandBuilder`] strategy in place of subclassing keeps every
//! concrete connector (Kubernetes pod-exec, SSH, ...) a plain struct rather
//! than a member of an inheritance hierarchy.

use std::process::Stdio as ProcessStdio;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context as _;
use async_trait::async_trait;
use futures::future::try_join_all;
use streamflow_core::connector::CapturedOutput;
use streamflow_core::connector::Connector;
use streamflow_core::connector::ConnectorCopyKind;
use streamflow_core::connector::Location;
use streamflow_core::connector::RunOptions;
use streamflow_core::error::StreamFlowError;
use streamflow_core::utils::create_command;
use streamflow_core::utils::encode_command;
use streamflow_core::utils::CommandOptions;
use tokio::process::Command as ProcessCommand;
use tracing::debug;
use tracing::info;

use crate::transfer;

/// The default chunk size used to stream tar archives, matching the
/// `transferBufferSize` default most `BaseConnector` subclasses pass
/// through from their deployment configuration.
pub const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Turns a shell command destined for one [`Location`] into the argv this
/// process should actually spawn.
///
/// `interactive` is set for invocations (the tar writer side of a copy)
/// that need a live stdin pipe rather than a fire-and-forget exec.
pub trait RunCommandBuilder: Send + Sync {
    /// Builds the argv, as a single shell-parseable string, that runs
    /// `command` at `location`.
    fn build(&self, command: &str, location: &Location, interactive: bool) -> String;
}

/// A [`Connector`] built from a [`RunCommandBuilder`] strategy: command
/// execution, directory-tree copy, and fan-out are all implemented here,
/// once, for every backend that can express "run this shell command at this
/// location" — the Kubernetes pod-exec connector included.
pub struct BaseConnector {
    /// How to turn a shell command into a spawnable argv for a location.
    run_command_builder: Box<dyn RunCommandBuilder>,
    /// The shell `encode_command` wraps commands for, e.g. `"sh"`.
    shell: String,
    /// The chunk size used when streaming tar archives.
    transfer_buffer_size: usize,
}

impl BaseConnector {
    /// Constructs a connector using the default shell (`sh`) and transfer
    /// buffer size.
    pub fn new(run_command_builder: Box<dyn RunCommandBuilder>) -> Self {
        Self {
            run_command_builder,
            shell: streamflow_core::utils::DEFAULT_SHELL.to_string(),
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
        }
    }

    /// Overrides the shell used to decode wrapped commands.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Overrides the tar streaming chunk size.
    pub fn with_transfer_buffer_size(mut self, size: usize) -> Self {
        self.transfer_buffer_size = size;
        self
    }

    pub(crate) fn get_run_command(
        &self,
        command: &str,
        location: &Location,
        interactive: bool,
    ) -> String {
        self.run_command_builder.build(command, location, interactive)
    }

    pub(crate) fn shell(&self) -> &str {
        &self.shell
    }

    pub(crate) fn transfer_buffer_size(&self) -> usize {
        self.transfer_buffer_size
    }

    /// Spawns `run_command` (already location-wrapped and shlex-ready) with
    /// the given stdio configuration.
    pub(crate) fn spawn(
        &self,
        run_command: &str,
        stdin: ProcessStdio,
        stdout: ProcessStdio,
        stderr: ProcessStdio,
    ) -> anyhow::Result<tokio::process::Child> {
        let parts =
            shlex::split(run_command).ok_or_else(|| anyhow!("failed to tokenize run command"))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| anyhow!("run command tokenized to nothing"))?;
        ProcessCommand::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{program}`"))
    }
}

#[async_trait]
impl Connector for BaseConnector {
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
            "executing command {assembled}"
        );
        let encoded = encode_command(&assembled, self.shell());
        let run_command = self.get_run_command(&encoded, location, false);

        let (stdout_io, stderr_io) = if options.capture_output {
            (ProcessStdio::piped(), ProcessStdio::piped())
        } else {
            (ProcessStdio::null(), ProcessStdio::null())
        };
        let mut child = self.spawn(&run_command, ProcessStdio::null(), stdout_io, stderr_io)?;

        if options.capture_output {
            let output = run_with_timeout(child.wait_with_output(), options.timeout).await?;
            let exit_code = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(CapturedOutput { stdout, exit_code }))
        } else {
            run_with_timeout(child.wait(), options.timeout).await?;
            Ok(None)
        }
    }

    async fn copy(
        &self,
        src: &str,
        dst: &str,
        locations: &[Location],
        kind: ConnectorCopyKind,
        source_connector: Option<&(dyn Connector + 'static)>,
        source_location: Option<&Location>,
    ) -> anyhow::Result<()> {
        match kind {
            ConnectorCopyKind::LocalToRemote => {
                if locations.len() > 1 {
                    info!(src, dst, locations = locations.len(), "copying local to remote locations");
                } else {
                    info!(src, dst, location = %locations[0], "copying local to remote location");
                }
                try_join_all(locations.iter().map(|location| {
                    transfer::copy_local_to_remote_single(self, src, dst, location)
                }))
                .await?;
                Ok(())
            }
            ConnectorCopyKind::RemoteToLocal => {
                if locations.len() > 1 {
                    return Err(StreamFlowError::WorkflowExecution(
                        "copy from multiple locations is not supported".to_string(),
                    )
                    .into());
                }
                info!(src, dst, location = %locations[0], "copying remote location to local");
                transfer::copy_remote_to_local(self, src, dst, &locations[0]).await
            }
            ConnectorCopyKind::RemoteToRemote => {
                let source_location = source_location.ok_or_else(|| {
                    StreamFlowError::WorkflowExecution(
                        "source location is mandatory for remote to remote copy".to_string(),
                    )
                })?;
                if locations.len() > 1 {
                    info!(
                        src,
                        dst,
                        source = %source_location,
                        locations = locations.len(),
                        "copying remote to remote locations"
                    );
                } else {
                    info!(src, dst, source = %source_location, destination = %locations[0], "copying remote to remote location");
                }
                transfer::copy_remote_to_remote(
                    self,
                    src,
                    dst,
                    locations,
                    source_connector,
                    source_location,
                )
                .await
            }
        }
    }
}

async fn run_with_timeout<F, T>(future: F, timeout: Option<Duration>) -> anyhow::Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    let result = match timeout {
        Some(duration) => tokio::time::timeout(duration, future)
            .await
            .map_err(|_| StreamFlowError::Timeout(duration))?,
        None => future.await,
    };
    result.context("command execution failed")
}
