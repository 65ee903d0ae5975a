//! The [`Connector`] contract: a uniform interface for running commands and
//! moving data against one class of compute backend.
//!
//! This crate defines only the contract; `streamflow-connector` supplies the
//! streaming tar transfer engine shared by every concrete connector, and
//! `streamflow-connector-kubernetes` supplies the Kubernetes/Helm connector.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::utils::Stdio;

/// The sentinel location name for the in-process filesystem, used when a
/// task has no `target` and therefore no remote deployment.
pub const LOCAL_LOCATION: &str = "__LOCAL__";

/// An opaque handle identifying one execution endpoint within a deployment.
///
/// For the Kubernetes connector this encodes `"<pod-name>:<container-name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    /// The location's unique name within its connector.
    pub name: String,
    /// The resolved network address of the location, if known (e.g. a pod
    /// IP), used for locality-aware scheduling.
    pub hostname: Option<String>,
}

impl Location {
    /// Constructs a location with no known hostname.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: None,
        }
    }

    /// Constructs a location with a known hostname.
    pub fn with_hostname(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: Some(hostname.into()),
        }
    }

    /// Returns `true` if this is the sentinel local location.
    pub fn is_local(&self) -> bool {
        self.name == LOCAL_LOCATION
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The topology of a [`Connector::copy`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorCopyKind {
    /// Copy from the local filesystem to one or more remote locations.
    LocalToRemote,
    /// Copy from exactly one remote location to the local filesystem.
    RemoteToLocal,
    /// Copy from one remote location to one or more remote locations,
    /// possibly on a different connector.
    RemoteToRemote,
}

/// The arguments to [`Connector::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Environment variables to export before running the command.
    pub env: BTreeMap<String, String>,
    /// The working directory to `cd` into.
    pub workdir: Option<String>,
    /// A path to redirect stdin from.
    pub stdin: Option<String>,
    /// Where to redirect stdout.
    pub stdout: Stdio,
    /// Where to redirect stderr.
    pub stderr: Stdio,
    /// Whether to capture and return the command's stdout.
    pub capture_output: bool,
    /// A wall-clock deadline for the invocation, after which the spawned
    /// process is terminated and [`crate::error::StreamFlowError::Timeout`]
    /// is returned.
    pub timeout: Option<Duration>,
    /// An optional job name, used only for log correlation.
    pub job_name: Option<String>,
}

/// The result of a [`Connector::run`] call with `capture_output` set.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// The command's stdout, decoded as UTF-8 and trimmed.
    pub stdout: String,
    /// The process exit code.
    pub exit_code: i32,
}

/// A driver that executes commands and moves bytes against one class of
/// compute backend (local shell, Kubernetes pod, or another remote
/// environment).
///
/// Connectors are long-lived, shared across every task targeting the same
/// deployment, and must be safe for concurrent invocation — every method
/// takes `&self`, not `&mut self`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Returns `self` as `&dyn Any`, letting a `BaseConnector`-flavoured copy
    /// implementation recover its own kind from the trait object passed as
    /// `source_connector` in a remote-to-remote [`Connector::copy`].
    fn as_any(&self) -> &dyn std::any::Any;

    /// Runs `command` at `location`.
    ///
    /// Returns `Some(CapturedOutput)` when `options.capture_output` is set,
    /// `None` otherwise (the caller waits for the process to exit but does
    /// not receive its output).
    async fn run(
        &self,
        location: &Location,
        command: &[String],
        options: RunOptions,
    ) -> anyhow::Result<Option<CapturedOutput>>;

    /// Copies `src` to `dst` under the given topology.
    ///
    /// - [`ConnectorCopyKind::LocalToRemote`]: `src` is a local path, `dst` is
    ///   materialised on every location in `locations`.
    /// - [`ConnectorCopyKind::RemoteToLocal`]: `locations` must contain
    ///   exactly one location; `src` lives there and `dst` is a local path.
    /// - [`ConnectorCopyKind::RemoteToRemote`]: `src` lives at
    ///   `source_location` on `source_connector` (defaulting to `self` when
    ///   `None`); `dst` is materialised on every location in `locations`.
    async fn copy(
        &self,
        src: &str,
        dst: &str,
        locations: &[Location],
        kind: ConnectorCopyKind,
        source_connector: Option<&(dyn Connector + 'static)>,
        source_location: Option<&Location>,
    ) -> anyhow::Result<()>;
}
