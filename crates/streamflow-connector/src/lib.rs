//! `BaseConnector`, its streaming tar-over-pipe data transfer engine, and
//! the in-process [`LocalConnector`] every workflow can fall back to.
//!
//! [`base::BaseConnector`] carries every behaviour a remote
//! [`streamflow_core::connector::Connector`] needs — command execution and
//! directory-tree copy over three topologies — and defers only "how do I
//! turn a shell command into a spawnable argv at this location" to a
//! [`base::RunCommandBuilder`] supplied by the concrete backend (an SSH
//! wrapper, a Kubernetes pod-exec dialect, ...).

pub mod base;
pub mod local;
mod transfer;

pub use base::BaseConnector;
pub use base::RunCommandBuilder;
pub use local::LocalConnector;
pub use local::LocalConnectorConfig;
