//! Core dataflow and task-execution engine for StreamFlow.
//!
//! This crate implements the three hard-core subsystems of the StreamFlow
//! workflow manager that are independent of any concrete compute backend:
//!
//! - [`combinator`]: merges asynchronous input ports into job firings
//!   (dot-product and Cartesian-product semantics).
//! - [`task`]: drives a task's jobs through deploy → schedule → stage →
//!   update-inputs → execute → notify → emit-output.
//! - [`port`] and [`token`]: the typed dataflow channel and its unit of
//!   value, including end-of-stream termination markers.
//!
//! The [`connector::Connector`] trait is the seam this crate uses to reach
//! compute backends without depending on any of them; `streamflow-connector`
//! and `streamflow-connector-kubernetes` provide concrete implementations.

pub mod combinator;
pub mod connector;
pub mod error;
pub mod job;
pub mod port;
pub mod task;
pub mod token;
pub mod utils;

pub use combinator::CartesianProductCombinator;
pub use combinator::DotProductCombinator;
pub use combinator::InputCombinator;
pub use connector::Connector;
pub use connector::ConnectorCopyKind;
pub use connector::Location;
pub use error::StreamFlowError;
pub use job::Condition;
pub use job::DeploymentManager;
pub use job::Job;
pub use job::JobStatus;
pub use job::Scheduler;
pub use job::Target;
pub use job::TokenProcessor;
pub use port::Port;
pub use task::Task;
pub use task::TaskContext;
pub use token::PortItem;
pub use token::TerminationToken;
pub use token::Token;
