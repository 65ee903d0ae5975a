//! The [`Job`] model and the external collaborator contracts the task
//! runner depends on: [`Condition`], [`DeploymentManager`], [`Scheduler`],
//! and [`TokenProcessor`].
//!
//! These traits are deliberately thin — concrete implementations (a
//! condition-expression evaluator, a Helm-backed deployment manager, a
//! resource-aware scheduler, file-staging token processors) are external
//! collaborators per spec §1 and live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connector::Connector;
use crate::connector::Location;
use crate::token::PortItem;

/// The outcome of a job's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The job's command is currently executing on its assigned resource.
    Running,
    /// The job's command completed successfully.
    Completed,
    /// The job's command completed with a failure.
    Failed,
    /// The job's `condition` evaluated to `false`; no command ran.
    Skipped,
}

/// A single unit of work created per firing.
///
/// Mutable only by the task runner that owns it (`&mut` methods are never
/// exposed across an `Arc`); destroyed once its output tokens have been
/// emitted.
#[derive(Debug, Clone)]
pub struct Job<V> {
    /// `<task-name>/<driver-id>`.
    pub name: String,
    /// The input tokens this job was created from; replaced in place once
    /// each has been run through its port's token processor.
    pub inputs: Vec<PortItem<V>>,
    /// The job's freshly created input staging directory, set once the
    /// runtime environment has been materialised.
    pub input_directory: Option<String>,
    /// The job's freshly created output staging directory.
    pub output_directory: Option<String>,
    /// The resource the scheduler assigned this job to, if it targets a
    /// remote deployment.
    pub resource: Option<Location>,
}

impl<V> Job<V> {
    /// Constructs a new job with no resource or staging directories yet
    /// assigned.
    pub fn new(name: impl Into<String>, inputs: Vec<PortItem<V>>) -> Self {
        Self {
            name: name.into(),
            inputs,
            input_directory: None,
            output_directory: None,
            resource: None,
        }
    }
}

/// A condition gating whether a job actually runs.
///
/// Evaluated synchronously, matching `streamflow.core.workflow.Condition`:
/// conditions are pure predicates over already-materialised state, not I/O.
pub trait Condition: Send + Sync {
    /// Returns `true` if the job should run.
    fn evaluate(&self) -> bool;
}

/// Identifies one deployable model (a Helm chart, a container image, ...).
#[derive(Debug, Clone)]
pub struct DeploymentModel {
    /// The model's unique name, used to look up its connector once
    /// deployed.
    pub name: String,
}

/// A task's remote execution target: a deployment model plus the service
/// name within it that the task actually runs.
#[derive(Debug, Clone)]
pub struct Target {
    /// The deployment to materialise before scheduling jobs against it.
    pub model: DeploymentModel,
    /// The service (e.g. Kubernetes container name) within the deployment
    /// this task runs.
    pub service: String,
}

/// Materialises deployments and hands out the connector bound to each.
#[async_trait]
pub trait DeploymentManager: Send + Sync {
    /// Ensures `model` is deployed, deploying it if this is the first
    /// request for it. Idempotent.
    async fn deploy(&self, model: &DeploymentModel) -> anyhow::Result<()>;

    /// Tears down a previously deployed model.
    async fn undeploy(&self, model: &DeploymentModel) -> anyhow::Result<()>;

    /// Returns the connector bound to `model`, if it has been deployed.
    fn get_connector(&self, model_name: &str) -> Option<Arc<dyn Connector>>;
}

/// Assigns resources to jobs and tracks their status.
#[async_trait]
pub trait Scheduler<V>: Send + Sync {
    /// Assigns a resource to `job`, setting `job.resource`.
    async fn schedule(&self, job: &mut Job<V>) -> anyhow::Result<()>;

    /// Records a status transition for the named job.
    async fn notify_status(&self, job_name: &str, status: JobStatus) -> anyhow::Result<()>;
}

/// Stages, rewrites, and computes the tokens flowing through one port.
///
/// `update_token` runs once per input token, after a job's directories have
/// been materialised and (if applicable) its resource assigned; it may
/// stage files onto that resource or rewrite the token's value to a
/// resource-local path. `compute_token` runs once per output port after the
/// job's command has completed (or been skipped), producing the token to
/// place on that port.
#[async_trait]
pub trait TokenProcessor<V>: Send + Sync {
    /// Updates an input token for the given job.
    async fn update_token(&self, job: &Job<V>, token: PortItem<V>) -> anyhow::Result<PortItem<V>>;

    /// Computes an output token for the given job and result.
    async fn compute_token(
        &self,
        job: &Job<V>,
        result: Option<V>,
        status: JobStatus,
    ) -> PortItem<V>;
}

/// Executes a task's command against a materialised job.
#[async_trait]
pub trait Command<V>: Send + Sync {
    /// Runs the command, returning its result value (if any) and status.
    async fn execute(&self, job: &Job<V>) -> anyhow::Result<(Option<V>, JobStatus)>;
}
