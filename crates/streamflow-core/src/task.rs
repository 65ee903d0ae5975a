//! The task runner (C5): drives a [`Task`] through
//! deploy → schedule → stage-directories → input-token update → execute →
//! status-notify → emit-output, coordinating many concurrently running
//! [`Job`]s per task.
//!
//! Grounded in `streamflow/workflow/task.py`'s `BaseTask`.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context as _;
use indexmap::IndexMap;
use tokio::task::JoinSet;
use tracing::info;

use crate::connector::Connector;
use crate::connector::Location;
use crate::connector::RunOptions;
use crate::job::Command;
use crate::job::Condition;
use crate::job::DeploymentManager;
use crate::job::Job;
use crate::job::JobStatus;
use crate::job::Scheduler;
use crate::job::Target;
use crate::job::TokenProcessor;
use crate::port::Port;
use crate::token::check_termination;
use crate::token::PortItem;
use crate::token::TerminationToken;
use crate::utils::random_name;

/// Shared collaborators a task's job drivers need: the deployment manager
/// and scheduler. Held behind `Arc` so every concurrently running job driver
/// can reach them without cloning their (possibly expensive) internals.
pub struct TaskContext<V> {
    /// Materialises the task's `target`, if any, before scheduling jobs.
    pub deployment_manager: Arc<dyn DeploymentManager>,
    /// Assigns resources to jobs and tracks their status.
    pub scheduler: Arc<dyn Scheduler<V>>,
}

/// One output port together with the token processor that computes the
/// token placed on it.
pub struct OutputPort<V> {
    /// The port itself.
    pub port: Port<V>,
    /// The processor that computes this port's token from a job's result.
    pub token_processor: Arc<dyn TokenProcessor<V>>,
}

/// One input port together with the token processor that updates tokens
/// read from it before a job executes.
pub struct InputPort<V> {
    /// The port itself.
    pub port: Port<V>,
    /// The processor that updates tokens arriving on this port.
    pub token_processor: Arc<dyn TokenProcessor<V>>,
}

/// A static workflow graph node: a unit of computation fed by zero or more
/// input ports (merged by an [`crate::combinator::InputCombinator`]) and
/// producing a token on each of zero or more output ports.
pub struct Task<V> {
    /// The task's unique name.
    pub name: String,
    /// Input ports, insertion-ordered; empty for a task with no inputs
    /// (such a task runs exactly one job, with no input tokens).
    pub input_ports: IndexMap<Arc<str>, InputPort<V>>,
    /// Output ports, insertion-ordered.
    pub output_ports: IndexMap<Arc<str>, OutputPort<V>>,
    /// Synchronises `input_ports` into firings. Required whenever
    /// `input_ports` is non-empty.
    ///
    /// Wrapped in a [`tokio::sync::Mutex`] purely for interior mutability:
    /// `get()` takes `&mut self` but the combinator is reached through
    /// `Arc<Task<V>>` so job drivers can run concurrently. Only the single
    /// `Task::run` loop ever locks it, so there is no real contention.
    pub input_combinator:
        Option<tokio::sync::Mutex<Box<dyn crate::combinator::InputCombinator<V> + Send>>>,
    /// The command to execute for each firing that passes `condition`.
    pub command: Arc<dyn Command<V>>,
    /// A predicate gating whether a firing's job actually runs.
    pub condition: Option<Arc<dyn Condition>>,
    /// The remote deployment this task runs on, if any. Its absence means
    /// local execution.
    pub target: Option<Target>,
    /// Shared deployment/scheduling collaborators.
    pub context: Arc<TaskContext<V>>,
}

impl<V: Clone + Send + Sync + 'static> Task<V> {
    /// Resolves the connector this task's jobs execute against, or `None`
    /// for local execution.
    pub fn get_connector(&self) -> Option<Arc<dyn Connector>> {
        self.target
            .as_ref()
            .and_then(|target| self.context.deployment_manager.get_connector(&target.model.name))
    }

    /// Creates a fresh, empty directory for one job under a per-backend
    /// temp root, returning its path.
    ///
    /// Remote jobs get `/tmp/streamflow/<uuid>`; local jobs get
    /// `<os-temp-dir>/streamflow/<uuid>`, matching
    /// `BaseTask._init_dir`.
    async fn init_dir(&self, resource: Option<&Location>) -> anyhow::Result<String> {
        let root = if self.target.is_some() {
            "/tmp".to_string()
        } else {
            std::env::temp_dir().to_string_lossy().into_owned()
        };
        let separator = if root.ends_with('/') { "" } else { "/" };
        let dir_path = format!("{root}{separator}streamflow/{}", random_name());

        if let Some(connector) = self.get_connector() {
            let location = resource.cloned().unwrap_or_else(|| {
                Location::new(crate::connector::LOCAL_LOCATION)
            });
            connector
                .run(
                    &location,
                    &["mkdir".to_string(), "-p".to_string(), dir_path.clone()],
                    RunOptions::default(),
                )
                .await
                .with_context(|| format!("failed to create directory {dir_path}"))?;
        } else {
            tokio::fs::create_dir_all(&dir_path)
                .await
                .with_context(|| format!("failed to create directory {dir_path}"))?;
        }

        Ok(dir_path)
    }

    /// Drives one job to completion: deploy → schedule → stage directories
    /// → update input tokens → execute → notify status → emit one token per
    /// output port.
    async fn run_job(self: &Arc<Self>, driver_id: &str, inputs: Vec<PortItem<V>>) {
        let mut job = Job::new(format!("{}/{driver_id}", self.name), inputs);
        info!(job = %job.name, "job created");

        let (result, status) = if self.condition.as_deref().map(Condition::evaluate).unwrap_or(true)
        {
            match self.execute_job(&mut job).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    // Errors from the command propagate to the task's `run`
                    // in the Python source; here, where every job driver
                    // runs as an independent concurrent task, we report the
                    // failure through the job's outputs instead of
                    // panicking the whole task, and re-surface it via
                    // tracing for the embedding application's error
                    // pipeline.
                    tracing::error!(job = %job.name, error = %error, "job execution failed");
                    (None, JobStatus::Failed)
                }
            }
        } else {
            (None, JobStatus::Skipped)
        };

        let mut output_tasks = JoinSet::new();
        for output in self.output_ports.values() {
            let port = output.port.handle();
            let token_processor = Arc::clone(&output.token_processor);
            let job = job.clone();
            let result = result.clone();
            output_tasks.spawn(async move {
                let token = token_processor.compute_token(&job, result, status).await;
                port.put(token);
            });
        }
        while output_tasks.join_next().await.is_some() {}
    }

    /// The non-skipped path of [`Task::run_job`]: deploy, schedule, stage,
    /// update input tokens, execute, notify.
    async fn execute_job(&self, job: &mut Job<V>) -> anyhow::Result<(Option<V>, JobStatus)> {
        if let Some(target) = &self.target {
            self.context
                .deployment_manager
                .deploy(&target.model)
                .await
                .with_context(|| format!("failed to deploy {}", target.model.name))?;
            self.context
                .scheduler
                .schedule(job)
                .await
                .context("failed to schedule job")?;
        }

        let (input_dir, output_dir) = tokio::try_join!(
            self.init_dir(job.resource.as_ref()),
            self.init_dir(job.resource.as_ref()),
        )?;
        job.input_directory = Some(input_dir);
        job.output_directory = Some(output_dir);

        let mut update_tasks = JoinSet::new();
        for (index, token) in job.inputs.iter().cloned().enumerate() {
            let port_name = token.port_name().to_string();
            let processor = Arc::clone(
                &self
                    .input_ports
                    .get(port_name.as_str())
                    .ok_or_else(|| anyhow!("no input port named {port_name}"))?
                    .token_processor,
            );
            let job_snapshot = job.clone();
            update_tasks.spawn(async move {
                let updated = processor.update_token(&job_snapshot, token).await?;
                anyhow::Ok((index, updated))
            });
        }
        let mut updated_inputs = job.inputs.clone();
        while let Some(result) = update_tasks.join_next().await {
            let (index, token) = result.context("input token update task panicked")??;
            updated_inputs[index] = token;
        }
        job.inputs = updated_inputs;

        if self.target.is_some() {
            self.context
                .scheduler
                .notify_status(&job.name, JobStatus::Running)
                .await
                .context("failed to notify running status")?;
        }

        let (result, status) = self
            .command
            .execute(job)
            .await
            .context("command execution failed")?;

        if self.target.is_some() {
            self.context
                .scheduler
                .notify_status(&job.name, status)
                .await
                .context("failed to notify final status")?;
        }

        Ok((result, status))
    }

    /// Runs the task to completion: consumes firings from its
    /// [`crate::combinator::InputCombinator`] (or runs a single job, for a
    /// task with no input ports) until termination, then emits a
    /// [`TerminationToken`] on every output port.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut drivers = JoinSet::new();

        if self.input_ports.is_empty() {
            let this = Arc::clone(&self);
            let driver_id = random_name();
            drivers.spawn(async move { this.run_job(&driver_id, Vec::new()).await });
        } else {
            let combinator = self
                .input_combinator
                .as_ref()
                .ok_or_else(|| anyhow!("no InputCombinator specified for task {}", self.name))?;
            let mut combinator = combinator.lock().await;
            loop {
                let inputs = combinator.get().await;
                if check_termination(&inputs) {
                    break;
                }
                let this = Arc::clone(&self);
                let driver_id = random_name();
                drivers.spawn(async move { this.run_job(&driver_id, inputs).await });
            }
        }

        while drivers.join_next().await.is_some() {}

        for (name, output) in &self.output_ports {
            output
                .port
                .put(PortItem::Termination(TerminationToken::new(Arc::clone(
                    name,
                ))));
        }

        info!(task = %self.name, "task completed");
        Ok(())
    }
}
