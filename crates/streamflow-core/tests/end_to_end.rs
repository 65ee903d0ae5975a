//! End-to-end task-runner scenarios from spec §8, exercised with in-memory
//! fakes for every external collaborator (`Command`, `TokenProcessor`,
//! `Condition`, `DeploymentManager`, `Scheduler`).

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use streamflow_core::job::Command;
use streamflow_core::job::Condition;
use streamflow_core::job::DeploymentManager;
use streamflow_core::job::DeploymentModel;
use streamflow_core::job::Job;
use streamflow_core::job::JobStatus;
use streamflow_core::job::Scheduler;
use streamflow_core::job::TokenProcessor;
use streamflow_core::task::InputPort;
use streamflow_core::task::OutputPort;
use streamflow_core::task::Task;
use streamflow_core::task::TaskContext;
use streamflow_core::CartesianProductCombinator;
use streamflow_core::Connector;
use streamflow_core::DotProductCombinator;
use streamflow_core::Port;
use streamflow_core::PortItem;
use streamflow_core::TerminationToken;
use streamflow_core::Token;

/// Passes every input token through unchanged and joins all input values
/// with a space to produce its result, mimicking a shell task that echoes
/// `$A $B`.
struct EchoCommand;

#[async_trait]
impl Command<String> for EchoCommand {
    async fn execute(&self, job: &Job<String>) -> anyhow::Result<(Option<String>, JobStatus)> {
        let joined = job
            .inputs
            .iter()
            .filter_map(|item| match item {
                PortItem::Token(token) => Some(token.value.clone()),
                PortItem::Termination(_) => None,
            })
            .collect::<Vec<_>>()
            .join(" ");
        Ok((Some(joined), JobStatus::Completed))
    }
}

/// A no-op token processor: `update_token` is the identity, `compute_token`
/// emits the job's result (or an empty string) tagged with the job's name.
struct PassthroughProcessor {
    port_name: Arc<str>,
}

#[async_trait]
impl TokenProcessor<String> for PassthroughProcessor {
    async fn update_token(
        &self,
        _job: &Job<String>,
        token: PortItem<String>,
    ) -> anyhow::Result<PortItem<String>> {
        Ok(token)
    }

    async fn compute_token(
        &self,
        job: &Job<String>,
        result: Option<String>,
        status: JobStatus,
    ) -> PortItem<String> {
        match status {
            JobStatus::Skipped => PortItem::Token(Token::new(
                Arc::clone(&self.port_name),
                job.name.clone(),
                String::new(),
            )),
            _ => PortItem::Token(Token::new(
                Arc::clone(&self.port_name),
                job.name.clone(),
                result.unwrap_or_default(),
            )),
        }
    }
}

/// A deployment manager that records nothing and never supplies a
/// connector: sufficient for every local (non-`target`) scenario.
struct NoopDeploymentManager;

#[async_trait]
impl DeploymentManager for NoopDeploymentManager {
    async fn deploy(&self, _model: &DeploymentModel) -> anyhow::Result<()> {
        Ok(())
    }

    async fn undeploy(&self, _model: &DeploymentModel) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_connector(&self, _model_name: &str) -> Option<Arc<dyn Connector>> {
        None
    }
}

/// A scheduler that never assigns a resource; adequate whenever `target` is
/// `None`, since `schedule`/`notify_status` are only invoked for remote
/// tasks.
struct NoopScheduler;

#[async_trait]
impl Scheduler<String> for NoopScheduler {
    async fn schedule(&self, _job: &mut Job<String>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notify_status(&self, _job_name: &str, _status: JobStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

fn local_context() -> Arc<TaskContext<String>> {
    Arc::new(TaskContext {
        deployment_manager: Arc::new(NoopDeploymentManager),
        scheduler: Arc::new(NoopScheduler),
    })
}

async fn drain_output(port: &Port<String>) -> Vec<PortItem<String>> {
    let mut items = Vec::new();
    loop {
        let item = port.get().await;
        let is_termination = item.is_termination();
        items.push(item);
        if is_termination {
            break;
        }
    }
    items
}

#[tokio::test]
async fn dot_product_two_port_task_echoes_values() {
    let port_a: Port<String> = Port::new();
    let port_b: Port<String> = Port::new();
    port_a.put(PortItem::Token(Token::new("a", "0", "a1".to_string())));
    port_a.put(PortItem::Termination(TerminationToken::new("a")));
    port_b.put(PortItem::Token(Token::new("b", "0", "b1".to_string())));
    port_b.put(PortItem::Termination(TerminationToken::new("b")));

    let mut ports = IndexMap::new();
    ports.insert(Arc::from("a"), port_a.handle());
    ports.insert(Arc::from("b"), port_b.handle());
    let combinator = DotProductCombinator::new("in", ports);

    let output_port: Port<String> = Port::new();
    let mut input_ports = IndexMap::new();
    input_ports.insert(
        Arc::from("a"),
        InputPort {
            port: port_a,
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("a"),
            }),
        },
    );
    input_ports.insert(
        Arc::from("b"),
        InputPort {
            port: port_b,
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("b"),
            }),
        },
    );
    let mut output_ports = IndexMap::new();
    output_ports.insert(
        Arc::from("out"),
        OutputPort {
            port: output_port.handle(),
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("out"),
            }),
        },
    );

    let task = Arc::new(Task {
        name: "echo".to_string(),
        input_ports,
        output_ports,
        input_combinator: Some(tokio::sync::Mutex::new(Box::new(combinator))),
        command: Arc::new(EchoCommand),
        condition: None,
        target: None,
        context: local_context(),
    });

    task.run().await.unwrap();

    let items = drain_output(&output_port).await;
    assert_eq!(items.len(), 2);
    match &items[0] {
        PortItem::Token(token) => assert_eq!(token.value, "a1 b1"),
        other => panic!("expected a token, got {other:?}"),
    }
    assert!(items[1].is_termination());
}

#[tokio::test]
async fn cartesian_two_by_two_task_emits_full_cross_product() {
    let port_a: Port<String> = Port::new();
    let port_b: Port<String> = Port::new();
    for value in ["a1", "a2"] {
        port_a.put(PortItem::Token(Token::new("a", value, value.to_string())));
    }
    port_a.put(PortItem::Termination(TerminationToken::new("a")));
    for value in ["b1", "b2"] {
        port_b.put(PortItem::Token(Token::new("b", value, value.to_string())));
    }
    port_b.put(PortItem::Termination(TerminationToken::new("b")));

    let mut ports = IndexMap::new();
    ports.insert(Arc::from("a"), port_a.handle());
    ports.insert(Arc::from("b"), port_b.handle());
    let combinator = CartesianProductCombinator::new("in", ports);

    let output_port: Port<String> = Port::new();
    let mut input_ports = IndexMap::new();
    input_ports.insert(
        Arc::from("a"),
        InputPort {
            port: port_a,
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("a"),
            }),
        },
    );
    input_ports.insert(
        Arc::from("b"),
        InputPort {
            port: port_b,
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("b"),
            }),
        },
    );
    let mut output_ports = IndexMap::new();
    output_ports.insert(
        Arc::from("out"),
        OutputPort {
            port: output_port.handle(),
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("out"),
            }),
        },
    );

    let task = Arc::new(Task {
        name: "cross".to_string(),
        input_ports,
        output_ports,
        input_combinator: Some(tokio::sync::Mutex::new(Box::new(combinator))),
        command: Arc::new(EchoCommand),
        condition: None,
        target: None,
        context: local_context(),
    });

    task.run().await.unwrap();

    let items = drain_output(&output_port).await;
    assert_eq!(items.len(), 5);
    let mut values: Vec<String> = items[..4]
        .iter()
        .map(|item| match item {
            PortItem::Token(token) => token.value.clone(),
            other => panic!("expected a token, got {other:?}"),
        })
        .collect();
    values.sort();
    assert_eq!(values, vec!["a1 b1", "a1 b2", "a2 b1", "a2 b2"]);
    assert!(items[4].is_termination());
}

/// A condition that always evaluates to `false`.
struct NeverCondition;

impl Condition for NeverCondition {
    fn evaluate(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn skipped_task_emits_null_token_and_no_deployment() {
    let output_port: Port<String> = Port::new();
    let mut output_ports = IndexMap::new();
    output_ports.insert(
        Arc::from("out"),
        OutputPort {
            port: output_port.handle(),
            token_processor: Arc::new(PassthroughProcessor {
                port_name: Arc::from("out"),
            }),
        },
    );

    let task = Arc::new(Task {
        name: "skipped".to_string(),
        input_ports: IndexMap::new(),
        output_ports,
        input_combinator: None,
        command: Arc::new(EchoCommand),
        condition: Some(Arc::new(NeverCondition)),
        target: None,
        context: local_context(),
    });

    task.run().await.unwrap();

    let items = drain_output(&output_port).await;
    assert_eq!(items.len(), 2);
    match &items[0] {
        PortItem::Token(token) => assert_eq!(token.value, ""),
        other => panic!("expected a token, got {other:?}"),
    }
    assert!(items[1].is_termination());
}
