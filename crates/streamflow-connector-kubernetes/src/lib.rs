//! The Kubernetes pod-exec [`Connector`] and the Helm `DeploymentManager`
//! that materialises the release it runs against.
//!
//! [`kubernetes::KubernetesConnector`] realises [`streamflow_core::connector::Connector`]
//! directly against the cluster API rather than composing
//! `streamflow_connector::base::BaseConnector`: its `run`/`copy` go over
//! pod-exec, not a locally spawnable argv, mirroring how
//! `BaseHelmConnector` overrides `run`/`_copy_*` rather than implementing
//! `_get_run_command`. [`helm::HelmConnector`] is the deploy/undeploy side,
//! generic over [`helm::HelmDialect`] so the Helm 2 and Helm 3 CLI surfaces
//! share one implementation.

pub mod config;
pub mod helm;
pub mod kubernetes;

pub use config::Helm2Config;
pub use config::Helm3Config;
pub use config::HelmCommonConfig;
pub use config::KubernetesConnectorConfig;
pub use helm::Helm2Dialect;
pub use helm::Helm3Dialect;
pub use helm::HelmConnector;
pub use helm::HelmDialect;
pub use kubernetes::KubernetesConnector;
pub use kubernetes::ResourceMap;
