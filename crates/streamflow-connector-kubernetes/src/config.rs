//! Deserializable configuration for the Kubernetes connector and the two
//! Helm deploy/undeploy dialects.
//!
//! Grounded in `deployment/helm.py`'s `BaseHelmConnector.__init__`,
//! `Helm2Connector.__init__`, and `Helm3Connector.__init__` — every field
//! here is a constructor keyword argument there, carried over with the same
//! default where one existed.

use serde::Deserialize;
use serde::Serialize;

/// How a [`crate::kubernetes::KubernetesConnector`] reaches the cluster API
/// server, mirroring `BaseHelmConnector`'s `inCluster`/`kubeconfig` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConnectorConfig {
    /// Use the in-pod service account mount instead of a kubeconfig file.
    #[serde(default)]
    pub in_cluster: bool,
    /// Path to a kubeconfig file, used when `in_cluster` is `false`.
    ///
    /// Defaults to `~/.kube/config` at call time when absent, matching the
    /// Python default of `os.path.join(os.environ['HOME'], ".kube", "config")`.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// The namespace to operate in. For `in_cluster = true`, overrides the
    /// namespace read from the service-account mount when set.
    #[serde(default)]
    pub namespace: Option<String>,
    /// The Helm release name resources are expected to carry as their
    /// `app.kubernetes.io/instance` label.
    pub release_name: String,
    /// The chunk size used when streaming tar archives over pod-exec,
    /// matching `transferBufferSize` (default `(32 << 20) - 1` bytes).
    #[serde(default = "default_transfer_buffer_size")]
    pub transfer_buffer_size: usize,
}

fn default_transfer_buffer_size() -> usize {
    (32 << 20) - 1
}

/// Shared Helm CLI options common to both dialects, grounded in
/// `BaseHelmConnector`'s constructor plus the fields both `Helm2Connector`
/// and `Helm3Connector` declare identically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelmCommonConfig {
    /// Directory the chart path is resolved against.
    pub streamflow_config_dir: String,
    /// Chart path or name, relative to `streamflow_config_dir`.
    pub chart: String,
    /// `--debug`.
    #[serde(default)]
    pub debug: bool,
    /// `--kube-context`.
    #[serde(default)]
    pub kube_context: Option<String>,
    /// `--kubeconfig`.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// `--atomic`.
    #[serde(default)]
    pub atomic: bool,
    /// `--ca-file`.
    #[serde(default)]
    pub ca_file: Option<String>,
    /// `--cert-file`.
    #[serde(default)]
    pub cert_file: Option<String>,
    /// `--dep-up`.
    #[serde(default)]
    pub dep_up: bool,
    /// `--devel`.
    #[serde(default)]
    pub devel: bool,
    /// `--key-file`.
    #[serde(default)]
    pub key_file: Option<String>,
    /// `--keyring`.
    #[serde(default)]
    pub keyring: Option<String>,
    /// The release name passed to `helm install`/`uninstall`.
    pub release_name: String,
    /// `--name-template`.
    #[serde(default)]
    pub name_template: Option<String>,
    /// `--namespace`.
    #[serde(default)]
    pub namespace: Option<String>,
    /// `--no-hooks`.
    #[serde(default)]
    pub no_hooks: bool,
    /// `--password`.
    #[serde(default)]
    pub password: Option<String>,
    /// `--render-subchart-notes`.
    #[serde(default)]
    pub render_subchart_notes: bool,
    /// `--repo`.
    #[serde(default)]
    pub repo: Option<String>,
    /// `--set`, one repetition per entry.
    #[serde(default)]
    pub command_line_values: Vec<String>,
    /// `--set-file`, one repetition per entry.
    #[serde(default)]
    pub file_values: Vec<String>,
    /// `--set-string`, one repetition per entry.
    #[serde(default)]
    pub string_values: Vec<String>,
    /// `--timeout`.
    #[serde(default)]
    pub timeout: Option<String>,
    /// `--username`.
    #[serde(default)]
    pub username: Option<String>,
    /// `--values`, one repetition per entry.
    #[serde(default)]
    pub yaml_values: Vec<String>,
    /// `--verify`.
    #[serde(default)]
    pub verify: bool,
    /// `--version`.
    #[serde(default)]
    pub chart_version: Option<String>,
    /// `--wait`.
    #[serde(default = "default_true")]
    pub wait: bool,
}

fn default_true() -> bool {
    true
}

/// `Helm2Connector`-only fields: tiller connection options, TLS, and the
/// `no-crd-hook`/`purge` flags dropped from Helm 3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Helm2Config {
    /// Fields shared with the Helm 3 dialect.
    #[serde(flatten)]
    pub common: HelmCommonConfig,
    /// `--home`.
    #[serde(default)]
    pub home: Option<String>,
    /// `--tiller-connection-timeout`.
    #[serde(default)]
    pub tiller_connection_timeout: Option<i64>,
    /// `--tiller-namespace`.
    #[serde(default)]
    pub tiller_namespace: Option<String>,
    /// `--description`.
    #[serde(default)]
    pub description: Option<String>,
    /// `--init`, run once before the first deploy.
    #[serde(default)]
    pub init: bool,
    /// `--no-crd-hook`. Only rendered for this dialect — Helm 3 dropped the
    /// flag from `helm install` entirely.
    #[serde(default)]
    pub no_crd_hook: bool,
    /// `--tls`.
    #[serde(default)]
    pub tls: bool,
    /// `--tls-ca-cert`.
    #[serde(default)]
    pub tlscacert: Option<String>,
    /// `--tls-cert`.
    #[serde(default)]
    pub tlscert: Option<String>,
    /// `--tls-hostname`.
    #[serde(default)]
    pub tlshostname: Option<String>,
    /// `--tls-key`.
    #[serde(default)]
    pub tlskey: Option<String>,
    /// `--tls-verify`.
    #[serde(default)]
    pub tlsverify: bool,
    /// `--purge`, defaulted to `true` as in the Python source.
    #[serde(default = "default_true")]
    pub purge: bool,
}

/// `Helm3Connector`-only fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Helm3Config {
    /// Fields shared with the Helm 2 dialect.
    #[serde(flatten)]
    pub common: HelmCommonConfig,
    /// `--keep-history`, an `uninstall`-only flag absent from Helm 2.
    #[serde(default)]
    pub keep_history: bool,
    /// `--registry-config`.
    #[serde(default)]
    pub registry_config: Option<String>,
    /// `--repository-cache`.
    #[serde(default)]
    pub repository_cache: Option<String>,
    /// `--repository-config`.
    #[serde(default)]
    pub repository_config: Option<String>,
    /// `--skip-crds`, the Helm 3 replacement for `no-crd-hook`.
    #[serde(default)]
    pub skip_crds: bool,
}
