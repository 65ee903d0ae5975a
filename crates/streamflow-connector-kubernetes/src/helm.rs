//! The Helm deploy/undeploy [`DeploymentManager`], generic over CLI dialect.
//!
//! Grounded in `deployment/helm.py`'s `Helm2Connector`/`Helm3Connector`,
//! which differ only in `base_command`, the `install`/`uninstall` option
//! tables, and the verbs themselves (Helm 3 uses `install`/`uninstall`,
//! Helm 2 uses `install`/`delete` through Tiller). Per REDESIGN FLAG "avoid
//! inheritance", both are expressed as one [`HelmConnector<D>`] generic over
//! a small [`HelmDialect`] trait rather than two subclasses of a shared
//! base.
//!
//! `--no-crd-hook` is rendered only by [`Helm2Dialect`]: Helm 3 dropped the
//! flag from `helm install` entirely (superseded by `--skip-crds`), so
//! [`Helm3Dialect`] never emits it. See `DESIGN.md` for this decision.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use streamflow_core::connector::Connector;
use streamflow_core::job::DeploymentManager;
use streamflow_core::job::DeploymentModel;
use streamflow_core::utils::get_option;
use streamflow_core::utils::OptionValue;
use tokio::process::Command;
use tracing::debug;

use crate::config::Helm2Config;
use crate::config::Helm3Config;
use crate::config::HelmCommonConfig;
use crate::kubernetes::KubernetesConnector;

/// Supplies the CLI dialect-specific pieces of a Helm deploy/undeploy cycle:
/// the base command (global options), and the `install`/`uninstall` option
/// tables.
pub trait HelmDialect: Send + Sync + 'static {
    /// The dialect's configuration type.
    type Config: Send + Sync;

    /// Renders `helm ` plus every global option (kubeconfig, namespace,
    /// debug, ...), space-terminated.
    fn base_command(config: &Self::Config) -> String;

    /// Renders the `init --upgrade {wait}` Tiller bootstrap subcommand, if
    /// this dialect needs one run once before its first `install`. `None`
    /// when not applicable — always for Helm 3 (Tiller-free), and for Helm 2
    /// unless its `init` flag was requested.
    fn init_command(config: &Self::Config) -> Option<String> {
        let _ = config;
        None
    }

    /// Renders the `install` subcommand and its options, not including the
    /// base command.
    fn install_command(config: &Self::Config) -> String;

    /// Renders the `uninstall`/`delete` subcommand and its options, not
    /// including the base command.
    fn uninstall_command(config: &Self::Config) -> String;
}

fn opt(name: &str, value: impl Into<OptionValue>) -> String {
    get_option(name, &value.into())
}

fn string_opt(name: &str, value: &Option<String>) -> String {
    opt(name, value.clone())
}

fn sequence_opt(name: &str, values: &[String]) -> String {
    opt(name, OptionValue::Sequence(values.to_vec()))
}

/// Helm 2 (Tiller-backed) dialect.
///
/// Its base command carries no `--namespace` (Helm 2 namespaces releases
/// through Tiller, not the CLI); that option only appears on `install`.
pub struct Helm2Dialect;

impl HelmDialect for Helm2Dialect {
    type Config = Helm2Config;

    fn base_command(config: &Self::Config) -> String {
        let common = &config.common;
        format!(
            "helm {debug}{home}{kube_context}{kubeconfig}{tiller_connection_timeout}{tiller_namespace}",
            debug = opt("debug", common.debug),
            home = string_opt("home", &config.home),
            kube_context = string_opt("kube-context", &common.kube_context),
            kubeconfig = string_opt("kubeconfig", &common.kubeconfig),
            tiller_connection_timeout = config
                .tiller_connection_timeout
                .map(|timeout| opt("tiller-connection-timeout", OptionValue::String(timeout.to_string())))
                .unwrap_or_default(),
            tiller_namespace = string_opt("tiller-namespace", &config.tiller_namespace),
        )
    }

    fn init_command(config: &Self::Config) -> Option<String> {
        if config.init {
            Some(format!("init --upgrade {}", opt("wait", config.common.wait)))
        } else {
            None
        }
    }

    fn install_command(config: &Self::Config) -> String {
        let common = &config.common;
        let chart_path = Path::new(&common.streamflow_config_dir).join(&common.chart);
        format!(
            "install {atomic}{ca_file}{cert_file}{dep_up}{description}{devel}{key_file}{keyring}{release_name}{name_template}{namespace}{no_crd_hook}{no_hooks}{password}{render_subchart_notes}{repo}{set}{set_file}{set_string}{timeout}{tls}{tlscacert}{tlscert}{tlshostname}{tlskey}{tlsverify}{username}{values}{verify}{version}{wait}\"{chart}\"",
            atomic = opt("atomic", common.atomic),
            ca_file = string_opt("ca-file", &common.ca_file),
            cert_file = string_opt("cert-file", &common.cert_file),
            dep_up = opt("dep-up", common.dep_up),
            description = string_opt("description", &config.description),
            devel = opt("devel", common.devel),
            key_file = string_opt("key-file", &common.key_file),
            keyring = string_opt("keyring", &common.keyring),
            release_name = string_opt("name", &Some(common.release_name.clone())),
            name_template = string_opt("name-template", &common.name_template),
            namespace = string_opt("namespace", &common.namespace),
            no_crd_hook = opt("no-crd-hook", config.no_crd_hook),
            no_hooks = opt("no-hooks", common.no_hooks),
            password = string_opt("password", &common.password),
            render_subchart_notes = opt("render-subchart-notes", common.render_subchart_notes),
            repo = string_opt("repo", &common.repo),
            set = sequence_opt("set", &common.command_line_values),
            set_file = sequence_opt("set-file", &common.file_values),
            set_string = sequence_opt("set-string", &common.string_values),
            timeout = string_opt("timeout", &common.timeout),
            tls = opt("tls", config.tls),
            tlscacert = string_opt("tls-ca-cert", &config.tlscacert),
            tlscert = string_opt("tls-cert", &config.tlscert),
            tlshostname = string_opt("tls-hostname", &config.tlshostname),
            tlskey = string_opt("tls-key", &config.tlskey),
            tlsverify = opt("tls-verify", config.tlsverify),
            username = string_opt("username", &common.username),
            values = sequence_opt("values", &common.yaml_values),
            verify = opt("verify", common.verify),
            version = string_opt("version", &common.chart_version),
            wait = opt("wait", common.wait),
            chart = chart_path.display(),
        )
    }

    fn uninstall_command(config: &Self::Config) -> String {
        let common = &config.common;
        format!(
            "delete {description}{no_hooks}{purge}{timeout}{tls}{tlscacert}{tlscert}{tlshostname}{tlskey}{tlsverify}{release_name}",
            description = string_opt("description", &config.description),
            no_hooks = opt("no-hooks", common.no_hooks),
            purge = opt("purge", config.purge),
            timeout = string_opt("timeout", &common.timeout),
            tls = opt("tls", config.tls),
            tlscacert = string_opt("tls-ca-cert", &config.tlscacert),
            tlscert = string_opt("tls-cert", &config.tlscert),
            tlshostname = string_opt("tls-hostname", &config.tlshostname),
            tlskey = string_opt("tls-key", &config.tlskey),
            tlsverify = opt("tls-verify", config.tlsverify),
            release_name = common.release_name,
        )
    }
}

/// Helm 3 (Tiller-free) dialect.
pub struct Helm3Dialect;

impl HelmDialect for Helm3Dialect {
    type Config = Helm3Config;

    fn base_command(config: &Self::Config) -> String {
        let common = &config.common;
        format!(
            "helm {debug}{kube_context}{kubeconfig}{namespace}{registry_config}{repository_cache}{repository_config}",
            debug = opt("debug", common.debug),
            kube_context = string_opt("kube-context", &common.kube_context),
            kubeconfig = string_opt("kubeconfig", &common.kubeconfig),
            namespace = string_opt("namespace", &common.namespace),
            registry_config = string_opt("registry-config", &config.registry_config),
            repository_cache = string_opt("repository-cache", &config.repository_cache),
            repository_config = string_opt("repository-config", &config.repository_config),
        )
    }

    fn install_command(config: &Self::Config) -> String {
        let common = &config.common;
        let chart_path = Path::new(&common.streamflow_config_dir).join(&common.chart);
        format!(
            "install {atomic}{ca_file}{cert_file}{dep_up}{devel}{key_file}{keyring}{name_template}{no_hooks}{password}{render_subchart_notes}{repo}{set}{set_file}{set_string}{skip_crds}{timeout}{username}{values}{verify}{version}{wait}{release_name} \"{chart}\"",
            atomic = opt("atomic", common.atomic),
            ca_file = string_opt("ca-file", &common.ca_file),
            cert_file = string_opt("cert-file", &common.cert_file),
            dep_up = opt("dep-up", common.dep_up),
            devel = opt("devel", common.devel),
            key_file = string_opt("key-file", &common.key_file),
            keyring = string_opt("keyring", &common.keyring),
            name_template = string_opt("name-template", &common.name_template),
            no_hooks = opt("no-hooks", common.no_hooks),
            password = string_opt("password", &common.password),
            render_subchart_notes = opt("render-subchart-notes", common.render_subchart_notes),
            repo = string_opt("repo", &common.repo),
            set = sequence_opt("set", &common.command_line_values),
            set_file = sequence_opt("set-file", &common.file_values),
            set_string = sequence_opt("set-string", &common.string_values),
            skip_crds = opt("skip-crds", config.skip_crds),
            timeout = string_opt("timeout", &common.timeout),
            username = string_opt("username", &common.username),
            values = sequence_opt("values", &common.yaml_values),
            verify = opt("verify", common.verify),
            version = string_opt("version", &common.chart_version),
            wait = opt("wait", common.wait),
            release_name = common.release_name,
            chart = chart_path.display(),
        )
    }

    fn uninstall_command(config: &Self::Config) -> String {
        let common = &config.common;
        format!(
            "uninstall {keep_history}{no_hooks}{timeout}{release_name}",
            keep_history = opt("keep-history", config.keep_history),
            no_hooks = opt("no-hooks", common.no_hooks),
            timeout = string_opt("timeout", &common.timeout),
            release_name = common.release_name,
        )
    }
}

/// Materialises (and tears down) one Helm release, handing out the
/// [`KubernetesConnector`] bound to it once deployed.
///
/// One instance manages exactly one [`DeploymentModel`], matching the
/// Python source's one-`BaseHelmConnector`-per-deployment-config layout;
/// `deploy`/`undeploy`/`get_connector` all compare against `model_name`.
pub struct HelmConnector<D: HelmDialect> {
    config: D::Config,
    model_name: String,
    connector: Arc<KubernetesConnector>,
    /// Set once [`HelmDialect::init_command`]'s Tiller bootstrap has run, so
    /// it fires at most once across however many times `deploy` is called —
    /// mirroring `Helm2Connector.__init__` calling `_init_helm()` exactly
    /// once, before any `deploy`.
    initialized: AtomicBool,
    _dialect: PhantomData<D>,
}

impl<D: HelmDialect> HelmConnector<D> {
    /// Constructs a manager for `model_name`, backed by `config` and handing
    /// out `connector` once deployed.
    pub fn new(model_name: impl Into<String>, config: D::Config, connector: Arc<KubernetesConnector>) -> Self {
        Self {
            config,
            model_name: model_name.into(),
            connector,
            initialized: AtomicBool::new(false),
            _dialect: PhantomData,
        }
    }

    fn check_model(&self, model: &DeploymentModel) -> anyhow::Result<()> {
        anyhow::ensure!(
            model.name == self.model_name,
            "deployment model `{}` is not managed by this Helm connector (expected `{}`)",
            model.name,
            self.model_name
        );
        Ok(())
    }
}

async fn run_helm(command: String) -> anyhow::Result<()> {
    debug!("executing {command}");
    let parts = shlex::split(&command)
        .ok_or_else(|| anyhow::anyhow!("failed to tokenize helm command"))?;
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("helm command tokenized to nothing"))?;
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to spawn `{program}`"))?;
    anyhow::ensure!(status.success(), "helm command `{command}` exited with {status}");
    Ok(())
}

#[async_trait]
impl<D: HelmDialect> DeploymentManager for HelmConnector<D> {
    async fn deploy(&self, model: &DeploymentModel) -> anyhow::Result<()> {
        self.check_model(model)?;

        if let Some(init_command) = D::init_command(&self.config) {
            if self
                .initialized
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let command = format!("{}{init_command}", D::base_command(&self.config));
                run_helm(command).await?;
            }
        }

        let command = format!(
            "{}{}",
            D::base_command(&self.config),
            D::install_command(&self.config)
        );
        run_helm(command).await
    }

    async fn undeploy(&self, model: &DeploymentModel) -> anyhow::Result<()> {
        self.check_model(model)?;
        let command = format!(
            "{}{}",
            D::base_command(&self.config),
            D::uninstall_command(&self.config)
        );
        run_helm(command).await?;
        self.connector.reset_client().await;
        Ok(())
    }

    fn get_connector(&self, model_name: &str) -> Option<Arc<dyn Connector>> {
        if model_name == self.model_name {
            Some(self.connector.clone() as Arc<dyn Connector>)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn common() -> HelmCommonConfig {
        HelmCommonConfig {
            streamflow_config_dir: "/config".to_string(),
            chart: "chart".to_string(),
            release_name: "release-1".to_string(),
            wait: true,
            ..Default::default()
        }
    }

    #[test]
    fn helm2_install_renders_no_crd_hook() {
        let config = Helm2Config {
            common: common(),
            no_crd_hook: true,
            purge: true,
            ..Default::default()
        };
        let command = Helm2Dialect::install_command(&config);
        assert!(command.contains("--no-crd-hook"), "{command}");
    }

    #[test]
    fn helm3_install_never_renders_no_crd_hook() {
        let config = Helm3Config {
            common: common(),
            skip_crds: true,
            ..Default::default()
        };
        let command = Helm3Dialect::install_command(&config);
        assert!(!command.contains("no-crd-hook"), "{command}");
        assert!(command.contains("--skip-crds"));
    }

    #[test]
    fn helm3_uninstall_supports_keep_history() {
        let config = Helm3Config {
            common: common(),
            keep_history: true,
            ..Default::default()
        };
        let command = Helm3Dialect::uninstall_command(&config);
        assert!(command.starts_with("uninstall "));
        assert!(command.contains("--keep-history"));
        assert!(command.contains("release-1"));
    }

    #[test]
    fn helm2_init_command_only_rendered_when_requested() {
        let requested = Helm2Config {
            common: common(),
            init: true,
            ..Default::default()
        };
        let command = Helm2Dialect::init_command(&requested).expect("init was requested");
        assert_eq!(command, "init --upgrade --wait ");

        let not_requested = Helm2Config {
            common: common(),
            init: false,
            ..Default::default()
        };
        assert!(Helm2Dialect::init_command(&not_requested).is_none());
    }

    #[test]
    fn helm3_never_renders_an_init_command() {
        let config = Helm3Config {
            common: common(),
            ..Default::default()
        };
        assert!(Helm3Dialect::init_command(&config).is_none());
    }
}
