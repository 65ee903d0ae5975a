//! [`KubernetesConnector`]: a [`Connector`] realised against a live cluster
//! through the pod-exec API, plus `app.kubernetes.io/instance` label-based
//! resource discovery.
//!
//! Grounded in `deployment/helm.py`'s `BaseHelmConnector` — `_get_client_ws`,
//! `_get_configuration`, `_configure_incluster_namespace`,
//! `get_available_resources`, `run`, and the three `_copy_*` methods. Unlike
//! `streamflow_connector::base::BaseConnector`, this connector never spawns a
//! local process for `run`/`copy`: every operation goes over the Kubernetes
//! API, so channel multiplexing (stdin=0/stdout=1/stderr=2/error=3 in the raw
//! protocol) is handled for us by `kube`'s `AttachedProcess` instead of by
//! hand.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::anyhow;
use anyhow::Context as _;
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::StreamExt as _;
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::api::AttachParams;
use kube::api::AttachedProcess;
use kube::api::ListParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use streamflow_core::connector::CapturedOutput;
use streamflow_core::connector::Connector;
use streamflow_core::connector::ConnectorCopyKind;
use streamflow_core::connector::Location;
use streamflow_core::connector::RunOptions;
use streamflow_core::error::StreamFlowError;
use streamflow_core::utils::create_command;
use streamflow_core::utils::CommandOptions;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use crate::config::KubernetesConnectorConfig;

const SERVICE_NAMESPACE_FILENAME: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// One execution endpoint discovered by [`KubernetesConnector::get_available_resources`]:
/// a `"<pod>:<container>"` [`Location`], carrying the pod IP when known.
pub type ResourceMap = IndexMap<String, Location>;

/// A [`Connector`] that runs commands and moves data through the Kubernetes
/// pod-exec API instead of a local subprocess.
pub struct KubernetesConnector {
    config: KubernetesConnectorConfig,
    client: RwLock<Option<Client>>,
}

impl KubernetesConnector {
    /// Constructs a connector from its configuration. The API client is
    /// lazily established on first use.
    pub fn new(config: KubernetesConnectorConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    fn namespace(&self) -> &str {
        self.config.namespace.as_deref().unwrap_or("default")
    }

    async fn client(&self) -> anyhow::Result<Client> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }
        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = self.build_client().await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Drops the cached API client, forcing the next operation to rebuild
    /// it. Called once a Helm release is undeployed, matching
    /// `BaseHelmConnector.undeploy`'s `self.client = None` /
    /// `self.client_ws = None` / `self.configuration = None` cleanup.
    pub async fn reset_client(&self) {
        *self.client.write().await = None;
    }

    async fn build_client(&self) -> anyhow::Result<Client> {
        let kube_config = self.configuration().await?;
        Client::try_from(kube_config).context("building a Kubernetes API client")
    }

    /// Resolves the `kube::Config` this connector talks through, following
    /// `_get_configuration`: in-cluster (service-account mount, namespace
    /// read from [`SERVICE_NAMESPACE_FILENAME`] unless overridden) or a
    /// kubeconfig file.
    async fn configuration(&self) -> anyhow::Result<Config> {
        if self.config.in_cluster {
            let namespace = match &self.config.namespace {
                Some(namespace) => namespace.clone(),
                None => read_incluster_namespace()?,
            };
            let mut config = Config::incluster()
                .context("loading in-cluster configuration from the service account mount")?;
            config.default_namespace = namespace;
            Ok(config)
        } else {
            let path = self
                .config
                .kubeconfig
                .clone()
                .map(std::path::PathBuf::from)
                .unwrap_or_else(default_kubeconfig_path);
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("reading kubeconfig at {}", path.display()))?;
            let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("resolving kubeconfig context")?;
            if let Some(namespace) = &self.config.namespace {
                config.default_namespace = namespace.clone();
            }
            Ok(config)
        }
    }

    /// Lists running pods labelled for this connector's release and, for
    /// each one carrying a container named `service`, registers a resource
    /// `"<pod>:<service>"` with its pod IP.
    ///
    /// Grounded in `get_available_resources`.
    pub async fn get_available_resources(&self, service: &str) -> anyhow::Result<ResourceMap> {
        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client, self.namespace());
        let params = ListParams::default()
            .labels(&format!(
                "app.kubernetes.io/instance={}",
                self.config.release_name
            ))
            .fields("status.phase=Running");
        let list = pods.list(&params).await.context("listing namespaced pods")?;

        let mut resources = ResourceMap::new();
        for pod in list.items {
            let Some(spec) = &pod.spec else { continue };
            let Some(name) = pod.metadata.name.clone() else { continue };
            let has_container = spec.containers.iter().any(|container| container.name == service);
            if !has_container {
                continue;
            }
            let resource_name = format!("{name}:{service}");
            let hostname = pod.status.as_ref().and_then(|status| status.pod_ip.clone());
            let location = match hostname {
                Some(hostname) => Location::with_hostname(resource_name.clone(), hostname),
                None => Location::new(resource_name.clone()),
            };
            resources.insert(resource_name, location);
        }
        Ok(resources)
    }

    async fn pods(&self) -> anyhow::Result<Api<Pod>> {
        let client = self.client().await?;
        Ok(Api::namespaced(client, self.namespace()))
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: bool,
    ) -> anyhow::Result<AttachedProcess> {
        let pods = self.pods().await?;
        let params = AttachParams::default()
            .container(container)
            .stdin(stdin)
            .stdout(true)
            .stderr(true);
        pods.exec(pod, command, &params)
            .await
            .with_context(|| format!("pod exec on {pod}:{container} failed"))
    }

    /// Builds, uploads, and marks executable a per-invocation helper script
    /// that exports `environment`, `cd`s into `workdir`, and forwards its
    /// base64-encoded argument to `sh -c`.
    ///
    /// Grounded in `_build_helper_file`; the upload itself reuses
    /// [`Connector::copy`] with [`ConnectorCopyKind::LocalToRemote`], exactly
    /// as the Python source reuses `_copy_local_to_remote`.
    async fn build_helper_file(
        &self,
        pod: &str,
        container: &str,
        environment: &BTreeMap<String, String>,
        workdir: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut contents = String::from("#!/bin/sh\n");
        for (key, value) in environment {
            let _ = writeln!(contents, "export {key}=\"{value}\"");
        }
        if let Some(workdir) = workdir {
            let _ = writeln!(contents, "cd {workdir}");
        }
        contents.push_str("sh -c \"$(echo $@ | base64 --decode)\"\n");

        let file = tempfile::NamedTempFile::new().context("creating helper script temp file")?;
        tokio::fs::write(file.path(), &contents)
            .await
            .context("writing helper script")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mut permissions = tokio::fs::metadata(file.path())
                .await
                .context("reading helper script metadata")?
                .permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            tokio::fs::set_permissions(file.path(), permissions)
                .await
                .context("marking helper script executable")?;
        }

        let remote_path = file
            .path()
            .to_str()
            .ok_or_else(|| anyhow!("helper script temp path is not valid UTF-8"))?
            .to_string();
        let parent = Path::new(&remote_path)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        let mut mkdir = self
            .exec(pod, container, vec!["mkdir".to_string(), "-p".to_string(), parent], false)
            .await?;
        mkdir.join().await.context("creating helper script directory on pod")?;

        let location = Location::new(format!("{pod}:{container}"));
        self.copy(
            &remote_path,
            &remote_path,
            std::slice::from_ref(&location),
            ConnectorCopyKind::LocalToRemote,
            None,
            None,
        )
        .await
        .context("uploading helper script")?;

        Ok(remote_path)
    }
}

fn default_kubeconfig_path() -> std::path::PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    std::path::Path::new(&home).join(".kube").join("config")
}

fn read_incluster_namespace() -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(SERVICE_NAMESPACE_FILENAME)
        .with_context(|| format!("reading {SERVICE_NAMESPACE_FILENAME}"))?;
    let namespace = contents.trim();
    if namespace.is_empty() {
        return Err(
            StreamFlowError::Config("namespace file exists but is empty".to_string()).into(),
        );
    }
    Ok(namespace.to_string())
}

fn split_resource(name: &str) -> anyhow::Result<(String, String)> {
    let (pod, container) = name
        .split_once(':')
        .ok_or_else(|| anyhow!("resource identifier `{name}` is not `<pod>:<container>`"))?;
    Ok((pod.to_string(), container.to_string()))
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dirname(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => "/".to_string(),
    }
}

fn relpath_from_root(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[async_trait]
impl Connector for KubernetesConnector {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn run(
        &self,
        location: &Location,
        command: &[String],
        options: RunOptions,
    ) -> anyhow::Result<Option<CapturedOutput>> {
        let (pod, container) = split_resource(&location.name)?;
        let assembled = create_command(&CommandOptions {
            command: command.to_vec(),
            environment: IndexMap::new(),
            workdir: None,
            stdin: options.stdin.clone(),
            stdout: options.stdout.clone(),
            stderr: options.stderr.clone(),
        });
        debug!(
            location = %location,
            job = options.job_name.as_deref().unwrap_or(""),
            "executing pod command {assembled}"
        );

        let environment: BTreeMap<String, String> = options.env.into_iter().collect();
        let helper_path = self
            .build_helper_file(&pod, &container, &environment, options.workdir.as_deref())
            .await?;

        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(assembled.as_bytes());

        let mut process = self
            .exec(&pod, &container, vec![helper_path, encoded], false)
            .await?;

        let mut stdout_reader = process.stdout();
        let status_future = process.take_status();
        let read_and_wait_status = async move {
            let mut stdout_text = String::new();
            if let Some(mut reader) = stdout_reader.take() {
                let _ = reader.read_to_string(&mut stdout_text).await;
            }
            let status = match status_future {
                Some(future) => future.await,
                None => None,
            };
            (stdout_text, status)
        };

        let (stdout_text, status) = match options.timeout {
            Some(duration) => tokio::time::timeout(duration, read_and_wait_status)
                .await
                .map_err(|_| StreamFlowError::Timeout(duration))?,
            None => read_and_wait_status.await,
        };
        process.join().await.context("pod exec session failed")?;

        let exit_code = match &status {
            Some(status) if status.status.as_deref() == Some("Success") => 0,
            Some(status) => status
                .details
                .as_ref()
                .and_then(|details| details.causes.as_ref())
                .and_then(|causes| causes.first())
                .and_then(|cause| cause.message.as_deref())
                .and_then(|message| message.parse::<i32>().ok())
                .unwrap_or(-1),
            None => 0,
        };

        if options.capture_output {
            Ok(Some(CapturedOutput {
                stdout: stdout_text.trim().to_string(),
                exit_code,
            }))
        } else {
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
                    info!(src, dst, locations = locations.len(), "copying local to pod locations");
                } else {
                    info!(src, dst, location = %locations[0], "copying local to pod location");
                }
                try_join_all(
                    locations
                        .iter()
                        .map(|location| self.copy_local_to_remote(src, dst, location)),
                )
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
                info!(src, dst, location = %locations[0], "copying pod location to local");
                self.copy_remote_to_local(src, dst, &locations[0]).await
            }
            ConnectorCopyKind::RemoteToRemote => {
                let source_location = source_location.ok_or_else(|| {
                    StreamFlowError::WorkflowExecution(
                        "source location is mandatory for remote to remote copy".to_string(),
                    )
                })?;
                self.copy_remote_to_remote(src, dst, locations, source_connector, source_location)
                    .await
            }
        }
    }
}

impl KubernetesConnector {
    async fn copy_local_to_remote(&self, src: &str, dst: &str, location: &Location) -> anyhow::Result<()> {
        let (pod, container) = split_resource(&location.name)?;
        let mut process = self
            .exec(
                &pod,
                &container,
                vec!["tar".to_string(), "xf".to_string(), "-".to_string(), "-C".to_string(), "/".to_string()],
                true,
            )
            .await?;
        let mut stdin = process
            .stdin()
            .ok_or_else(|| anyhow!("pod exec did not provide a stdin channel"))?;

        let archive_result = archive_into(&mut stdin, src, dst).await;
        let _ = stdin.shutdown().await;
        drop(stdin);

        process.join().await.context("tar extraction failed on pod")?;
        archive_result.map_err(|error| {
            anyhow::Error::new(StreamFlowError::WorkflowExecution(format!(
                "error copying {src} to {dst} on location {location}: {error}"
            )))
        })
    }

    async fn copy_remote_to_local(&self, src: &str, dst: &str, location: &Location) -> anyhow::Result<()> {
        let (pod, container) = split_resource(&location.name)?;
        let command = vec![
            "tar".to_string(),
            "chf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            "/".to_string(),
            relpath_from_root(src),
        ];
        let mut process = self.exec(&pod, &container, command, false).await?;
        let stdout = process
            .stdout()
            .ok_or_else(|| anyhow!("pod exec did not provide a stdout channel"))?;

        let archive = tokio_tar::Archive::new(stdout);
        let result = extract_tar_stream(archive, src, dst).await;
        process.join().await.context("tar creation failed on pod")?;

        result.map_err(|error| {
            anyhow::Error::new(StreamFlowError::WorkflowExecution(format!(
                "error copying {src} from location {location} to {dst}: {error}"
            )))
        })
    }

    async fn copy_remote_to_remote(
        &self,
        src: &str,
        dst: &str,
        locations: &[Location],
        source_connector: Option<&(dyn Connector + 'static)>,
        source_location: &Location,
    ) -> anyhow::Result<()> {
        let mut remaining: Vec<Location> = locations.to_vec();

        if source_connector.is_none() {
            if let Some(position) = remaining.iter().position(|location| location == source_location) {
                if src != dst {
                    self.run(
                        source_location,
                        &[
                            "/bin/cp".to_string(),
                            "-rf".to_string(),
                            src.to_string(),
                            dst.to_string(),
                        ],
                        RunOptions::default(),
                    )
                    .await?;
                }
                remaining.remove(position);
            }
        }

        if remaining.is_empty() {
            return Ok(());
        }

        // No source connector was supplied beyond `self`: source and
        // destination resources differ but live on the same cluster, so a
        // local temp directory stages the copy (source's basename is
        // preserved as the staging directory's sole entry).
        let effective_source = source_connector.unwrap_or(self as &dyn Connector);
        let staging = tempfile::tempdir().context("creating a local staging directory")?;
        let staged_path = staging.path().join(basename(src));
        let staged_str = staged_path
            .to_str()
            .ok_or_else(|| anyhow!("staging path is not valid UTF-8"))?
            .to_string();

        effective_source
            .copy(
                src,
                staging.path().to_str().unwrap_or_default(),
                std::slice::from_ref(source_location),
                ConnectorCopyKind::RemoteToLocal,
                None,
                None,
            )
            .await
            .context("staging remote-to-remote copy through the local filesystem")?;

        try_join_all(remaining.iter().map(|location| {
            self.copy(
                &staged_str,
                dst,
                std::slice::from_ref(location),
                ConnectorCopyKind::LocalToRemote,
                None,
                None,
            )
        }))
        .await?;
        Ok(())
    }
}

async fn archive_into<W>(stdin: &mut W, src: &str, dst: &str) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let arcname = relpath_from_root(dst);
    let metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed to read metadata for {src}"))?;

    let mut builder = tokio_tar::Builder::new(stdin);
    builder.follow_symlinks(true);
    if metadata.is_dir() {
        builder
            .append_dir_all(&arcname, src)
            .await
            .context("failed to archive directory tree")?;
    } else {
        builder
            .append_path_with_name(src, &arcname)
            .await
            .context("failed to archive file")?;
    }
    builder.finish().await.context("failed to finish tar archive")?;
    Ok(())
}

async fn extract_tar_stream<R>(mut archive: tokio_tar::Archive<R>, src: &str, dst: &str) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let dst_path = Path::new(dst);
    let src_path = Path::new("/").join(src.trim_start_matches('/'));

    let mut entries = archive.entries().context("failed to read tar stream")?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("failed to read tar entry")?;
        let member_path = entry.path().context("invalid tar entry path")?.into_owned();
        let rooted = Path::new("/").join(&member_path);

        let dst_is_dir = tokio::fs::metadata(dst_path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);

        if dst_is_dir {
            let target = if rooted == src_path {
                dst_path.join(member_path.file_name().unwrap_or(member_path.as_os_str()))
            } else if let Ok(relative) = rooted.strip_prefix(&src_path) {
                dst_path.join(relative)
            } else {
                dst_path.join(member_path.file_name().unwrap_or(member_path.as_os_str()))
            };
            entry
                .unpack(&target)
                .await
                .with_context(|| format!("failed to unpack {}", target.display()))?;
        } else if entry.header().entry_type().is_file() {
            let mut out = tokio::fs::File::create(dst_path)
                .await
                .with_context(|| format!("failed to create {dst}"))?;
            tokio::io::copy(&mut entry, &mut out)
                .await
                .with_context(|| format!("failed to write {dst}"))?;
        } else {
            let parent = dst_path.parent().unwrap_or_else(|| Path::new("/"));
            let target = parent.join(member_path.file_name().unwrap_or(member_path.as_os_str()));
            entry
                .unpack(&target)
                .await
                .with_context(|| format!("failed to unpack {}", target.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn split_resource_parses_pod_and_container() {
        let (pod, container) = split_resource("worker-0:main").unwrap();
        assert_eq!(pod, "worker-0");
        assert_eq!(container, "main");
    }

    #[test]
    fn split_resource_rejects_missing_separator() {
        assert!(split_resource("worker-0").is_err());
    }

    #[test]
    fn basename_and_dirname_match_posixpath_semantics() {
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(dirname("/a/b/c.txt"), "/a/b");
        assert_eq!(dirname("c.txt"), "/");
    }

    #[test]
    fn relpath_from_root_strips_leading_slash() {
        assert_eq!(relpath_from_root("/a/b"), "a/b");
        assert_eq!(relpath_from_root("a/b"), "a/b");
    }
}
