//! The streaming tar-over-pipe data transfer engine backing
//! [`crate::base::BaseConnector::copy`].
//!
//! Grounded in `streamflow/deployment/connector/base.py`'s
//! `_copy_local_to_remote`, `_copy_remote_to_local`, `_copy_remote_to_remote`
//! and `extract_tar_stream`, plus `streamflow/core/utils.py`'s
//! `get_remote_to_remote_write_command`.

use std::path::Path;
use std::process::Stdio as ProcessStdio;

use anyhow::anyhow;
use anyhow::Context as _;
use futures::future::try_join_all;
use futures::StreamExt as _;
use streamflow_core::connector::CapturedOutput;
use streamflow_core::connector::Connector;
use streamflow_core::connector::Location;
use streamflow_core::connector::RunOptions;
use streamflow_core::error::StreamFlowError;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWriteExt as _;

use crate::base::BaseConnector;

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

/// `posixpath.relpath(path, "/")`: an absolute path with its leading slash
/// removed, the form GNU tar expects relative to the `-C /` extraction
/// root.
fn relpath_from_root(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Archives `src` (file or directory tree) onto a location's `tar xf - -C /`
/// process, rewriting the archived name to `dst`.
pub(crate) async fn copy_local_to_remote_single(
    connector: &BaseConnector,
    src: &str,
    dst: &str,
    location: &Location,
) -> anyhow::Result<()> {
    let run_command = connector.get_run_command("tar xf - -C /", location, true);
    let mut child = connector.spawn(
        &run_command,
        ProcessStdio::piped(),
        ProcessStdio::null(),
        ProcessStdio::null(),
    )?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("child stdin was not piped"))?;

    let archive_result = archive_into(&mut stdin, src, dst).await;
    let _ = stdin.shutdown().await;
    drop(stdin);

    let status = child
        .wait()
        .await
        .context("failed to wait for the tar extraction process")?;

    archive_result.map_err(|error| {
        anyhow::Error::new(StreamFlowError::WorkflowExecution(format!(
            "error copying {src} to {dst} on location {location}: {error}"
        )))
    })?;

    if !status.success() {
        return Err(StreamFlowError::Connector {
            stdout: None,
            exit_code: status.code().unwrap_or(-1),
        }
        .into());
    }
    Ok(())
}

async fn archive_into(
    stdin: &mut tokio::process::ChildStdin,
    src: &str,
    dst: &str,
) -> anyhow::Result<()> {
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

/// Spawns `tar chf - -C / <relpath(src, "/")>` at `location`, streams its
/// stdout as a tar archive, and extracts it into `dst` under the rewrite
/// rules of [`extract_tar_stream`].
pub(crate) async fn copy_remote_to_local(
    connector: &BaseConnector,
    src: &str,
    dst: &str,
    location: &Location,
) -> anyhow::Result<()> {
    let command = format!("tar chf - -C / {}", relpath_from_root(src));
    let run_command = connector.get_run_command(&command, location, false);
    let mut child = connector.spawn(
        &run_command,
        ProcessStdio::null(),
        ProcessStdio::piped(),
        ProcessStdio::piped(),
    )?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout was not piped"))?;

    let archive = tokio_tar::Archive::new(stdout);
    let result = extract_tar_stream(archive, src, dst).await;

    child
        .wait()
        .await
        .context("failed to wait for the tar creation process")?;

    result.map_err(|error| {
        anyhow::Error::new(StreamFlowError::WorkflowExecution(format!(
            "error copying {src} from location {location} to {dst}: {error}"
        )))
    })
}

/// Extracts a tar stream into `dst`, rewriting archived paths:
///
/// - If `dst` is a directory: the entry whose rooted path equals `src`
///   (the root of the archived tree) is written at its basename under
///   `dst`; every other entry is written at its path relative to `src`
///   under `dst`.
/// - If `dst` is not a directory and the entry is a regular file, its
///   content is written directly to `dst`.
/// - Otherwise (a special file with `dst` not a directory), the entry is
///   extracted into `dst`'s parent directory under its basename.
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

/// Dispatches the write-side tar command for a remote-to-remote copy.
///
/// Probes whether `src` is a directory (via `test -d`) only when the last
/// path components of `src` and `dst` differ; otherwise both sides already
/// agree on the final name and a plain `-C <dirname(dst)>` extraction
/// suffices.
async fn remote_to_remote_write_command(
    src_connector: &dyn Connector,
    src_location: &Location,
    src: &str,
    dst_connector: &BaseConnector,
    dst_locations: &[Location],
    dst: &str,
) -> anyhow::Result<Vec<String>> {
    if basename(src) == basename(dst) {
        return Ok(vec![
            "tar".to_string(),
            "xf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            dirname(dst),
        ]);
    }

    let probe = src_connector
        .run(
            src_location,
            &[format!("test -d \"{src}\"")],
            RunOptions {
                capture_output: true,
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| anyhow!("expected captured output from `test -d` probe"))?;

    match probe.exit_code {
        status if status > 1 => Err(StreamFlowError::WorkflowExecution(probe.stdout).into()),
        0 => {
            try_join_all(dst_locations.iter().map(|location| {
                dst_connector.run(
                    location,
                    &["mkdir".to_string(), "-p".to_string(), dst.to_string()],
                    RunOptions::default(),
                )
            }))
            .await?;
            Ok(vec![
                "tar".to_string(),
                "xf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                dst.to_string(),
                "--strip-components".to_string(),
                "1".to_string(),
            ])
        }
        _ => Ok(vec![
            "tar".to_string(),
            "xf".to_string(),
            "-".to_string(),
            "-O".to_string(),
            ">".to_string(),
            dst.to_string(),
        ]),
    }
}

/// Opens a source stream reader (`tar chf - -C <dirname(src)> <basename(src)>`),
/// multiplexing its output to one writer process per destination location.
///
/// When the source location is also among `locations` and `src != dst`, a
/// plain in-place `/bin/cp -rf` replaces the streamed copy for that
/// location and it is removed from the fan-out set.
pub(crate) async fn copy_remote_to_remote(
    connector: &BaseConnector,
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
                connector
                    .run(
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

    let effective_source: &dyn Connector = source_connector.unwrap_or(connector);
    let source_base = effective_source
        .as_any()
        .downcast_ref::<BaseConnector>()
        .ok_or_else(|| {
            anyhow!("remote to remote copy requires a BaseConnector-derived source connector")
        })?;

    let write_command = remote_to_remote_write_command(
        effective_source,
        source_location,
        src,
        connector,
        &remaining,
        dst,
    )
    .await?
    .join(" ");

    let read_command = format!("tar chf - -C {} {}", dirname(src), basename(src));
    let reader_run_command = source_base.get_run_command(&read_command, source_location, false);
    let mut reader = source_base.spawn(
        &reader_run_command,
        ProcessStdio::null(),
        ProcessStdio::piped(),
        ProcessStdio::piped(),
    )?;
    let mut reader_stdout = reader
        .stdout
        .take()
        .ok_or_else(|| anyhow!("reader stdout was not piped"))?;

    let mut writers = Vec::with_capacity(remaining.len());
    for location in &remaining {
        let run_command = connector.get_run_command(&write_command, location, true);
        writers.push(connector.spawn(
            &run_command,
            ProcessStdio::piped(),
            ProcessStdio::null(),
            ProcessStdio::null(),
        )?);
    }
    let mut writer_stdins: Vec<_> = writers
        .iter_mut()
        .map(|writer| writer.stdin.take().expect("writer stdin was piped"))
        .collect();

    let mut buffer = vec![0u8; connector.transfer_buffer_size()];
    let multiplex_result: anyhow::Result<()> = async {
        loop {
            let read = reader_stdout.read(&mut buffer).await.context("failed to read from source")?;
            if read == 0 {
                break;
            }
            try_join_all(writer_stdins.iter_mut().map(|writer| writer.write_all(&buffer[..read])))
                .await
                .context("failed to fan out to a destination writer")?;
        }
        Ok(())
    }
    .await;

    for writer in &mut writer_stdins {
        let _ = writer.shutdown().await;
    }
    drop(writer_stdins);

    for mut writer in writers {
        writer.wait().await.context("failed to wait for a destination writer")?;
    }
    reader.wait().await.context("failed to wait for the source reader")?;

    multiplex_result
}
