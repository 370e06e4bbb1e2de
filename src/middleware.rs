//! Request orchestration: channel staging, manifest assembly, executor
//! dispatch, and response construction (spec §4.3-§4.6, §4.8-§4.9).
//!
//! No direct teacher analog as a single module; this is where the leaf
//! components (`pool`, `sysmap`, `tar_stream`, `executor`, `report`,
//! `finalize`, `objecthandle`) are wired together, the way the teacher's
//! `src/runtime_service.rs` wires `Pod`/`Container`/`sandbox` together
//! behind the CRI surface. The first admission check (on raw request
//! arrival, before tar ingest) and HTTP-header parsing are the caller's
//! responsibility (`crate::http`, not this module) — this module begins
//! after the inbound tar has already been streamed to `scratch_dir`.

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::executor::{daemon_client::run_via_daemon, oneshot::run_oneshot};
use crate::finalize::finalize_writable_channel;
use crate::manifest::{ChannelLine, Manifest};
use crate::objecthandle::ObjectHandle;
use crate::pool::PoolRegistry;
use crate::report::{evaluate, ReportDecision, ReportFields};
use crate::sysmap::{Access, SystemMap};
use crate::tar_stream::{IngestedMember, OutboundMember};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the caller has already gathered about one execute request by
/// the time staging begins: the already-untarred members, the parsed
/// selectors from HTTP headers, and where to put scratch files.
pub struct ExecuteRequest {
    pub pool_name: String,
    pub target_url: Option<String>,
    pub timestamp: Option<String>,
    pub pre_validated: bool,
    pub daemon_socket_name: Option<String>,
    pub job_id: Option<String>,
    pub node_id: Option<String>,
    pub members: Vec<IngestedMember>,
    pub scratch_dir: PathBuf,
}

/// What the HTTP layer needs to build the final response.
pub struct ExecuteResponse {
    pub headers: ReportFields,
    pub tar_members: Vec<OutboundMember>,
    pub daemon_socket_name: Option<String>,
}

/// Splits ingested members into the parsed `SystemMap` and a lookup of
/// staged file members by name (spec §4.2: `sysmap` is never materialized
/// as a channel file).
fn split_members(
    members: Vec<IngestedMember>,
) -> Result<(SystemMap, HashMap<String, (PathBuf, u64)>)> {
    let mut sysmap_bytes = None;
    let mut files = HashMap::new();
    for member in members {
        match member {
            IngestedMember::Sysmap(bytes) => sysmap_bytes = Some(bytes),
            IngestedMember::File { name, path, size } => {
                files.insert(name, (path, size));
            }
        }
    }
    let sysmap_bytes =
        sysmap_bytes.ok_or_else(|| NodeError::BadRequest("request tar has no sysmap member".to_string()))?;
    let sysmap = SystemMap::from_json(&sysmap_bytes)
        .map_err(|e| NodeError::BadRequest(format!("malformed sysmap: {}", e)))?;
    Ok((sysmap, files))
}

/// Locates the sandbox binary (spec §4.3's "boot" resolution order): an
/// inbound tar member named `boot`, else a tar member or system-image
/// device named after the image component of `exe`.
fn resolve_boot_binary(
    sysmap: &SystemMap,
    files: &HashMap<String, (PathBuf, u64)>,
    sysimage_devices: &HashMap<String, PathBuf>,
) -> Result<PathBuf> {
    if let Some((path, _)) = files.get("boot") {
        return Ok(path.clone());
    }
    if let Some(image) = sysmap.exe_image() {
        if let Some((path, _)) = files.get(image) {
            return Ok(path.clone());
        }
        if let Some(path) = sysimage_devices.get(image) {
            return Ok(path.clone());
        }
    }
    Err(NodeError::BadRequest(
        "no sandbox binary found in request, exe image, or system image".to_string(),
    ))
}

struct StagedChannels {
    lines: Vec<ChannelLine>,
    /// Index into `sysmap.channels()` of the WRITABLE channel matching
    /// `target_url`, if any.
    local_object: Option<usize>,
    /// Indices, in response order, of channels to stream back in the tar.
    response_order: Vec<usize>,
}

/// Applies spec §4.3's per-channel staging rules, mutating each channel's
/// derived fields (`lpath`/`size`/`meta`) in place and building the
/// manifest's channel lines plus the response-channel ordering.
async fn stage_channels(
    objects: &dyn ObjectHandle,
    sysmap: &mut SystemMap,
    files: &mut HashMap<String, (PathBuf, u64)>,
    sysimage_devices: &HashMap<String, PathBuf>,
    target_url: Option<&str>,
    timestamp: Option<&str>,
    scratch_dir: &PathBuf,
    max_iops: u64,
    max_input: u64,
    max_output: u64,
) -> Result<StagedChannels> {
    let mut lines = Vec::new();
    let mut local_object = None;
    let mut response_order = Vec::new();
    let mut pure_response = Vec::new();

    for idx in 0..sysmap.channels().len() {
        let device = sysmap.channels()[idx].device().to_string();
        let access = sysmap.channels()[idx].access();
        let path = sysmap.channels()[idx].path().to_string();

        let lpath = if let Some((member_path, size)) = files.remove(&device) {
            sysmap.channels_mut()[idx].set_size(size);
            member_path
        } else if target_url.is_some() && !path.is_empty() && Some(path.as_str()) == target_url {
            if access.contains(Access::WRITABLE) {
                let timestamp = timestamp.ok_or_else(|| {
                    NodeError::BadRequest("x-timestamp required for writable target object".to_string())
                })?;
                if timestamp.parse::<f64>().is_err() {
                    return Err(NodeError::BadRequest(format!(
                        "x-timestamp {:?} is not numeric",
                        timestamp
                    )));
                }
                let dest = scratch_dir.join(format!("channel-{}", device));
                preallocate(&dest, max_output).await?;
                local_object = Some(idx);
                dest
            } else {
                let dest = scratch_dir.join(format!("channel-{}", device));
                let meta = objects
                    .open(&path, &dest)
                    .await
                    .map_err(NodeError::internal)?;
                sysmap.channels_mut()[idx].set_size(meta.size());
                sysmap.channels_mut()[idx].set_meta(meta.meta().clone());
                dest
            }
        } else if let Some(image_path) = sysimage_devices.get(&device) {
            image_path.clone()
        } else if access.contains(Access::READABLE) || access.contains(Access::CDR) {
            return Err(NodeError::BadRequest(format!(
                "channel {:?} has no staged content",
                device
            )));
        } else if access.contains(Access::WRITABLE) && path.is_empty() {
            let dest = scratch_dir.join(format!("channel-{}", device));
            preallocate(&dest, max_output).await?;
            pure_response.push(idx);
            dest
        } else if access.contains(Access::NETWORK) {
            PathBuf::from(path)
        } else {
            return Err(NodeError::BadRequest(format!(
                "channel {:?} is neither staged, a system image, nor network",
                device
            )));
        };

        sysmap.channels_mut()[idx].set_lpath(Some(lpath.clone()));
        lines.push(ChannelLine::for_channel(
            &sysmap.channels()[idx],
            lpath,
            max_iops,
            max_input,
            max_output,
        ));
    }

    // The local-object channel (identity-matched to the request's
    // `target_url`) is committed to the object store by
    // `finalize_writable_channel`/`ObjectHandle::create_with_metadata`, not
    // re-streamed in the tar response -- it never joins `response_order`.
    response_order.extend(pure_response);

    Ok(StagedChannels {
        lines,
        local_object,
        response_order,
    })
}

async fn preallocate(path: &PathBuf, size: u64) -> Result<()> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(NodeError::internal)?;
    file.set_len(size).await.map_err(NodeError::internal)?;
    Ok(())
}

/// Runs one execute request to completion: stages channels, builds the
/// manifest, invokes the sandbox (one-shot or via a resident daemon),
/// interprets the report, and — for a committed writable local object —
/// publishes it. The scratch directory itself is the caller's to remove on
/// every exit path (testable property 1); this function never touches it
/// beyond writing staged files into it.
#[allow(clippy::too_many_arguments)]
pub async fn execute_request(
    objects: &dyn ObjectHandle,
    pools: &PoolRegistry,
    config: &Config,
    daemon_nexe: Option<&PathBuf>,
    req: ExecuteRequest,
) -> Result<ExecuteResponse> {
    let (mut sysmap, mut files) = split_members(req.members)?;
    let sysimage_devices = config.sysimage_devices().map_err(NodeError::internal)?;
    let exe_path = resolve_boot_binary(&sysmap, &files, &sysimage_devices)?;

    let staged = stage_channels(
        objects,
        &mut sysmap,
        &mut files,
        &sysimage_devices,
        req.target_url.as_deref(),
        req.timestamp.as_deref(),
        &req.scratch_dir,
        config.zerovm_maxiops(),
        config.zerovm_maxinput(),
        config.zerovm_maxoutput(),
    )
    .await?;

    // Second admission check (spec §4.4): the saturating window during
    // ingest may have grown since the caller's first check.
    let _permit = pools.admit(&req.pool_name).await?;

    let manifest = Manifest {
        version: config.zerovm_manifest_ver().to_string(),
        program: exe_path.clone(),
        timeout: config.zerovm_timeout(),
        memory: config.zerovm_maxnexemem(),
        channels: staged.lines,
        job: req.job_id.clone(),
        node: req.node_id.clone(),
        name_server: None,
    };
    let manifest_text = manifest.render();
    let manifest_path = req.scratch_dir.join("manifest");
    tokio::fs::write(&manifest_path, &manifest_text)
        .await
        .map_err(NodeError::internal)?;

    let timeout = Duration::from_secs(config.zerovm_timeout() + 1);
    let kill_timeout = Duration::from_secs(config.zerovm_kill_timeout());
    let max_stdout = config.max_stdout_bytes();
    let max_stderr = config.max_stderr_bytes();

    let outcome = match &req.daemon_socket_name {
        Some(name) => {
            let socket_path = config.sockets_dir().join(name);
            let daemon_nexe = daemon_nexe.ok_or_else(|| {
                NodeError::internal("daemon path requested but no daemon nexe configured")
            })?;
            run_via_daemon(
                &socket_path,
                manifest_text.as_bytes(),
                &manifest,
                daemon_nexe,
                kill_timeout,
                max_stdout,
                max_stderr,
                timeout,
                max_stdout,
            )
            .await
            .map_err(NodeError::internal)?
        }
        None => run_oneshot(
            &exe_path,
            &manifest_path,
            req.pre_validated,
            timeout,
            kill_timeout,
            max_stdout,
            max_stderr,
            None,
        )
        .await
        .map_err(NodeError::internal)?,
    };

    let mut fields = match evaluate(&outcome) {
        ReportDecision::Success(fields) => fields,
        ReportDecision::ExecutionError {
            stdout,
            status,
            retcode,
        } => {
            return Err(NodeError::ExecutionError {
                stdout,
                status,
                retcode,
            })
        }
    };

    if let Some(idx) = staged.local_object {
        let channel = &sysmap.channels()[idx];
        let target_url = req
            .target_url
            .as_deref()
            .expect("local_object staging implies target_url");
        let timestamp = req
            .timestamp
            .as_deref()
            .expect("local_object staging implies timestamp");
        let etag = finalize_writable_channel(objects, channel, &fields.etag, timestamp, target_url).await?;
        fields.etag = etag;
    }

    let any_cgi = staged
        .response_order
        .iter()
        .any(|&idx| sysmap.channels()[idx].is_cgi());

    let mut tar_members = Vec::new();
    if any_cgi {
        let regenerated = sysmap
            .to_json()
            .map_err(|e| NodeError::internal(format!("re-serializing sysmap: {}", e)))?;
        tar_members.push(OutboundMember::Sysmap(regenerated));
    }
    for idx in &staged.response_order {
        let channel = &sysmap.channels()[*idx];
        let lpath = channel
            .lpath()
            .clone()
            .expect("response channel was staged with an lpath");
        let size = tokio::fs::metadata(&lpath)
            .await
            .map_err(NodeError::internal)?
            .len();
        tar_members.push(OutboundMember::File {
            name: channel.device().to_string(),
            path: lpath,
            size,
        });
    }

    Ok(ExecuteResponse {
        headers: fields,
        tar_members,
        daemon_socket_name: req.daemon_socket_name,
    })
}
