//! The HTTP surface (spec §6): a hand-rolled `hyper` 1.x service exposing
//! the execute, validate, and pre-validation-check endpoints. No routing
//! framework — manual method/header dispatch is all three routes need,
//! matching the hand-rolled shape `src/tar_stream.rs` and `src/codec.rs`
//! already use elsewhere in this crate rather than reaching for a crate
//! like `axum`/`tower`.
//!
//! Not present in the teacher (which serves gRPC via `tonic`); the
//! listener-bind/per-connection-spawn shape instead follows
//! `examples/DataDog-libdatadog/datadog-remote-config/src/fetch/test_server.rs`'s
//! `hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(..), service)`
//! loop, the one pack precedent pinned to the same hyper 1.x this crate
//! depends on.

use crate::config::Config;
use crate::error::NodeError;
use crate::middleware::{execute_request, ExecuteRequest};
use crate::objecthandle::ObjectHandle;
use crate::pool::PoolRegistry;
use crate::tar_stream::{tar_to_vec, untar_to_scratch, IngestLimits};
use crate::validate::{is_validated, validate_stored_object};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;

/// Everything a request handler needs: configuration, the admission pools,
/// and the object store backing `ObjectHandle`. Shared across connections
/// behind an `Arc`, the way the daemon shares its `DaemonContext`.
pub struct AppState {
    pub config: Config,
    pub pools: PoolRegistry,
    pub objects: Arc<dyn ObjectHandle>,
    pub daemon_nexe: Option<PathBuf>,
}

/// The listener: binds once, then spawns one `http1` connection task per
/// accepted stream, mirroring `daemon::Daemon::start`'s accept loop.
pub struct HttpServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

/// A listener that has already bound its socket, split out from
/// [`HttpServer`] so callers (and tests) can learn the real address before
/// the accept loop starts -- necessary when `addr`'s port is `0`.
pub struct BoundHttpServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    pub async fn bind(self) -> Result<BoundHttpServer> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("bind http listener {}", self.addr))?;
        Ok(BoundHttpServer {
            listener,
            state: self.state,
        })
    }

    pub async fn serve(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

impl BoundHttpServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> Result<()> {
        info!("zerovm-node listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("accept http connection")?;
            let io = TokioIo::new(stream);
            let state = self.state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, state.clone()));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    warn!("connection from {} closed with error: {}", peer, e);
                }
            });
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    Ok(route(req, &state).await.unwrap_or_else(error_response))
}

/// The device/partition/account[/container/object] path this platform
/// addresses objects with (spec §6). Only the container/object suffix,
/// when present, maps to an `ObjectHandle` URL; `device`/`partition` only
/// matter to the upstream proxy that built this request, not to execution.
struct RequestPath {
    target_url: Option<String>,
}

fn parse_path(path: &str) -> Result<RequestPath, NodeError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return Err(NodeError::BadRequest(format!(
            "path {:?} is missing device/partition/account",
            path
        )));
    }
    let target_url = if segments.len() >= 5 {
        Some(format!(
            "swift://{}/{}/{}",
            segments[2], segments[3], segments[4]
        ))
    } else {
        None
    };
    Ok(RequestPath { target_url })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn route(
    req: Request<Incoming>,
    state: &AppState,
) -> std::result::Result<Response<Full<Bytes>>, NodeError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();

    let wants_execute = header_str(&headers, "x-zerovm-execute") == Some("1");
    let wants_validate = headers.contains_key("x-zerovm-validate")
        || header_str(&headers, "content-type") == Some("application/x-nexe");
    let wants_precheck = headers.contains_key("x-zerovm-valid") && method == Method::GET;

    if wants_precheck {
        return precheck(&path, state).await;
    }
    if (method == Method::POST || method == Method::PUT) && wants_validate {
        return validate(&path, state).await;
    }
    if method == Method::POST && wants_execute {
        return execute(req, &path, &headers, state).await;
    }

    Err(NodeError::BadRequest(format!(
        "no route for {} {}",
        method, path
    )))
}

async fn precheck(path: &str, state: &AppState) -> std::result::Result<Response<Full<Bytes>>, NodeError> {
    let parsed = parse_path(path)?;
    let url = parsed
        .target_url
        .ok_or_else(|| NodeError::BadRequest("x-zerovm-valid check requires a container/object path".into()))?;

    let valid = is_validated(state.objects.as_ref(), &url).await?;

    let mut builder = Response::builder().status(StatusCode::OK);
    if valid {
        builder = builder.header("x-zerovm-valid", "true");
    }
    builder
        .body(Full::new(Bytes::new()))
        .map_err(|e| NodeError::internal(e))
}

async fn validate(path: &str, state: &AppState) -> std::result::Result<Response<Full<Bytes>>, NodeError> {
    let parsed = parse_path(path)?;
    let url = parsed
        .target_url
        .ok_or_else(|| NodeError::BadRequest("validate requires a container/object path".into()))?;

    tokio::fs::create_dir_all(state.config.scratch_root())
        .await
        .map_err(|e| NodeError::internal(e))?;
    let scratch = tempfile::Builder::new()
        .prefix("validate-")
        .tempfile_in(state.config.scratch_root())
        .map_err(|e| NodeError::internal(e))?;
    let exename = PathBuf::from(state.config.zerovm_exename());
    let ok = validate_stored_object(
        state.objects.as_ref(),
        &exename,
        scratch.path(),
        Duration::from_secs(state.config.zerovm_timeout()),
        Duration::from_secs(state.config.zerovm_kill_timeout()),
        state.config.max_stdout_bytes(),
        state.config.max_stderr_bytes(),
        &url,
    )
    .await?;

    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .map_err(|e| NodeError::internal(e))
}

async fn execute(
    req: Request<Incoming>,
    path: &str,
    headers: &HeaderMap,
    state: &AppState,
) -> std::result::Result<Response<Full<Bytes>>, NodeError> {
    let parsed = parse_path(path)?;
    let target_url = parsed.target_url;

    let pool_name = header_str(headers, "x-zerovm-pool")
        .unwrap_or(crate::config::DEFAULT_POOL)
        .to_string();
    let daemon_socket_name = header_str(headers, "x-zerovm-daemon").map(str::to_string);
    let timestamp = header_str(headers, "x-timestamp").map(str::to_string);
    let pre_validated = header_str(headers, "x-zerovm-valid") == Some("true");

    // First admission check (spec §4.4/§5): held only for the duration of
    // ingest, released before `execute_request` re-admits for the run
    // itself -- two independent gates, not one permit reused.
    let ingest_permit = state.pools.admit(&pool_name).await?;

    tokio::fs::create_dir_all(state.config.scratch_root())
        .await
        .map_err(|e| NodeError::internal(e))?;
    let scratch = tempfile::Builder::new()
        .prefix("exec-")
        .tempdir_in(state.config.scratch_root())
        .map_err(|e| NodeError::internal(e))?;
    let limits = IngestLimits {
        max_bytes: state.config.zerovm_maxinput(),
        max_upload_time: Duration::from_secs(state.config.max_upload_secs()),
    };
    let data_stream = req
        .into_body()
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut body_reader = StreamReader::new(data_stream);
    let members = untar_to_scratch(&mut body_reader, scratch.path(), &limits).await?;
    drop(ingest_permit);

    let exec_req = ExecuteRequest {
        pool_name,
        target_url,
        timestamp,
        pre_validated,
        daemon_socket_name,
        job_id: None,
        node_id: None,
        members,
        scratch_dir: scratch.path().to_path_buf(),
    };

    let response = execute_request(
        state.objects.as_ref(),
        &state.pools,
        &state.config,
        state.daemon_nexe.as_ref(),
        exec_req,
    )
    .await?;
    // `scratch` (a `TempDir`) is dropped at the end of this function,
    // unlinking the scratch dir, nvram, and any WRITABLE staged files
    // regardless of which branch below returns (spec §5).

    let tar_bytes = tar_to_vec(&response.tar_members).await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/x-gtar")
        .header(CONTENT_LENGTH, tar_bytes.len().to_string());
    for (name, value) in response.headers.headers() {
        builder = builder.header(name, value);
    }
    if let Some(name) = &response.daemon_socket_name {
        builder = builder.header("x-zerovm-daemon", name.as_str());
    }
    builder
        .body(Full::new(Bytes::from(tar_bytes)))
        .map_err(|e| NodeError::internal(e))
}

/// Maps any `NodeError` to its spec §7 status code plus the `x-nexe-*`
/// diagnostic headers callers are expected to read even on failure.
fn error_response(err: NodeError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match &err {
        NodeError::ExecutionError { stdout, .. } => stdout.clone(),
        other => other.to_string().into_bytes(),
    };

    Response::builder()
        .status(status)
        .header("x-nexe-status", err.nexe_status())
        .header("x-nexe-retcode", err.nexe_retcode().to_string())
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_without_container_object_has_no_target_url() {
        let parsed = parse_path("/sda1/1/AUTH_test").unwrap();
        assert_eq!(parsed.target_url, None);
    }

    #[test]
    fn path_with_container_object_builds_swift_url() {
        let parsed = parse_path("/sda1/1/AUTH_test/c/o").unwrap();
        assert_eq!(parsed.target_url.as_deref(), Some("swift://AUTH_test/c/o"));
    }

    #[test]
    fn short_path_is_bad_request() {
        assert!(parse_path("/sda1/1").is_err());
    }
}
