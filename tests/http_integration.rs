//! End-to-end tests of the HTTP surface (spec §6/§8): a real `HttpServer`
//! bound to an ephemeral loopback port, driven over a real `TcpStream` the
//! way `tests/common.rs` used to drive the teacher's gRPC server over a
//! Unix socket, just swapped for this crate's plain-HTTP wire format since
//! there's no client crate for it in the dependency graph.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use zerovm_node::config::ConfigBuilder;
use zerovm_node::http::{AppState, HttpServer};
use zerovm_node::objecthandle::{MemoryObjectHandle, ObjectHandle};
use zerovm_node::pool::PoolRegistry;
use zerovm_node::tar_stream::{parse_all_members, tar_to_vec, OutboundMember};
use zerovm_node::Config;

/// Writes an executable shell script under `dir/name`, the same fixture
/// shape `middleware.rs`'s tests use to stand in for a sandbox binary.
fn script(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh\n{}", contents).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

async fn spawn_server(config: Config, objects: Arc<dyn ObjectHandle>) -> SocketAddr {
    let pools = PoolRegistry::new(&config.pools().unwrap()).unwrap();
    let state = Arc::new(AppState {
        config,
        pools,
        objects,
        daemon_nexe: None,
    });
    let bound = HttpServer::new("127.0.0.1:0".parse().unwrap(), state)
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = bound.serve().await;
    });
    addr
}

struct RawResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// A hand-rolled HTTP/1.1 client: writes the request line/headers/body over
/// a raw `TcpStream` and reads the response until the server closes the
/// connection (forced via `Connection: close` so there's no need to track
/// `Content-Length` on the read side). Runs on tokio's blocking-thread pool
/// (`spawn_blocking`) so the synchronous socket calls never stall the same
/// worker thread that's driving the in-process `HttpServer`.
async fn send_request(
    addr: SocketAddr,
    method: &'static str,
    path: String,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
) -> RawResponse {
    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

        let mut request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n",
            body.len()
        );
        for (name, value) in &headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).unwrap();
        stream.write_all(&body).unwrap();
        stream.flush().unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).unwrap();
        parse_response(&raw)
    })
    .await
    .unwrap()
}

fn parse_response(raw: &[u8]) -> RawResponse {
    let header_end = find_subslice(raw, b"\r\n\r\n").expect("response has no header terminator");
    let header_text = std::str::from_utf8(&raw[..header_end]).unwrap();
    let mut lines = header_text.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    RawResponse {
        status,
        headers,
        body: raw[header_end + 4..].to_vec(),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `ConfigBuilder`'s `#[builder(default)]` falls back to each field's
/// `Default::default()`, not its `clap` `default_value` -- so every field a
/// test's request actually has to clear (ingest/output caps, upload budget,
/// captured-output caps) needs an explicit value here, same as
/// `middleware.rs`'s own `config()` test helper does for the timeouts.
fn config_builder() -> ConfigBuilder {
    ConfigBuilder::default()
        .zerovm_timeout(5u64)
        .zerovm_kill_timeout(1u64)
        .zerovm_maxinput(1_048_576u64)
        .zerovm_maxoutput(1_048_576u64)
        .max_upload_secs(30u64)
        .max_stdout_kib(64u64)
        .max_stderr_kib(64u64)
}

/// S1: a one-shot echo request over the real HTTP surface, tar in / tar
/// out, success headers intact.
#[tokio::test]
async fn execute_one_shot_echo_over_http() {
    let scratch = tempfile::tempdir().unwrap();
    let stdout_path = scratch.path().join("channel-stdout");
    script(
        scratch.path(),
        "boot",
        &format!(
            "printf 'hello\\n' > {}; printf '0\\n0\\n/dev/stdout e1b849f9631ffc1829b2e31402373e3c\\n0 0 0 0 0 0 0 0 0 0\\nok\\n'",
            stdout_path.display()
        ),
    );

    let sysmap_json = br#"{"name":"job1","exe":"swift://a/c/boot","channels":[
        {"device":"stdout","path":"","access":2,"content_type":"text/plain"}
    ]}"#;
    let members = vec![
        OutboundMember::Sysmap(sysmap_json.to_vec()),
        OutboundMember::File {
            name: "boot".to_string(),
            path: scratch.path().join("boot"),
            size: 0,
        },
    ];
    let body = tar_to_vec(&members).await.unwrap();

    let config = config_builder().build().unwrap();
    let addr = spawn_server(config, Arc::new(MemoryObjectHandle::new())).await;

    let response = send_request(
        addr,
        "POST",
        "/sda1/1/AUTH_test".to_string(),
        vec![("x-zerovm-execute", "1".to_string())],
        body,
    )
    .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("x-nexe-retcode").map(String::as_str), Some("0"));
    assert_eq!(response.headers.get("x-nexe-status").map(String::as_str), Some("ok"));

    let out_members = parse_all_members(&response.body).await.unwrap();
    assert_eq!(out_members.get("stdout").unwrap(), b"hello\n");
}

/// S3: an inbound member larger than the configured ingest cap is rejected
/// with 413 before any sandbox invocation happens.
#[tokio::test]
async fn execute_rejects_oversized_ingest_with_413() {
    let dir = tempfile::tempdir().unwrap();
    let big_path = dir.path().join("big");
    std::fs::write(&big_path, vec![b'x'; 2048]).unwrap();

    let members = vec![OutboundMember::File {
        name: "big".to_string(),
        path: big_path,
        size: 2048,
    }];
    let body = tar_to_vec(&members).await.unwrap();

    let config = config_builder().zerovm_maxinput(100u64).build().unwrap();
    let addr = spawn_server(config, Arc::new(MemoryObjectHandle::new())).await;

    let response = send_request(
        addr,
        "POST",
        "/sda1/1/AUTH_test".to_string(),
        vec![("x-zerovm-execute", "1".to_string())],
        body,
    )
    .await;

    assert_eq!(response.status, 413);
}

/// S4: a pool with one slot and no queue rejects a second concurrent
/// request while the first is still running.
#[tokio::test]
async fn execute_rejects_second_concurrent_request_when_pool_saturated() {
    let scratch = tempfile::tempdir().unwrap();
    script(
        scratch.path(),
        "boot",
        "sleep 1; printf '0\\n0\\n/dev/stdout e1b849f9631ffc1829b2e31402373e3c\\n0 0 0 0 0 0 0 0 0 0\\nok\\n'",
    );
    let sysmap_json = br#"{"name":"job1","exe":"swift://a/c/boot","channels":[]}"#;
    let members = vec![
        OutboundMember::Sysmap(sysmap_json.to_vec()),
        OutboundMember::File {
            name: "boot".to_string(),
            path: scratch.path().join("boot"),
            size: 0,
        },
    ];
    let body = tar_to_vec(&members).await.unwrap();

    let config = config_builder()
        .zerovm_threadpools("default 1 0")
        .build()
        .unwrap();
    let addr = spawn_server(config, Arc::new(MemoryObjectHandle::new())).await;

    let first_body = body.clone();
    let first = tokio::spawn(send_request(
        addr,
        "POST",
        "/sda1/1/AUTH_test".to_string(),
        vec![("x-zerovm-execute", "1".to_string())],
        first_body,
    ));

    // Give the first request time to clear its own (brief) ingest admission
    // and land inside the long-running exec phase, where it holds the only
    // pool slot for the duration of the script's `sleep 1`.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = send_request(
        addr,
        "POST",
        "/sda1/1/AUTH_test".to_string(),
        vec![("x-zerovm-execute", "1".to_string())],
        body,
    )
    .await;
    assert_eq!(second.status, 503);

    let first = first.await.unwrap();
    assert_eq!(first.status, 200);
}

/// S6: a writable local-object channel with a `message/http` CGI preamble
/// is stripped and committed to the object store with the preamble's
/// headers, not the report's raw etag.
#[tokio::test]
async fn execute_commits_cgi_response_as_local_object() {
    let scratch = tempfile::tempdir().unwrap();
    let stdout_path = scratch.path().join("channel-stdout");
    script(
        scratch.path(),
        "boot",
        &format!(
            "printf 'HTTP/1.1 200 OK\\r\\nContent-Type: image/png\\r\\nX-Object-Meta-Author: me\\r\\n\\r\\nPNGBYTES' > {}; printf '0\\n0\\nstaleetagvaluexxxxxxxxxxxxxxxxxx\\n0 0 0 0 0 0 0 0 0 0\\nok\\n'",
            stdout_path.display()
        ),
    );

    let sysmap_json = br#"{"name":"job1","exe":"swift://a/c/boot","channels":[
        {"device":"stdout","path":"swift://AUTH_test/c/o","access":2,"content_type":"message/http"}
    ]}"#;
    let members = vec![
        OutboundMember::Sysmap(sysmap_json.to_vec()),
        OutboundMember::File {
            name: "boot".to_string(),
            path: scratch.path().join("boot"),
            size: 0,
        },
    ];
    let body = tar_to_vec(&members).await.unwrap();

    let config = config_builder().build().unwrap();
    let store = Arc::new(MemoryObjectHandle::new());
    let addr = spawn_server(config, store.clone()).await;

    let response = send_request(
        addr,
        "POST",
        "/sda1/1/AUTH_test/c/o".to_string(),
        vec![
            ("x-zerovm-execute", "1".to_string()),
            ("x-timestamp", "1700000000.000".to_string()),
        ],
        body,
    )
    .await;

    assert_eq!(response.status, 200);

    let meta = store.read_metadata("swift://AUTH_test/c/o").await.unwrap();
    assert_eq!(meta.content_type(), "image/png");
    assert_eq!(meta.meta().get("author"), Some(&"me".to_string()));
    let expected_etag = format!("{:x}", md5::compute(b"PNGBYTES"));
    assert_eq!(meta.etag(), &expected_etag);
}

/// The `GET ?x-zerovm-valid` pre-check reports `true` only once an object
/// has actually been marked validated.
#[tokio::test]
async fn precheck_reports_validated_objects_only() {
    let store = Arc::new(MemoryObjectHandle::new());
    store.seed("swift://AUTH_test/c/o", b"nexe bytes".to_vec(), "application/x-nexe", "abc123");

    let config = config_builder().build().unwrap();
    let addr = spawn_server(config, store.clone()).await;

    let not_yet = send_request(
        addr,
        "GET",
        "/sda1/1/AUTH_test/c/o".to_string(),
        vec![("x-zerovm-valid", "1".to_string())],
        vec![],
    )
    .await;
    assert_eq!(not_yet.status, 200);
    assert!(!not_yet.headers.contains_key("x-zerovm-valid"));

    store.mark_validated("swift://AUTH_test/c/o", "abc123").await.unwrap();

    let now_valid = send_request(
        addr,
        "GET",
        "/sda1/1/AUTH_test/c/o".to_string(),
        vec![("x-zerovm-valid", "1".to_string())],
        vec![],
    )
    .await;
    assert_eq!(now_valid.status, 200);
    assert_eq!(now_valid.headers.get("x-zerovm-valid").map(String::as_str), Some("true"));
}
