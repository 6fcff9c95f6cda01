//! End-to-end tests for the kernel protocol path: a real WebSocket client
//! against an in-process server that emulates a runtime kernel endpoint.
//!
//! The emulated kernel interprets the submitted "code" as a tiny command
//! language: `echo <text>` streams to stdout, `stderr <text>` to stderr,
//! `fail` raises, `sleep <ms>` delays the reply, `flood <bytes>` streams a
//! large payload, and `drop` closes the socket without replying.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cumulus_core::api::{
    AcceleratorFamily, ApiError, AssignResponse, Assignment, AssignedRuntime, ControlPlane,
    KernelInfo, Proxy, SessionInfo,
};
use cumulus_core::config::SubscriptionTier;
use cumulus_core::kernel::{channels_url, ExecuteOptions, ExecutionStatus, KernelClient, KernelError};
use cumulus_core::session::pool::{ConnectionPool, PoolConfig, PoolError};
use cumulus_core::session::{ConnectOptions, Connection, ConnectionEvent, ConnectionState};
use kernel_proto::{encode_message, msg_type, Message};
use serde_json::json;

async fn spawn_kernel_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route("/api/kernels/:id/channels", get(channels_handler));
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

async fn channels_handler(ws: WebSocketUpgrade, Path(_id): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(kernel_session)
}

fn reply_frame(parent: &Message, reply_type: &str, content: serde_json::Value) -> WsMessage {
    let mut reply = Message::request(reply_type, "kernel-side", content);
    reply.parent_header = Some(parent.header.clone());
    WsMessage::Text(encode_message(&reply).unwrap())
}

async fn kernel_session(mut socket: WebSocket) {
    let mut execution_count: u64 = 0;
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else { continue };
        let Ok(msg) = kernel_proto::decode_message(&text) else { continue };
        match msg.msg_type() {
            msg_type::KERNEL_INFO_REQUEST => {
                let frame = reply_frame(
                    &msg,
                    msg_type::KERNEL_INFO_REPLY,
                    json!({ "implementation": "mock", "protocol_version": "5.3" }),
                );
                if socket.send(frame).await.is_err() {
                    return;
                }
            }
            msg_type::EXECUTE_REQUEST => {
                execution_count += 1;
                let code = msg
                    .content
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if !run_code(&mut socket, &msg, &code, execution_count).await {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// Returns false when the socket should be torn down.
async fn run_code(socket: &mut WebSocket, request: &Message, code: &str, count: u64) -> bool {
    let (command, arg) = code.split_once(' ').unwrap_or((code, ""));
    match command {
        "drop" => return false,
        "sleep" => {
            let ms: u64 = arg.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        "echo" => {
            let frame = reply_frame(
                request,
                msg_type::STREAM,
                json!({ "name": "stdout", "text": arg }),
            );
            if socket.send(frame).await.is_err() {
                return false;
            }
        }
        "stderr" => {
            let frame = reply_frame(
                request,
                msg_type::STREAM,
                json!({ "name": "stderr", "text": arg }),
            );
            if socket.send(frame).await.is_err() {
                return false;
            }
        }
        "flood" => {
            let total: usize = arg.parse().unwrap_or(0);
            let chunk = "x".repeat(64 * 1024);
            let mut sent = 0;
            while sent < total {
                let take = chunk.len().min(total - sent);
                let frame = reply_frame(
                    request,
                    msg_type::STREAM,
                    json!({ "name": "stdout", "text": &chunk[..take] }),
                );
                if socket.send(frame).await.is_err() {
                    return false;
                }
                sent += take;
            }
        }
        "fail" => {
            let frame = reply_frame(
                request,
                msg_type::ERROR,
                json!({
                    "ename": "RuntimeError",
                    "evalue": "requested failure",
                    "traceback": ["line 1", "line 2"],
                }),
            );
            if socket.send(frame).await.is_err() {
                return false;
            }
            let frame = reply_frame(
                request,
                msg_type::EXECUTE_REPLY,
                json!({ "status": "error", "execution_count": count }),
            );
            return socket.send(frame).await.is_ok();
        }
        _ => {}
    }
    let frame = reply_frame(
        request,
        msg_type::EXECUTE_REPLY,
        json!({ "status": "ok", "execution_count": count }),
    );
    socket.send(frame).await.is_ok()
}

fn proxy_for(base_url: &str) -> Proxy {
    Proxy {
        url: base_url.to_string(),
        token: "test-token".to_string(),
        token_expires_in_seconds: 3600,
    }
}

fn runtime_for(endpoint: &str, base_url: &str) -> AssignedRuntime {
    AssignedRuntime {
        label: "T4 runtime".to_string(),
        accelerator: "T4".to_string(),
        endpoint: endpoint.to_string(),
        proxy: proxy_for(base_url),
    }
}

fn connect_opts() -> ConnectOptions {
    ConnectOptions {
        notebook_path: "Untitled.ipynb".to_string(),
        kernel_name: "python3".to_string(),
        max_reconnect_attempts: 5,
        reconnect_base_delay: Duration::from_millis(10),
    }
}

fn exec_opts(timeout: Duration) -> ExecuteOptions {
    ExecuteOptions {
        timeout,
        ..ExecuteOptions::default()
    }
}

/// Control plane that hands out kernels on the emulated server.
struct TestControlPlane {
    session_counter: AtomicUsize,
}

impl TestControlPlane {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            session_counter: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ControlPlane for TestControlPlane {
    async fn assign(
        &self,
        _key: &str,
        _family: AcceleratorFamily,
        _accelerator: Option<&str>,
    ) -> Result<AssignResponse, ApiError> {
        Err(ApiError::InvalidResponse("assignment not emulated".into()))
    }

    async fn list_assignments(&self) -> Result<Vec<Assignment>, ApiError> {
        Ok(Vec::new())
    }

    async fn list_accelerators(&self, _family: AcceleratorFamily) -> Result<Vec<String>, ApiError> {
        Ok(Vec::new())
    }

    async fn refresh_connection(&self, _endpoint: &str) -> Result<Proxy, ApiError> {
        Err(ApiError::InvalidResponse("refresh not emulated".into()))
    }

    async fn create_session(
        &self,
        _notebook_path: &str,
        _kernel_name: &str,
        _proxy: &Proxy,
    ) -> Result<SessionInfo, ApiError> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        Ok(SessionInfo {
            id: format!("session-{n}"),
            kernel: KernelInfo {
                id: format!("kernel-{n}"),
                execution_state: "starting".into(),
                connections: 0,
            },
        })
    }

    async fn get_kernel(&self, kernel_id: &str, _proxy: &Proxy) -> Result<KernelInfo, ApiError> {
        Ok(KernelInfo {
            id: kernel_id.to_string(),
            execution_state: "idle".into(),
            connections: 1,
        })
    }

    async fn delete_kernel(&self, _kernel_id: &str, _proxy: &Proxy) -> Result<(), ApiError> {
        Ok(())
    }

    async fn list_kernels(&self, _proxy: &Proxy) -> Result<Vec<KernelInfo>, ApiError> {
        Ok(Vec::new())
    }

    async fn send_keep_alive(&self, _endpoint: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

async fn connected_client(base_url: &str) -> KernelClient {
    let url = channels_url(&proxy_for(base_url), "kernel-0").unwrap();
    let client = KernelClient::new(url);
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn execute_accumulates_streams_and_resolves_on_reply() {
    let base = spawn_kernel_server().await;
    let client = connected_client(&base).await;

    let result = client
        .execute("echo hello", &exec_opts(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.stdout, "hello");
    assert_eq!(result.execution_count, Some(1));
    assert!(result.timing.duration_ms >= 0);

    let result = client
        .execute("stderr oops", &exec_opts(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.stderr, "oops");
    assert_eq!(result.execution_count, Some(2));

    client.close();
}

#[tokio::test]
async fn kernel_error_is_captured_as_data() {
    let base = spawn_kernel_server().await;
    let client = connected_client(&base).await;

    let result = client
        .execute("fail", &exec_opts(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    let error = result.error.expect("error content recorded");
    assert_eq!(error.ename, "RuntimeError");
    assert_eq!(result.traceback, vec!["line 1", "line 2"]);

    client.close();
}

#[tokio::test]
async fn concurrent_executions_correlate_by_msg_id() {
    let base = spawn_kernel_server().await;
    let client = connected_client(&base).await;

    let first_opts = exec_opts(Duration::from_secs(5));
    let second_opts = exec_opts(Duration::from_secs(5));
    let (a, b) = tokio::join!(
        client.execute("echo first", &first_opts),
        client.execute("echo second", &second_opts),
    );
    assert_eq!(a.unwrap().stdout, "first");
    assert_eq!(b.unwrap().stdout, "second");

    client.close();
}

#[tokio::test]
async fn flooded_stdout_truncates_at_the_cap() {
    let base = spawn_kernel_server().await;
    let client = connected_client(&base).await;

    let over_cap = (1024 + 256) * 1024;
    let result = client
        .execute(
            &format!("flood {over_cap}"),
            &exec_opts(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout.len(), 1024 * 1024);
    assert!(result.stdout.starts_with("xxx"));
    assert!(result.stderr.contains("stdout truncated"));

    client.close();
}

#[tokio::test]
async fn timed_out_execute_is_isolated_from_its_late_reply() {
    let base = spawn_kernel_server().await;
    let client = connected_client(&base).await;

    let err = client
        .execute("sleep 300", &exec_opts(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Timeout(50)));

    // Let the late reply arrive with no handler registered for it, then
    // prove the client still works.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let result = client
        .execute("echo alive", &exec_opts(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.stdout, "alive");

    client.close();
}

#[tokio::test]
async fn kernel_info_round_trips() {
    let base = spawn_kernel_server().await;
    let client = connected_client(&base).await;

    let info = client.kernel_info().await.unwrap();
    assert_eq!(info["implementation"], "mock");

    client.close();
}

#[tokio::test]
async fn messages_queued_while_disconnected_flush_on_connect() {
    let base = spawn_kernel_server().await;
    let url = channels_url(&proxy_for(&base), "kernel-0").unwrap();
    let client = KernelClient::new(url);

    let prober = client.clone();
    let probe = tokio::spawn(async move { prober.kernel_info().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.connect().await.unwrap();

    let info = probe.await.unwrap().unwrap();
    assert_eq!(info["implementation"], "mock");

    client.close();
}

#[tokio::test]
async fn connection_initializes_executes_and_shuts_down() {
    let base = spawn_kernel_server().await;
    let api = TestControlPlane::new();
    let connection = Connection::new(runtime_for("ep-1", &base), api, connect_opts());

    // lazy initialization through execute
    let result = connection
        .execute("echo lazily", &exec_opts(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.stdout, "lazily");
    assert_eq!(connection.state(), ConnectionState::Connected);

    assert_eq!(connection.get_status().await.unwrap(), "idle");

    connection.shutdown(false).await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_transport_reconnects_and_recovers() {
    let base = spawn_kernel_server().await;
    let api = TestControlPlane::new();
    let connection = Connection::new(runtime_for("ep-1", &base), api, connect_opts());
    connection.initialize().await.unwrap();
    let mut events = connection.subscribe();

    // server closes the socket without replying; the execute times out
    let err = connection
        .execute("drop", &exec_opts(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        cumulus_core::session::ConnectionError::Kernel(_)
    ));

    // watch the lifecycle: Reconnecting with an attempt number, then back
    // to Connected
    let mut saw_reconnecting = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("lifecycle events before deadline")
            .expect("event channel open");
        match event {
            ConnectionEvent::Reconnecting { attempt } => {
                assert!(attempt >= 1);
                saw_reconnecting = true;
            }
            ConnectionEvent::Connected => break,
            _ => {}
        }
    }
    assert!(saw_reconnecting);
    assert_eq!(connection.state(), ConnectionState::Connected);

    let result = connection
        .execute("echo back", &exec_opts(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.stdout, "back");

    connection.shutdown(false).await;
}

#[tokio::test]
async fn pool_enforces_tier_capacity_and_reuses_entries() {
    let base = spawn_kernel_server().await;
    let api = TestControlPlane::new();
    let pool = ConnectionPool::new(
        api,
        connect_opts(),
        PoolConfig {
            tier: SubscriptionTier::Free,
            keep_alive_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
        },
    );

    let first = pool.get_or_create(runtime_for("ep-a", &base)).await.unwrap();
    assert_eq!(pool.stats().await.connected, 1);

    // same endpoint returns the pooled entry and never counts again
    let again = pool.get_or_create(runtime_for("ep-a", &base)).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(pool.stats().await.total, 1);

    // a second endpoint at the free tier limit is refused
    let err = pool.get_or_create(runtime_for("ep-b", &base)).await.unwrap_err();
    assert!(matches!(err, PoolError::CapacityExceeded { limit: 1, .. }));

    // raising the tier unblocks future checks
    pool.set_tier(SubscriptionTier::Pro);
    let second = pool.get_or_create(runtime_for("ep-b", &base)).await.unwrap();
    assert_eq!(second.endpoint(), "ep-b");
    assert_eq!(pool.stats().await.total, 2);

    pool.close_all().await;
    assert_eq!(pool.stats().await.total, 0);
}

#[tokio::test]
async fn pool_replaces_an_entry_it_closed() {
    let base = spawn_kernel_server().await;
    let api = TestControlPlane::new();
    let pool = ConnectionPool::new(
        api,
        connect_opts(),
        PoolConfig {
            tier: SubscriptionTier::Free,
            keep_alive_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
        },
    );

    let first = pool.get_or_create(runtime_for("ep-a", &base)).await.unwrap();
    pool.close_connection("ep-a").await;
    assert_eq!(pool.stats().await.total, 0);

    let second = pool.get_or_create(runtime_for("ep-a", &base)).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.state(), ConnectionState::Connected);

    pool.close_all().await;
}
