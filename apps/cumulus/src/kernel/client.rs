use futures_util::{SinkExt, StreamExt};
use kernel_proto::{decode_message, encode_message, msg_type, Message, WireError};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use super::result::{ExecutionAccumulator, ExecutionResult};
use crate::api::Proxy;

const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("kernel transport error: {0}")]
    Transport(String),
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("no reply from kernel within {0} ms")]
    Timeout(u64),
    #[error("kernel connection closed")]
    Closed,
    #[error("invalid kernel channels url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub enum KernelEvent {
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub timeout: Duration,
    pub silent: bool,
    pub store_history: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(300_000),
            silent: false,
            store_history: true,
        }
    }
}

/// The kernel channels endpoint for a runtime proxy, with the http(s)
/// scheme rewritten for WebSocket use.
pub fn channels_url(proxy: &Proxy, kernel_id: &str) -> Result<String, KernelError> {
    let base = proxy.url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(KernelError::InvalidUrl(proxy.url.clone()));
    };
    Ok(format!(
        "{ws_base}/api/kernels/{kernel_id}/channels?token={token}",
        token = proxy.token
    ))
}

/// Async request/reply client over one kernel WebSocket.
///
/// Replies and streaming events are routed to callers through an explicit
/// registry keyed by the request `msg_id`; entries are removed
/// deterministically on completion or timeout, so a late reply after a
/// timeout finds no handler and is dropped.
#[derive(Clone)]
pub struct KernelClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    session_id: String,
    outbound: parking_lot::Mutex<Outbound>,
    pending: parking_lot::Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    events: broadcast::Sender<KernelEvent>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Default)]
struct Outbound {
    /// Present while the transport is up; the connected flag.
    tx: Option<mpsc::UnboundedSender<String>>,
    /// Frames accepted while disconnected, replayed FIFO on connect.
    queue: VecDeque<String>,
}

impl KernelClient {
    pub fn new(url: String) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                url,
                session_id: Uuid::new_v4().to_string(),
                outbound: parking_lot::Mutex::new(Outbound::default()),
                pending: parking_lot::Mutex::new(HashMap::new()),
                events,
                reader: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().tx.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.inner.events.subscribe()
    }

    /// Open the transport, then flush everything queued while disconnected.
    pub async fn connect(&self) -> Result<(), KernelError> {
        let (ws_stream, _) = connect_async(&self.inner.url).await.map_err(|err| {
            let _ = self.inner.events.send(KernelEvent::Error(err.to_string()));
            KernelError::Transport(err.to_string())
        })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx_out, mut rx_out) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx_out.recv().await {
                if ws_sender.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => inner.dispatch(&text),
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => inner.dispatch(&text),
                        Err(_) => {
                            tracing::warn!(
                                target: "cumulus::kernel",
                                "ignoring non-utf8 binary frame"
                            );
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(err) => {
                        let _ = inner.events.send(KernelEvent::Error(err.to_string()));
                        break;
                    }
                    _ => {}
                }
            }
            writer.abort();
            inner.mark_disconnected();
        });

        {
            let mut outbound = self.inner.outbound.lock();
            while let Some(frame) = outbound.queue.pop_front() {
                let _ = tx_out.send(frame);
            }
            outbound.tx = Some(tx_out);
        }
        if let Some(previous) = self.inner.reader.lock().replace(reader) {
            previous.abort();
        }
        let _ = self.inner.events.send(KernelEvent::Connected);
        tracing::debug!(target: "cumulus::kernel", url = %self.inner.url, "kernel transport connected");
        Ok(())
    }

    /// Serialize and send, or queue for replay while disconnected.
    pub fn send(&self, msg: &Message) -> Result<(), KernelError> {
        let frame = encode_message(msg)?;
        let mut outbound = self.inner.outbound.lock();
        match outbound.tx.take() {
            Some(tx) => match tx.send(frame) {
                Ok(()) => outbound.tx = Some(tx),
                Err(unsent) => outbound.queue.push_back(unsent.0),
            },
            None => outbound.queue.push_back(frame),
        }
        Ok(())
    }

    pub async fn execute(
        &self,
        code: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, KernelError> {
        let msg =
            Message::execute_request(&self.inner.session_id, code, options.silent, options.store_history);
        let msg_id = msg.msg_id().to_string();
        let mut rx = self.inner.register(&msg_id);
        if let Err(err) = self.send(&msg) {
            self.inner.deregister(&msg_id);
            return Err(err);
        }

        let timeout_ms = options.timeout.as_millis() as u64;
        let deadline = Instant::now() + options.timeout;
        let mut acc = ExecutionAccumulator::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.inner.deregister(&msg_id);
                return Err(KernelError::Timeout(timeout_ms));
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => {
                    if let Some(reply) = acc.absorb(&event) {
                        self.inner.deregister(&msg_id);
                        return Ok(acc.finalize(reply));
                    }
                }
                Ok(None) => {
                    self.inner.deregister(&msg_id);
                    return Err(KernelError::Closed);
                }
                Err(_) => {
                    self.inner.deregister(&msg_id);
                    return Err(KernelError::Timeout(timeout_ms));
                }
            }
        }
    }

    /// Correlated info request; cheap enough to double as a liveness probe.
    pub async fn kernel_info(&self) -> Result<Value, KernelError> {
        let msg = Message::kernel_info_request(&self.inner.session_id);
        let msg_id = msg.msg_id().to_string();
        let mut rx = self.inner.register(&msg_id);
        if let Err(err) = self.send(&msg) {
            self.inner.deregister(&msg_id);
            return Err(err);
        }

        let outcome = tokio::time::timeout(KERNEL_INFO_TIMEOUT, async {
            while let Some(event) = rx.recv().await {
                if event.msg_type() == msg_type::KERNEL_INFO_REPLY {
                    return Ok(event.content);
                }
            }
            Err(KernelError::Closed)
        })
        .await;
        self.inner.deregister(&msg_id);
        match outcome {
            Ok(result) => result,
            Err(_) => Err(KernelError::Timeout(KERNEL_INFO_TIMEOUT.as_millis() as u64)),
        }
    }

    /// Fire-and-forget; the kernel does not acknowledge interrupts.
    pub fn interrupt(&self) -> Result<(), KernelError> {
        self.send(&Message::interrupt_request(&self.inner.session_id))
    }

    /// Close the transport and drop all queued and pending work. Idempotent.
    pub fn close(&self) {
        {
            let mut outbound = self.inner.outbound.lock();
            outbound.tx = None;
            outbound.queue.clear();
        }
        if let Some(handle) = self.inner.reader.lock().take() {
            handle.abort();
        }
        self.inner.pending.lock().clear();
    }

    #[cfg(test)]
    fn queued_frames(&self) -> usize {
        self.inner.outbound.lock().queue.len()
    }
}

impl Inner {
    fn register(&self, msg_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(msg_id.to_string(), tx);
        rx
    }

    fn deregister(&self, msg_id: &str) {
        self.pending.lock().remove(msg_id);
    }

    /// Route one inbound frame to the handler registered for its parent
    /// request. Malformed frames are dropped per message.
    fn dispatch(&self, raw: &str) {
        let msg = match decode_message(raw) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(target: "cumulus::kernel", %err, "ignoring malformed frame");
                return;
            }
        };
        let Some(parent_id) = msg.parent_msg_id() else {
            tracing::trace!(
                target: "cumulus::kernel",
                msg_type = msg.msg_type(),
                "unaddressed kernel message"
            );
            return;
        };
        let handler = self.pending.lock().get(parent_id).cloned();
        if let Some(handler) = handler {
            let _ = handler.send(msg);
        }
    }

    fn mark_disconnected(&self) {
        let was_connected = self.outbound.lock().tx.take().is_some();
        if was_connected {
            let _ = self.events.send(KernelEvent::Disconnected);
            tracing::debug!(target: "cumulus::kernel", url = %self.url, "kernel transport dropped");
        }
    }
}
