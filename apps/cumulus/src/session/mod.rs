//! Per-runtime connection lifecycle.
//!
//! A [`Connection`] owns the kernel session on one assigned runtime: it
//! creates the remote kernel through the control plane, holds the kernel
//! protocol client, and recovers from transport drops with bounded
//! reconnection attempts.

pub mod pool;

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::api::{ApiError, AssignedRuntime, ControlPlane, KernelInfo};
use crate::config::Config;
use crate::kernel::{
    channels_url, ExecuteOptions, ExecutionResult, KernelClient, KernelError, KernelEvent,
};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub notebook_path: String,
    pub kernel_name: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            notebook_path: config.notebook_path.clone(),
            kernel_name: config.kernel_name.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: config.reconnect_base_delay,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("kernel not initialized")]
    NotInitialized,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub struct Connection {
    runtime: AssignedRuntime,
    api: Arc<dyn ControlPlane>,
    opts: ConnectOptions,
    state: parking_lot::RwLock<ConnectionState>,
    kernel_id: parking_lot::RwLock<Option<String>>,
    client: parking_lot::RwLock<Option<KernelClient>>,
    events: broadcast::Sender<ConnectionEvent>,
    closing: AtomicBool,
    monitor: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.runtime.endpoint)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        runtime: AssignedRuntime,
        api: Arc<dyn ControlPlane>,
        opts: ConnectOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            runtime,
            api,
            opts,
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            kernel_id: parking_lot::RwLock::new(None),
            client: parking_lot::RwLock::new(None),
            events,
            closing: AtomicBool::new(false),
            monitor: parking_lot::Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn runtime(&self) -> &AssignedRuntime {
        &self.runtime
    }

    pub fn endpoint(&self) -> &str {
        &self.runtime.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Healthy connections are usable or on their way back.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Create the remote kernel session and attach the protocol client.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let _guard = self.init_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.closing.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        match self.open_session().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                let _ = self.events.send(ConnectionEvent::Connected);
                tracing::info!(
                    target: "cumulus::session",
                    endpoint = %self.runtime.endpoint,
                    accelerator = %self.runtime.accelerator,
                    "connected to runtime kernel"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Failed);
                Err(err)
            }
        }
    }

    async fn open_session(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let session = self
            .api
            .create_session(
                &self.opts.notebook_path,
                &self.opts.kernel_name,
                &self.runtime.proxy,
            )
            .await?;
        let kernel_id = session.kernel.id;
        let url = channels_url(&self.runtime.proxy, &kernel_id)?;
        let client = KernelClient::new(url);
        let kernel_events = client.subscribe();
        client.connect().await?;

        *self.kernel_id.write() = Some(kernel_id);
        if let Some(old) = self.client.write().replace(client) {
            old.close();
        }
        self.spawn_monitor(kernel_events);
        Ok(())
    }

    fn spawn_monitor(self: &Arc<Self>, events: broadcast::Receiver<KernelEvent>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(supervise(weak, events));
        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Bounded reconnect loop. Returns the new client's event stream on
    /// success, `None` once attempts are exhausted.
    async fn reconnect(self: &Arc<Self>) -> Option<broadcast::Receiver<KernelEvent>> {
        self.set_state(ConnectionState::Reconnecting);
        let Some(kernel_id) = self.kernel_id.read().clone() else {
            self.fail("no kernel bound to reconnect to".into());
            return None;
        };
        let url = match channels_url(&self.runtime.proxy, &kernel_id) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(target: "cumulus::session", %err, "cannot rebuild channels url");
                self.fail(err.to_string());
                return None;
            }
        };

        for attempt in 1..=self.opts.max_reconnect_attempts {
            let _ = self.events.send(ConnectionEvent::Reconnecting { attempt });
            tokio::time::sleep(reconnect_delay(self.opts.reconnect_base_delay, attempt)).await;
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            let client = KernelClient::new(url.clone());
            let events = client.subscribe();
            match client.connect().await {
                Ok(()) => {
                    if let Some(old) = self.client.write().replace(client) {
                        old.close();
                    }
                    self.set_state(ConnectionState::Connected);
                    let _ = self.events.send(ConnectionEvent::Connected);
                    tracing::info!(
                        target: "cumulus::session",
                        endpoint = %self.runtime.endpoint,
                        attempt,
                        "reconnected to runtime kernel"
                    );
                    return Some(events);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "cumulus::session",
                        endpoint = %self.runtime.endpoint,
                        attempt,
                        %err,
                        "reconnect attempt failed"
                    );
                }
            }
        }
        self.fail(format!(
            "gave up after {} reconnect attempts",
            self.opts.max_reconnect_attempts
        ));
        None
    }

    fn fail(&self, reason: String) {
        self.set_state(ConnectionState::Failed);
        let _ = self.events.send(ConnectionEvent::Error(reason));
    }

    async fn ensure_initialized(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Disconnected {
            self.initialize().await
        } else {
            Ok(())
        }
    }

    fn client_handle(&self) -> Result<KernelClient, ConnectionError> {
        self.client
            .read()
            .clone()
            .ok_or(ConnectionError::NotInitialized)
    }

    pub async fn execute(
        self: &Arc<Self>,
        code: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ConnectionError> {
        self.ensure_initialized().await?;
        let client = self.client_handle()?;
        Ok(client.execute(code, options).await?)
    }

    pub async fn kernel_info(self: &Arc<Self>) -> Result<serde_json::Value, ConnectionError> {
        self.ensure_initialized().await?;
        let client = self.client_handle()?;
        Ok(client.kernel_info().await?)
    }

    pub async fn interrupt(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.ensure_initialized().await?;
        let client = self.client_handle()?;
        Ok(client.interrupt()?)
    }

    /// Control-plane poll of the kernel's execution state.
    pub async fn get_status(&self) -> Result<String, ConnectionError> {
        let kernel_id = self
            .kernel_id
            .read()
            .clone()
            .ok_or(ConnectionError::NotInitialized)?;
        let info = self.api.get_kernel(&kernel_id, &self.runtime.proxy).await?;
        Ok(info.execution_state)
    }

    pub async fn list_kernels(&self) -> Result<Vec<KernelInfo>, ConnectionError> {
        Ok(self.api.list_kernels(&self.runtime.proxy).await?)
    }

    /// Close the transport and force `Disconnected`. A kernel delete is
    /// best-effort; its failure never fails the shutdown.
    pub async fn shutdown(&self, delete_kernel: bool) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        if let Some(client) = self.client.write().take() {
            client.close();
        }
        if delete_kernel {
            let kernel_id = self.kernel_id.read().clone();
            if let Some(kernel_id) = kernel_id {
                if let Err(err) = self.api.delete_kernel(&kernel_id, &self.runtime.proxy).await {
                    tracing::warn!(
                        target: "cumulus::session",
                        endpoint = %self.runtime.endpoint,
                        %err,
                        "kernel delete failed during shutdown"
                    );
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            tracing::debug!(
                target: "cumulus::session",
                endpoint = %self.runtime.endpoint,
                ?from,
                ?to,
                "connection state changed"
            );
            let _ = self.events.send(ConnectionEvent::StateChanged { from, to });
        }
    }
}

/// Watches the kernel client's event stream and drives reconnection when
/// the transport drops underneath us.
async fn supervise(weak: Weak<Connection>, mut events: broadcast::Receiver<KernelEvent>) {
    loop {
        match events.recv().await {
            Ok(KernelEvent::Disconnected) => {
                let Some(conn) = weak.upgrade() else { return };
                if conn.closing.load(Ordering::SeqCst) {
                    return;
                }
                match conn.reconnect().await {
                    Some(new_events) => events = new_events,
                    None => return,
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Exponential backoff with jitter, capped at [`MAX_RECONNECT_DELAY`].
fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let capped = exp.min(MAX_RECONNECT_DELAY);
    let jitter_ms = (base.as_millis() as u64 / 2).max(1);
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
