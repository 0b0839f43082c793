//! Publish endpoints and their lifecycle state machine.
//!
//! One endpoint per (exchange, router, queue, mode) key, one channel per
//! endpoint, every broker call on that channel serialized by the endpoint's
//! channel mutex. State transitions are broadcast through a watch channel so
//! waiters never observe a half-declared channel:
//!
//! Initializing -> Ready <-> Rebuilding -> Closed (terminal)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::Channel;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rmq_common::MessageOptions;

use crate::connection::ConnectionSupervisor;
use crate::error::{ClientError, Result};
use crate::topology::{declare_topology, QueueInfo};

/// How often the per-endpoint monitor probes channel liveness. lapin exposes
/// no per-channel close callback, so loss is detected by status polling.
const CHANNEL_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Rebuild schedule after a reconnect: 3 attempts at 500ms/1s/1.5s.
pub(crate) const REBUILD_ATTEMPTS: u32 = 3;
pub(crate) const REBUILD_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Rebuild schedule driven by the endpoint monitor: 5 attempts at 1s..5s.
const MONITOR_REBUILD_ATTEMPTS: u32 = 5;
const MONITOR_REBUILD_BACKOFF_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointState {
    Initializing,
    Ready,
    Rebuilding,
    Closed,
}

/// Confirmation strategy, baked into the endpoint key so transactional and
/// confirm publishers never share a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishMode {
    Confirm,
    Transaction,
}

impl PublishMode {
    pub(crate) fn for_options(options: &MessageOptions) -> Self {
        if options.use_transaction {
            PublishMode::Transaction
        } else {
            PublishMode::Confirm
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            PublishMode::Confirm => "confirm",
            PublishMode::Transaction => "transaction",
        }
    }
}

pub(crate) fn endpoint_key(options: &MessageOptions) -> String {
    format!(
        "{}|{}|{}|{}",
        options.exchange,
        options.router,
        options.queue,
        PublishMode::for_options(options).as_str()
    )
}

pub(crate) struct PublishEndpoint {
    pub(crate) key: String,
    pub(crate) options: MessageOptions,
    pub(crate) mode: PublishMode,
    /// The single live channel; held across every broker call.
    pub(crate) channel: Mutex<Option<Channel>>,
    /// Whether confirm-select has been issued on the current channel.
    pub(crate) confirm_selected: AtomicBool,
    queue_info: parking_lot::RwLock<Option<QueueInfo>>,
    state_tx: watch::Sender<EndpointState>,
    /// Guards against the monitor and a post-reconnect rebuild racing each
    /// other onto the same endpoint.
    rebuilding: AtomicBool,
    /// Fired on endpoint close; stops the monitor and unblocks nothing else
    /// (waiters observe the Closed state instead).
    pub(crate) stop: CancellationToken,
}

impl PublishEndpoint {
    pub(crate) fn new(options: MessageOptions) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EndpointState::Initializing);
        Arc::new(Self {
            key: endpoint_key(&options),
            mode: PublishMode::for_options(&options),
            options,
            channel: Mutex::new(None),
            confirm_selected: AtomicBool::new(false),
            queue_info: parking_lot::RwLock::new(None),
            state_tx,
            rebuilding: AtomicBool::new(false),
            stop: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> EndpointState {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == EndpointState::Ready
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// Transition state and wake every waiter. Closed is terminal.
    pub(crate) fn set_state(&self, state: EndpointState) {
        self.state_tx.send_if_modified(|current| {
            if *current == EndpointState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub(crate) fn queue_info(&self) -> Option<QueueInfo> {
        self.queue_info.read().clone()
    }

    /// Block until the endpoint is Ready, the deadline elapses, the caller
    /// cancels, or the endpoint closes.
    pub(crate) async fn wait_ready(&self, cancel: &CancellationToken, deadline: Duration) -> Result<()> {
        match self.state() {
            EndpointState::Ready => return Ok(()),
            EndpointState::Closed => return Err(ClientError::ChannelClosed),
            _ => {}
        }

        let mut rx = self.state_tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::ContextCanceled),
            _ = tokio::time::sleep(deadline) => Err(ClientError::PublishTimeout),
            observed = rx.wait_for(|s| matches!(s, EndpointState::Ready | EndpointState::Closed)) => {
                match observed {
                    Ok(state) if *state == EndpointState::Ready => Ok(()),
                    _ => Err(ClientError::ChannelClosed),
                }
            }
        }
    }

    /// Swap in a freshly declared channel and mark the endpoint Ready.
    pub(crate) async fn install_channel(&self, channel: Channel, info: QueueInfo) {
        *self.channel.lock().await = Some(channel);
        self.confirm_selected.store(false, Ordering::SeqCst);
        *self.queue_info.write() = Some(info);
        self.set_state(EndpointState::Ready);
    }

    /// Detach the current channel (for closing outside the endpoint lock).
    pub(crate) async fn detach_channel(&self) -> Option<Channel> {
        self.channel.lock().await.take()
    }

    async fn channel_connected(&self) -> bool {
        match self.channel.lock().await.as_ref() {
            Some(channel) => channel.status().connected(),
            None => false,
        }
    }

    /// One rebuild attempt: fresh channel, full topology redeclaration.
    pub(crate) async fn rebuild_once(&self, supervisor: &ConnectionSupervisor) -> Result<()> {
        let channel = supervisor.create_channel().await?;
        match declare_topology(&channel, &self.options).await {
            Ok(info) => {
                self.install_channel(channel, info).await;
                Ok(())
            }
            Err(e) => {
                let _ = channel.close(200, "declare failed").await;
                Err(e)
            }
        }
    }

    /// Retry `rebuild_once` with linear backoff. Only one rebuild runs per
    /// endpoint at a time; a concurrent caller returns immediately.
    pub(crate) async fn rebuild_with_retries(
        self: &Arc<Self>,
        supervisor: &Arc<ConnectionSupervisor>,
        attempts: u32,
        backoff_step: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        if self.rebuilding.swap(true, Ordering::SeqCst) {
            debug!(key = %self.key, "rebuild already in flight");
            return;
        }

        for attempt in 1..=attempts {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(backoff_step * attempt) => {}
            }
            if self.is_closed() {
                break;
            }

            match self.rebuild_once(supervisor).await {
                Ok(()) => {
                    info!(key = %self.key, attempt, "endpoint rebuilt");
                    self.rebuilding.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(key = %self.key, attempt, error = %e, "endpoint rebuild attempt failed");
                }
            }
        }

        self.rebuilding.store(false, Ordering::SeqCst);
        if !self.is_closed() {
            error!(key = %self.key, attempts, "endpoint rebuild exhausted");
        }
    }

    /// Per-endpoint monitor: detect channel loss, flush waiters, rebuild.
    pub(crate) async fn run_monitor(
        self: Arc<Self>,
        supervisor: Arc<ConnectionSupervisor>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(CHANNEL_PROBE_INTERVAL) => {}
            }

            if self.is_closed() {
                return;
            }
            if self.state() == EndpointState::Initializing || self.channel_connected().await {
                continue;
            }

            if self.is_ready() {
                warn!(key = %self.key, "publish channel lost");
                self.set_state(EndpointState::Rebuilding);
                if let Some(old) = self.detach_channel().await {
                    let _ = old.close(200, "replaced").await;
                }
            }

            self.rebuild_with_retries(
                &supervisor,
                MONITOR_REBUILD_ATTEMPTS,
                MONITOR_REBUILD_BACKOFF_STEP,
                &mut shutdown_rx,
            )
            .await;
        }
    }

    /// Terminal close: wake all waiters with Closed, stop the monitor, drop
    /// the channel.
    pub(crate) async fn close(&self) {
        self.state_tx.send_replace(EndpointState::Closed);
        self.stop.cancel();
        if let Some(channel) = self.detach_channel().await {
            let _ = channel.close(200, "endpoint closed").await;
        }
    }
}
