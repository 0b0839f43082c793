//! Connection supervision.
//!
//! One live broker connection per data source, exclusively owned here. A
//! monitor task watches each connection; on unexpected closure it drives an
//! exponential-backoff reconnect (500ms doubling, capped at 10s, 10 attempts)
//! and then fires the registered rebuild callback so publishers can restore
//! their channel topology. Every backoff step observes the shutdown signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::options::BasicQosOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AmqpConfig;
use crate::error::{classify, ClientError, Result};

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

const CHANNEL_CREATE_ATTEMPTS: u32 = 3;
const CHANNEL_CREATE_BACKOFF: Duration = Duration::from_millis(500);

/// Callback invoked after a successful reconnect.
pub(crate) type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct ConnectionSupervisor {
    config: AmqpConfig,
    connection: RwLock<Option<Connection>>,
    /// Bumped on every successful dial; monitors for stale generations exit
    /// instead of fighting the live one.
    generation: AtomicU64,
    initialized: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    on_reconnected: parking_lot::RwLock<Option<ReconnectHook>>,
    monitors: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(config: AmqpConfig, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            shutdown_tx,
            on_reconnected: parking_lot::RwLock::new(None),
            monitors: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_on_reconnected(&self, hook: ReconnectHook) {
        *self.on_reconnected.write() = Some(hook);
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) async fn is_connected(&self) -> bool {
        match self.connection.read().await.as_ref() {
            Some(conn) => conn.status().connected(),
            None => false,
        }
    }

    /// Dial the broker, replacing any previous connection, and start a fresh
    /// monitor for the new one.
    pub(crate) fn connect(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<()> {
        if let Some(old) = self.connection.write().await.take() {
            debug!(data_source = %self.config.data_source, "closing previous connection");
            let _ = old.close(200, "superseded").await;
        }

        let uri = self.config.uri();
        let properties = ConnectionProperties::default()
            .with_connection_name(format!("relaymq-{}", self.config.data_source).into());

        let connection = tokio::time::timeout(self.config.connect_timeout, Connection::connect(&uri, properties))
            .await
            .map_err(|_| ClientError::ConnectionFailed(classify("connect timed out")))?
            .map_err(|e| ClientError::ConnectionFailed(e.into()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // lapin reports connection-level failures through this hook; the
        // permit survives until the monitor gets around to awaiting it.
        let lost = Arc::new(Notify::new());
        {
            let lost = lost.clone();
            let data_source = self.config.data_source.clone();
            connection.on_error(move |e| {
                warn!(data_source = %data_source, error = %e, "broker connection error");
                lost.notify_one();
            });
        }

        *self.connection.write().await = Some(connection);
        self.initialized.store(true, Ordering::SeqCst);

        info!(
            data_source = %self.config.data_source,
            host = %self.config.host,
            generation,
            "connected to AMQP broker"
        );

        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            supervisor.monitor(generation, lost).await;
        });
        self.monitors.lock().push(handle);

        Ok(())
    }

    /// Watch one connection generation until shutdown or closure.
    async fn monitor(self: Arc<Self>, generation: u64, lost: Arc<Notify>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(generation, "connection monitor stopping on shutdown");
                return;
            }
            _ = lost.notified() => {}
        }

        if self.generation.load(Ordering::SeqCst) != generation {
            // A replacement connection is already live with its own monitor.
            debug!(generation, "stale connection monitor exiting");
            return;
        }

        warn!(
            data_source = %self.config.data_source,
            generation,
            "broker connection lost, reconnecting"
        );
        self.reconnect(&mut shutdown_rx).await;
    }

    async fn reconnect(self: &Arc<Self>, shutdown_rx: &mut broadcast::Receiver<()>) {
        let mut backoff = RECONNECT_INITIAL_BACKOFF;

        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("reconnect aborted by shutdown");
                    return;
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            match self.connect().await {
                Ok(()) => {
                    info!(attempt, data_source = %self.config.data_source, "reconnected to broker");
                    let hook = self.on_reconnected.read().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                }
            }
        }

        // Publishes now fail with a connection-classified error until a
        // caller externally re-establishes the connection.
        error!(
            data_source = %self.config.data_source,
            attempts = RECONNECT_MAX_ATTEMPTS,
            "reconnect attempts exhausted"
        );
    }

    /// Open a channel on the live connection, retrying transient failures.
    ///
    /// An absent or dead connection is fatal here; retries only cover channel
    /// creation itself. Per-channel QoS is best-effort.
    pub(crate) async fn create_channel(&self) -> Result<Channel> {
        let mut last_err: Option<lapin::Error> = None;

        for attempt in 1..=CHANNEL_CREATE_ATTEMPTS {
            let channel = {
                let guard = self.connection.read().await;
                let connection = match guard.as_ref() {
                    Some(conn) if conn.status().connected() => conn,
                    _ => return Err(ClientError::Transport(classify("connection not available"))),
                };
                connection.create_channel().await
            };

            match channel {
                Ok(channel) => {
                    if let Err(e) = channel.basic_qos(1, BasicQosOptions { global: false }).await {
                        warn!(error = %e, "failed to set channel QoS");
                    }
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "channel creation failed");
                    last_err = Some(e);
                    if attempt < CHANNEL_CREATE_ATTEMPTS {
                        tokio::time::sleep(CHANNEL_CREATE_BACKOFF * attempt).await;
                    }
                }
            }
        }

        let err = last_err.map(|e| e.into()).unwrap_or_else(|| classify("channel creation failed"));
        Err(ClientError::ChannelCreationFailed(err))
    }

    /// Close the connection and join monitor tasks within `deadline`.
    pub(crate) async fn close(&self, deadline: Duration) {
        if let Some(connection) = self.connection.write().await.take() {
            if let Err(e) = connection.close(200, "shutdown").await {
                debug!(error = %e, "error closing broker connection");
            }
        }

        let handles: Vec<_> = self.monitors.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("connection monitors did not stop within deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> AmqpConfig {
        AmqpConfig {
            host: "127.0.0.1".to_string(),
            // Reserved port that nothing listens on.
            port: 1,
            connect_timeout: Duration::from_millis(300),
            ..AmqpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_classified() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let supervisor = Arc::new(ConnectionSupervisor::new(unreachable_config(), shutdown_tx));

        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
        assert!(!supervisor.is_initialized());
        assert!(!supervisor.is_connected().await);
    }

    #[tokio::test]
    async fn test_create_channel_without_connection() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let supervisor = Arc::new(ConnectionSupervisor::new(unreachable_config(), shutdown_tx));

        let err = supervisor.create_channel().await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_close_is_safe_without_connection() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let supervisor = Arc::new(ConnectionSupervisor::new(unreachable_config(), shutdown_tx));
        supervisor.close(Duration::from_secs(1)).await;
    }
}
