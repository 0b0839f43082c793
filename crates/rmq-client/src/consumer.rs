//! Consuming: pull manager, receivers and the delivery loop.
//!
//! Each receiver owns one channel: topology is declared exactly as on the
//! publishing side (honoring the receiver's durable/auto-delete/exclusive
//! flags), QoS applied, then a delivery loop runs alongside a channel
//! watcher; either one failing tears the pair down and the receiver's
//! supervisor relaunches it after a short pause. Deliveries are verified
//! (signature first, decryption second) before the application callback runs
//! with bounded retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rmq_common::{crypto, Message, MessageOptions, SignatureType};

use crate::config::{validate_options, AmqpConfig};
use crate::connection::ConnectionSupervisor;
use crate::error::{classify, ClientError, Result};
use crate::registry;
use crate::topology::declare_topology;

const DEFAULT_PREFETCH_COUNT: u16 = 50;

/// Pause before relaunching a receiver whose channel died.
const RELAUNCH_DELAY: Duration = Duration::from_secs(2);

/// Channel liveness probe interval for the watcher arm of the loop.
const CHANNEL_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Handler retry schedule when `is_nack` is set: 3 attempts, sleeping
/// attempt+3 seconds between failures.
const HANDLER_ATTEMPTS: u32 = 3;

/// Ack retry schedule: the underlying ack can transiently fail during
/// channel handover.
const ACK_ATTEMPTS: u32 = 3;
const ACK_RETRY_STEP: Duration = Duration::from_millis(100);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Application callback invoked for each verified delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Per-receiver settings.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub options: MessageOptions,
    /// Unacknowledged deliveries the broker may push; 0 means the default
    /// of 50.
    pub prefetch_count: u16,
    /// Advisory only: RabbitMQ-compatible brokers ignore prefetch size.
    pub prefetch_size: u32,
    /// Let the broker auto-ack deliveries (no redelivery on failure).
    pub auto_ack: bool,
    /// On final handler failure, nack with requeue instead of acking.
    pub is_nack: bool,
}

impl ReceiverConfig {
    pub fn new(options: MessageOptions) -> Self {
        Self {
            options,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            prefetch_size: 0,
            auto_ack: false,
            is_nack: false,
        }
    }

    fn normalized(&self) -> Self {
        let mut config = self.clone();
        if config.prefetch_count == 0 {
            config.prefetch_count = DEFAULT_PREFETCH_COUNT;
        }
        config
    }
}

/// What to do with a delivery after decode and verification.
#[derive(Debug)]
enum Disposition {
    /// Ack and drop: blank body, malformed envelope, or failed verification.
    Ack,
    /// Hand the (decrypted) message to the application callback.
    Handle(Box<Message>),
}

fn is_blank_body(body: &[u8]) -> bool {
    body.is_empty() || body == b"{}" || body == b"[]"
}

/// Decode the envelope, verify its signature and decrypt the content.
/// Anything that fails here is poison, not worth redelivering.
fn evaluate_delivery(body: &[u8], default_key: Option<&str>) -> Disposition {
    if is_blank_body(body) {
        debug!("blank delivery body, acking without callback");
        return Disposition::Ack;
    }

    let mut message: Message = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "malformed delivery body, acking and skipping");
            return Disposition::Ack;
        }
    };

    if message.options.sig_key.is_empty() {
        if let Some(key) = default_key {
            message.options.sig_key = key.to_string();
        }
    }
    if message.signature.is_empty() || message.options.sig_key.is_empty() {
        warn!(
            signed = !message.signature.is_empty(),
            "rejecting delivery without signature or verification key"
        );
        return Disposition::Ack;
    }

    let mut key = message.options.sig_key.clone().into_bytes();
    let disposition = (|| {
        if !crypto::verify(&key, &message.content, &message.nonce, &message.signature) {
            warn!("signature mismatch, rejecting delivery");
            return Disposition::Ack;
        }

        if message.options.sig_type == SignatureType::Aes {
            if crypto::validate_aes_key(&key).is_err() {
                warn!(key_len = key.len(), "invalid AES key for delivery, rejecting");
                return Disposition::Ack;
            }
            let plaintext = match crypto::decrypt_content(&key, &message.content) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(error = %e, "content decryption failed, rejecting delivery");
                    return Disposition::Ack;
                }
            };
            message.content = match String::from_utf8(plaintext) {
                Ok(content) => content,
                Err(_) => {
                    warn!("decrypted content is not valid UTF-8, rejecting delivery");
                    return Disposition::Ack;
                }
            };
        }

        Disposition::Handle(Box::new(message))
    })();
    crypto::scrub(&mut key);
    disposition
}

pub(crate) struct PullReceiver {
    config: ReceiverConfig,
    handler: Arc<dyn MessageHandler>,
    healthy: AtomicBool,
    stop: CancellationToken,
}

impl PullReceiver {
    fn new(config: ReceiverConfig, handler: Arc<dyn MessageHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            healthy: AtomicBool::new(false),
            stop: CancellationToken::new(),
        })
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

enum ListenExit {
    Shutdown,
    ChannelLost,
}

struct PullInner {
    config: AmqpConfig,
    supervisor: Arc<ConnectionSupervisor>,
    receivers: parking_lot::RwLock<Vec<Arc<PullReceiver>>>,
    closed: AtomicBool,
    close_started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Durable consumer manager for one named data source.
#[derive(Clone)]
pub struct PullManager {
    inner: Arc<PullInner>,
}

impl PullManager {
    /// Create (or reuse) the pull manager for `config.data_source`.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;

        if let Some(existing) = registry::lookup_pull(&config.data_source) {
            return Ok(existing);
        }

        let manager = Self::build(config);
        manager.inner.supervisor.connect().await?;

        match registry::register_pull(&manager.inner.config.data_source, manager.clone()) {
            Ok(()) => Ok(manager),
            Err(existing) => {
                debug!(data_source = %manager.inner.config.data_source, "duplicate pull manager discarded");
                let _ = manager.inner.shutdown_tx.send(());
                manager.inner.supervisor.close(CLOSE_TIMEOUT).await;
                Ok(existing)
            }
        }
    }

    fn build(config: AmqpConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let supervisor = Arc::new(ConnectionSupervisor::new(config.clone(), shutdown_tx.clone()));
        Self {
            inner: Arc::new(PullInner {
                config,
                supervisor,
                receivers: parking_lot::RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                close_started: AtomicBool::new(false),
                shutdown_tx,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn data_source(&self) -> &str {
        &self.inner.config.data_source
    }

    /// Register a receiver and start its delivery loop.
    pub async fn add_receiver(
        &self,
        config: ReceiverConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ManagerClosed);
        }
        let config = config.normalized();
        validate_options(&config.options)?;

        let receiver = PullReceiver::new(config, handler);
        self.inner.receivers.write().push(receiver.clone());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            PullManager::supervise_receiver(inner, receiver).await;
        });
        self.inner.tasks.lock().push(handle);

        Ok(())
    }

    /// Healthy iff initialized, connected, and at least one receiver is live
    /// whenever any are registered.
    pub async fn health_check(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ManagerClosed);
        }
        if !self.inner.supervisor.is_initialized() {
            return Err(ClientError::ManagerNotInitialized);
        }
        if !self.inner.supervisor.is_connected().await {
            return Err(ClientError::ConnectionFailed(classify("connection not available")));
        }
        let receivers = self.inner.receivers.read();
        if !receivers.is_empty() && !receivers.iter().any(|r| r.is_healthy()) {
            return Err(ClientError::NoHealthyChannels);
        }
        Ok(())
    }

    /// Stop all receivers and close the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(data_source = %self.inner.config.data_source, "closing pull manager");
        let _ = self.inner.shutdown_tx.send(());
        self.inner.closed.store(true, Ordering::SeqCst);

        for receiver in self.inner.receivers.write().drain(..) {
            receiver.stop.cancel();
            receiver.healthy.store(false, Ordering::SeqCst);
        }

        let handles: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, join_all).await.is_err() {
            warn!("receiver tasks did not stop within deadline");
        }

        self.inner.supervisor.close(CLOSE_TIMEOUT).await;
        registry::deregister_pull(&self.inner.config.data_source);

        info!(data_source = %self.inner.config.data_source, "pull manager closed");
        Ok(())
    }

    /// Keep one receiver listening: relaunch after channel loss, stop on
    /// shutdown or receiver close.
    async fn supervise_receiver(inner: Arc<PullInner>, receiver: Arc<PullReceiver>) {
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        loop {
            if receiver.stop.is_cancelled() || inner.closed.load(Ordering::SeqCst) {
                return;
            }

            match Self::listen(&inner, &receiver, &mut shutdown_rx).await {
                ListenExit::Shutdown => return,
                ListenExit::ChannelLost => {
                    receiver.healthy.store(false, Ordering::SeqCst);
                    warn!(
                        queue = %receiver.config.options.queue,
                        "receiver channel lost, relaunching shortly"
                    );
                    tokio::select! {
                        _ = receiver.stop.cancelled() => return,
                        _ = shutdown_rx.recv() => return,
                        _ = tokio::time::sleep(RELAUNCH_DELAY) => {}
                    }
                }
            }
        }
    }

    /// One listen incarnation: channel, topology, QoS, consume, then the
    /// delivery loop with a channel watcher alongside.
    async fn listen(
        inner: &Arc<PullInner>,
        receiver: &Arc<PullReceiver>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> ListenExit {
        let options = &receiver.config.options;

        let channel = match inner.supervisor.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(queue = %options.queue, error = %e, "receiver channel acquisition failed");
                return ListenExit::ChannelLost;
            }
        };

        if let Err(e) = declare_topology(&channel, options).await {
            error!(queue = %options.queue, error = %e, "receiver topology declaration failed");
            let _ = channel.close(200, "declare failed").await;
            return ListenExit::ChannelLost;
        }

        if let Err(e) = channel
            .basic_qos(receiver.config.prefetch_count, BasicQosOptions { global: false })
            .await
        {
            warn!(error = %e, "failed to set receiver QoS");
        }

        let consumer_tag = format!("{}-{}", options.queue, Uuid::new_v4());
        let mut consumer = match channel
            .basic_consume(
                &options.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: receiver.config.auto_ack,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(queue = %options.queue, error = %e, "basic.consume failed");
                let _ = channel.close(200, "consume failed").await;
                return ListenExit::ChannelLost;
            }
        };

        receiver.healthy.store(true, Ordering::SeqCst);
        info!(queue = %options.queue, consumer_tag = %consumer_tag, "receiver listening");

        loop {
            tokio::select! {
                _ = receiver.stop.cancelled() => {
                    let _ = channel.close(200, "receiver closed").await;
                    return ListenExit::Shutdown;
                }
                _ = shutdown_rx.recv() => {
                    let _ = channel.close(200, "shutdown").await;
                    return ListenExit::Shutdown;
                }
                _ = tokio::time::sleep(CHANNEL_PROBE_INTERVAL) => {
                    if !channel.status().connected() {
                        warn!(queue = %options.queue, "receiver channel disconnected");
                        return ListenExit::ChannelLost;
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            Self::process_delivery(inner, receiver, &channel, delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(queue = %options.queue, error = %e, "delivery stream error");
                            return ListenExit::ChannelLost;
                        }
                        None => {
                            warn!(queue = %options.queue, "delivery stream ended");
                            return ListenExit::ChannelLost;
                        }
                    }
                }
            }
        }
    }

    async fn process_delivery(
        inner: &Arc<PullInner>,
        receiver: &Arc<PullReceiver>,
        channel: &Channel,
        delivery: lapin::message::Delivery,
    ) {
        let tag = delivery.delivery_tag;
        // The receiver's own key wins; the manager-wide secret is the fallback.
        let default_key = if receiver.config.options.sig_key.is_empty() {
            inner.config.secret_key.as_deref()
        } else {
            Some(receiver.config.options.sig_key.as_str())
        };

        let message = match evaluate_delivery(&delivery.data, default_key) {
            Disposition::Ack => {
                if !receiver.config.auto_ack {
                    Self::ack_with_retry(channel, tag).await;
                }
                return;
            }
            Disposition::Handle(message) => message,
        };

        let mut handled = false;
        for attempt in 1..=HANDLER_ATTEMPTS {
            match receiver.handler.handle(&message).await {
                Ok(()) => {
                    handled = true;
                    break;
                }
                Err(e) if receiver.config.is_nack => {
                    warn!(tag, attempt, error = %e, "message handler failed");
                    if attempt < HANDLER_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64 + 3)).await;
                    }
                }
                Err(e) => {
                    // Fire-and-forget mode: the failure is logged and the
                    // delivery acked.
                    warn!(tag, error = %e, "message handler failed, acking anyway");
                    handled = true;
                    break;
                }
            }
        }

        if receiver.config.auto_ack {
            return;
        }
        if handled {
            Self::ack_with_retry(channel, tag).await;
        } else {
            warn!(tag, "handler retries exhausted, nacking with requeue");
            if let Err(e) = channel
                .basic_nack(tag, BasicNackOptions { requeue: true, ..Default::default() })
                .await
            {
                warn!(tag, error = %e, "nack failed");
            }
        }
    }

    async fn ack_with_retry(channel: &Channel, tag: u64) {
        for attempt in 1..=ACK_ATTEMPTS {
            match channel.basic_ack(tag, BasicAckOptions::default()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(tag, attempt, error = %e, "ack failed");
                    if attempt < ACK_ATTEMPTS {
                        tokio::time::sleep(ACK_RETRY_STEP * attempt).await;
                    }
                }
            }
        }
        error!(tag, "ack retries exhausted, delivery will be redelivered");
    }
}
