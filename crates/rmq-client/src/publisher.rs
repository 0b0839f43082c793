//! Publishing: manager, endpoint registry and the send paths.
//!
//! A [`PublishManager`] owns one broker connection (via the supervisor) and
//! lazily creates one [`PublishEndpoint`] per (exchange, router, queue, mode)
//! key. Endpoint creation is bounded by a semaphore so mass first-use cannot
//! flood the broker with topology declarations. Three send paths: single
//! message with bounded retry, atomic batch under a broker transaction, and
//! high-throughput batch with publisher confirms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::BasicProperties;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rmq_common::{crypto, Message, MessageOptions, SignatureType};

use crate::config::{validate_options, AmqpConfig};
use crate::connection::ConnectionSupervisor;
use crate::endpoint::{
    endpoint_key, EndpointState, PublishEndpoint, PublishMode, REBUILD_ATTEMPTS, REBUILD_BACKOFF_STEP,
};
use crate::error::{ClientError, Result};
use crate::registry;
use crate::topology::{inspect_queue, QueueInfo};

/// Deadline for winning an endpoint creation slot.
const CREATE_SEMAPHORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for an endpoint to become Ready before a publish gives up.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-send retry schedule: 3 attempts, sleep attempt x 100ms between.
const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_STEP: Duration = Duration::from_millis(100);

/// Deadline for joining monitor tasks during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fill in envelope fields that must be set before any send: nonce,
/// optional AES-GCM content protection, signature, broker TTL. The local
/// key copy is scrubbed before returning.
pub(crate) fn preprocess_message(message: &mut Message, default_key: Option<&str>) -> Result<()> {
    if message.options.sig_key.is_empty() {
        if let Some(key) = default_key {
            message.options.sig_key = key.to_string();
        }
    }
    if message.options.sig_key.is_empty() {
        return Err(ClientError::SignatureKeyRequired);
    }

    if message.nonce.is_empty() {
        message.nonce = crypto::generate_nonce();
    }

    let mut key = message.options.sig_key.clone().into_bytes();
    let result = (|| {
        if message.options.sig_type == SignatureType::Aes {
            crypto::validate_aes_key(&key)?;
            message.content = crypto::encrypt_content(&key, message.content.as_bytes())?;
        }
        message.signature = crypto::sign(&key, &message.content, &message.nonce);
        Ok::<(), crypto::CryptoError>(())
    })();
    crypto::scrub(&mut key);
    result?;

    if message.delay_secs > 0 {
        message.expiration = (message.delay_secs * 1000).to_string();
    }

    Ok(())
}

fn build_properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_timestamp(chrono::Utc::now().timestamp() as u64)
        .with_message_id(Uuid::new_v4().to_string().into())
        .with_correlation_id(message.nonce.clone().into())
        .with_priority(message.priority);
    if !message.expiration.is_empty() {
        properties = properties.with_expiration(message.expiration.clone().into());
    }
    properties
}

struct PublisherInner {
    config: AmqpConfig,
    supervisor: Arc<ConnectionSupervisor>,
    endpoints: DashMap<String, Arc<PublishEndpoint>>,
    create_permits: Arc<Semaphore>,
    closed: AtomicBool,
    close_started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Durable publisher for one named data source. Cheap to clone; all clones
/// share the same connection and endpoint registry.
#[derive(Clone)]
pub struct PublishManager {
    inner: Arc<PublisherInner>,
}

impl std::fmt::Debug for PublishManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishManager").finish_non_exhaustive()
    }
}

impl PublishManager {
    /// Create (or reuse) the manager for `config.data_source`.
    ///
    /// The registry enforces one manager per data-source name; a concurrent
    /// creation race resolves in favor of the first registration.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;

        if let Some(existing) = registry::lookup_publish(&config.data_source) {
            return Ok(existing);
        }

        let manager = Self::build(config);
        manager.inner.supervisor.connect().await?;

        match registry::register_publish(&manager.inner.config.data_source, manager.clone()) {
            Ok(()) => Ok(manager),
            Err(existing) => {
                // Lost the registration race; discard our connection.
                debug!(data_source = %manager.inner.config.data_source, "duplicate manager discarded");
                let _ = manager.inner.shutdown_tx.send(());
                manager.inner.supervisor.close(CLOSE_TIMEOUT).await;
                Ok(existing)
            }
        }
    }

    fn build(config: AmqpConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let supervisor = Arc::new(ConnectionSupervisor::new(config.clone(), shutdown_tx.clone()));
        let inner = Arc::new(PublisherInner {
            create_permits: Arc::new(Semaphore::new(config.max_concurrent_creates())),
            config,
            supervisor,
            endpoints: DashMap::new(),
            closed: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        // The supervisor must not keep the manager alive: the reconnect hook
        // holds a weak back-reference only.
        let weak = Arc::downgrade(&inner);
        inner.supervisor.set_on_reconnected(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                PublisherInner::schedule_rebuild_all(&inner);
            }
        }));

        Self { inner }
    }

    pub fn data_source(&self) -> &str {
        &self.inner.config.data_source
    }

    /// Publish plain content with default options for (exchange, queue).
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        queue: &str,
        msg_type: i64,
        content: impl Into<String>,
    ) -> Result<()> {
        let options = MessageOptions::new(exchange, queue);
        let message = Message::new(options, msg_type, content);
        self.publish_message(cancel, message).await
    }

    /// Publish one message, retrying classified-retryable failures.
    pub async fn publish_message(&self, cancel: &CancellationToken, mut message: Message) -> Result<()> {
        self.ensure_open()?;
        validate_options(&message.options)?;

        let endpoint = self.acquire_endpoint(&message.options).await?;
        endpoint.wait_ready(cancel, READY_TIMEOUT).await?;
        preprocess_message(&mut message, self.inner.config.secret_key.as_deref())?;

        let mut last_err: Option<ClientError> = None;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.send_once(&endpoint, &message, cancel).await {
                Ok(()) => return Ok(()),
                Err(ClientError::ContextCanceled) => return Err(ClientError::ContextCanceled),
                Err(e) if e.retryable() && attempt < PUBLISH_ATTEMPTS => {
                    warn!(
                        key = %endpoint.key,
                        attempt,
                        error = %e,
                        "publish attempt failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::ContextCanceled),
                        _ = tokio::time::sleep(PUBLISH_RETRY_STEP * attempt) => {}
                    }
                }
                Err(e) if e.retryable() => {
                    return Err(ClientError::PublishFailed { attempts: PUBLISH_ATTEMPTS, last: Box::new(e) });
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClientError::PublishFailed {
            attempts: PUBLISH_ATTEMPTS,
            last: Box::new(last_err.unwrap_or(ClientError::PublishTimeout)),
        })
    }

    /// Publish a batch. All messages must target the same (exchange, queue);
    /// the batch mode (transaction vs confirm) comes from the first message's
    /// options.
    pub async fn batch_publish(&self, cancel: &CancellationToken, mut messages: Vec<Message>) -> Result<()> {
        self.ensure_open()?;
        let Some(first) = messages.first() else {
            return Ok(());
        };
        validate_options(&first.options)?;

        let exchange = first.options.exchange.clone();
        let queue = first.options.queue.clone();
        if messages.iter().any(|m| m.options.exchange != exchange || m.options.queue != queue) {
            return Err(ClientError::BatchInconsistent);
        }

        let options = first.options.clone();
        let endpoint = self.acquire_endpoint(&options).await?;
        endpoint.wait_ready(cancel, READY_TIMEOUT).await?;

        for message in &mut messages {
            preprocess_message(message, self.inner.config.secret_key.as_deref())?;
        }

        match endpoint.mode {
            PublishMode::Transaction => self.batch_publish_tx(&endpoint, &messages, cancel).await,
            PublishMode::Confirm => self.batch_publish_confirm(&endpoint, &messages, cancel).await,
        }
    }

    /// Queue depth and consumer count for a declared queue.
    pub async fn queue_status(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        queue: &str,
        router: &str,
    ) -> Result<QueueInfo> {
        self.ensure_open()?;

        let options = MessageOptions::new(exchange, queue).with_router(router);
        // Reuse a live endpoint channel when one exists for either mode; a
        // rebuilding endpoint answers with its last declared metadata.
        for candidate in [
            endpoint_key(&options),
            endpoint_key(&options.clone().with_transaction(true)),
        ] {
            let Some(endpoint) = self.inner.endpoints.get(&candidate).map(|e| e.value().clone()) else {
                continue;
            };
            if endpoint.is_ready() {
                let guard = endpoint.channel.lock().await;
                if let Some(channel) = guard.as_ref() {
                    return tokio::select! {
                        _ = cancel.cancelled() => Err(ClientError::ContextCanceled),
                        info = inspect_queue(channel, queue) => info,
                    };
                }
            }
            if let Some(info) = endpoint.queue_info() {
                return Ok(info);
            }
        }

        // No endpoint yet: inspect over a short-lived channel.
        let channel = self.inner.supervisor.create_channel().await?;
        let info = tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::ContextCanceled),
            info = inspect_queue(&channel, queue) => info,
        };
        let _ = channel.close(200, "status check done").await;
        info
    }

    /// Healthy iff initialized, connected, and at least one endpoint is Ready
    /// whenever any are registered.
    pub async fn health_check(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ManagerClosed);
        }
        if !self.inner.supervisor.is_initialized() {
            return Err(ClientError::ManagerNotInitialized);
        }
        if !self.inner.supervisor.is_connected().await {
            return Err(ClientError::ConnectionFailed(crate::error::classify(
                "connection not available",
            )));
        }
        if !self.inner.endpoints.is_empty()
            && !self.inner.endpoints.iter().any(|e| e.value().is_ready())
        {
            return Err(ClientError::NoHealthyChannels);
        }
        Ok(())
    }

    /// Tear everything down. Idempotent: the second call returns immediately.
    pub async fn close(&self) -> Result<()> {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(data_source = %self.inner.config.data_source, "closing publish manager");
        let _ = self.inner.shutdown_tx.send(());
        self.inner.closed.store(true, Ordering::SeqCst);

        let keys: Vec<String> = self.inner.endpoints.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, endpoint)) = self.inner.endpoints.remove(&key) {
                endpoint.close().await;
            }
        }

        let handles: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, join_all).await.is_err() {
            warn!("endpoint monitors did not stop within deadline");
        }

        self.inner.supervisor.close(CLOSE_TIMEOUT).await;
        registry::deregister_publish(&self.inner.config.data_source);

        info!(data_source = %self.inner.config.data_source, "publish manager closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ManagerClosed);
        }
        Ok(())
    }

    /// Get or lazily create the endpoint for `options`.
    async fn acquire_endpoint(&self, options: &MessageOptions) -> Result<Arc<PublishEndpoint>> {
        let key = endpoint_key(options);

        if let Some(endpoint) = self.inner.endpoints.get(&key) {
            return Ok(endpoint.value().clone());
        }

        let permit = tokio::time::timeout(
            CREATE_SEMAPHORE_TIMEOUT,
            self.inner.create_permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| ClientError::SemaphoreTimeout)?
        .map_err(|_| ClientError::ManagerClosed)?;

        // Double-check after winning the slot: another caller may have built
        // the endpoint while we waited.
        if let Some(endpoint) = self.inner.endpoints.get(&key) {
            return Ok(endpoint.value().clone());
        }
        self.ensure_open()?;

        let channel = self.inner.supervisor.create_channel().await?;
        let endpoint = PublishEndpoint::new(options.clone());

        match crate::topology::declare_topology(&channel, options).await {
            Ok(info) => endpoint.install_channel(channel, info).await,
            Err(e) => {
                let _ = channel.close(200, "declare failed").await;
                return Err(e);
            }
        }

        let monitor = {
            let endpoint = endpoint.clone();
            let supervisor = self.inner.supervisor.clone();
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(endpoint.run_monitor(supervisor, shutdown_rx))
        };
        self.inner.tasks.lock().push(monitor);

        self.inner.endpoints.insert(key.clone(), endpoint.clone());
        drop(permit);

        debug!(key = %key, mode = endpoint.mode.as_str(), "publish endpoint created");
        Ok(endpoint)
    }

    /// One publish attempt: serialize, publish under the endpoint lock, race
    /// the broker round-trip against the caller's cancellation.
    async fn send_once(
        &self,
        endpoint: &Arc<PublishEndpoint>,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let properties = build_properties(message);

        let guard = endpoint.channel.lock().await;
        let channel = guard
            .as_ref()
            .ok_or_else(|| ClientError::ChannelUnavailable("endpoint has no live channel".to_string()))?;

        let publish = async {
            let confirm = channel
                .basic_publish(
                    &message.options.exchange,
                    &message.options.router,
                    BasicPublishOptions { mandatory: true, immediate: false },
                    &payload,
                    properties,
                )
                .await?;
            // Resolves immediately as NotRequested unless the channel is in
            // confirm mode.
            confirm.await?;
            Ok::<(), lapin::Error>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::ContextCanceled),
            result = publish => result.map_err(ClientError::from),
        }
    }

    /// Atomic batch: everything inside one broker transaction.
    async fn batch_publish_tx(
        &self,
        endpoint: &Arc<PublishEndpoint>,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = endpoint.channel.lock().await;
        let channel = guard
            .as_ref()
            .ok_or_else(|| ClientError::ChannelUnavailable("endpoint has no live channel".to_string()))?;

        channel
            .tx_select()
            .await
            .map_err(|e| ClientError::TxStartFailed(e.into()))?;

        let mut failure: Option<ClientError> = None;
        for message in messages {
            let payload = match serde_json::to_vec(message) {
                Ok(payload) => payload,
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            };

            let publish = async {
                let confirm = channel
                    .basic_publish(
                        &message.options.exchange,
                        &message.options.router,
                        BasicPublishOptions { mandatory: true, immediate: false },
                        &payload,
                        build_properties(message),
                    )
                    .await?;
                confirm.await?;
                Ok::<(), lapin::Error>(())
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ClientError::ContextCanceled),
                result = publish => result.map_err(ClientError::from),
            };
            if let Err(e) = result {
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => match channel.tx_commit().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let commit_err = ClientError::TxCommitFailed(e.into());
                    if let Err(rollback) = channel.tx_rollback().await {
                        warn!(error = %rollback, "transaction rollback after failed commit also failed");
                    }
                    Err(commit_err)
                }
            },
            Some(e) => {
                if let Err(rollback) = channel.tx_rollback().await {
                    warn!(error = %rollback, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Confirm-mode batch: publish all, then reconcile acks under the
    /// endpoint's confirm deadline.
    async fn batch_publish_confirm(
        &self,
        endpoint: &Arc<PublishEndpoint>,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let expected = messages.len();
        let deadline = Duration::from_secs(endpoint.options.confirm_timeout_secs);

        let guard = endpoint.channel.lock().await;
        let channel = guard
            .as_ref()
            .ok_or_else(|| ClientError::ChannelUnavailable("endpoint has no live channel".to_string()))?;

        // confirm-select is sticky per channel; issue it once per channel
        // incarnation.
        if !endpoint.confirm_selected.load(Ordering::SeqCst) {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| ClientError::ConfirmModeError(e.into()))?;
            endpoint.confirm_selected.store(true, Ordering::SeqCst);
        }

        // Publish everything first; delivery tags are assigned in submission
        // order, reported 1-based within this batch.
        let mut pending = Vec::with_capacity(expected);
        for (index, message) in messages.iter().enumerate() {
            let payload = serde_json::to_vec(message)?;
            let publish = channel.basic_publish(
                &message.options.exchange,
                &message.options.router,
                BasicPublishOptions { mandatory: true, immediate: false },
                &payload,
                build_properties(message),
            );

            let confirm = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::ContextCanceled),
                result = publish => result.map_err(ClientError::from)?,
            };
            pending.push((index as u64 + 1, confirm));
        }

        let confirm_deadline = tokio::time::Instant::now() + deadline;
        let mut confirmed = 0usize;
        for (tag, confirm) in pending {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::ContextCanceled),
                outcome = tokio::time::timeout_at(confirm_deadline, confirm) => outcome,
            };

            match outcome {
                Err(_) => return Err(ClientError::ConfirmTimeout { confirmed, expected }),
                Ok(Err(e)) => {
                    warn!(tag, error = %e, "confirm stream failed");
                    return Err(ClientError::ConfirmChannelClosed { remaining: expected - confirmed });
                }
                Ok(Ok(confirmation)) => {
                    if confirmation.is_ack() {
                        confirmed += 1;
                    } else {
                        return Err(ClientError::MessageRejected { tag, remaining: expected - confirmed });
                    }
                }
            }
        }

        debug!(confirmed, expected, key = %endpoint.key, "batch confirmed");
        Ok(())
    }
}

impl PublisherInner {
    /// After a reconnect every endpoint's channel is gone: flip them to
    /// Rebuilding, close the dead channels, and schedule rebuilds.
    fn schedule_rebuild_all(inner: &Arc<PublisherInner>) {
        let endpoints: Vec<_> = inner.endpoints.iter().map(|e| e.value().clone()).collect();
        info!(endpoints = endpoints.len(), "rebuilding publish endpoints after reconnect");

        for endpoint in endpoints {
            if endpoint.is_closed() {
                continue;
            }
            endpoint.set_state(EndpointState::Rebuilding);

            let supervisor = inner.supervisor.clone();
            let mut shutdown_rx = inner.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                if let Some(old) = endpoint.detach_channel().await {
                    let _ = old.close(200, "connection replaced").await;
                }
                endpoint
                    .rebuild_with_retries(&supervisor, REBUILD_ATTEMPTS, REBUILD_BACKOFF_STEP, &mut shutdown_rx)
                    .await;
            });
            inner.tasks.lock().push(handle);
        }
    }
}

#[cfg(test)]
impl PublishManager {
    /// Manager with no broker connection, for state-machine tests.
    pub(crate) fn disconnected_for_tests(config: AmqpConfig) -> Self {
        Self::build(config.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmq_common::ExchangeType;

    fn test_config() -> AmqpConfig {
        AmqpConfig { data_source: "publisher-tests".to_string(), ..AmqpConfig::default() }
    }

    fn signed_options() -> MessageOptions {
        MessageOptions::new("t.ex", "t.q").with_signature(SignatureType::Plain, "unit-test-key")
    }

    #[test]
    fn test_preprocess_fills_nonce_and_signature() {
        let mut message = Message::new(signed_options(), 1, "hello");
        preprocess_message(&mut message, None).unwrap();

        assert!(!message.nonce.is_empty());
        assert_eq!(message.signature.len(), 64);
        assert!(crypto::verify(b"unit-test-key", &message.content, &message.nonce, &message.signature));
        assert_eq!(message.content, "hello");
        assert!(message.expiration.is_empty());
    }

    #[test]
    fn test_preprocess_preserves_existing_nonce() {
        let mut message = Message::new(signed_options(), 1, "hello");
        message.nonce = "fixed-nonce".to_string();
        preprocess_message(&mut message, None).unwrap();
        assert_eq!(message.nonce, "fixed-nonce");
    }

    #[test]
    fn test_preprocess_requires_a_key() {
        let mut message = Message::new(MessageOptions::new("e", "q"), 1, "hello");
        let err = preprocess_message(&mut message, None).unwrap_err();
        assert!(matches!(err, ClientError::SignatureKeyRequired));
    }

    #[test]
    fn test_preprocess_applies_manager_default_key() {
        let mut message = Message::new(MessageOptions::new("e", "q"), 1, "hello");
        preprocess_message(&mut message, Some("manager-key")).unwrap();
        assert!(crypto::verify(b"manager-key", &message.content, &message.nonce, &message.signature));
    }

    #[test]
    fn test_preprocess_encrypts_for_aes() {
        let options = MessageOptions::new("e", "q")
            .with_signature(SignatureType::Aes, "0123456789abcdef");
        let mut message = Message::new(options, 1, "top secret");
        preprocess_message(&mut message, None).unwrap();

        assert_ne!(message.content, "top secret");
        // Signature binds the ciphertext, not the plaintext.
        assert!(crypto::verify(
            b"0123456789abcdef",
            &message.content,
            &message.nonce,
            &message.signature
        ));
        let plain = crypto::decrypt_content(b"0123456789abcdef", &message.content).unwrap();
        assert_eq!(plain, b"top secret");
    }

    #[test]
    fn test_preprocess_rejects_short_aes_key() {
        let options = MessageOptions::new("e", "q").with_signature(SignatureType::Aes, "short");
        let mut message = Message::new(options, 1, "x");
        let err = preprocess_message(&mut message, None).unwrap_err();
        assert!(matches!(err, ClientError::InvalidAesKey(5)));
    }

    #[test]
    fn test_preprocess_sets_expiration_from_delay() {
        let mut message = Message::new(signed_options(), 1, "x").with_delay(90);
        preprocess_message(&mut message, None).unwrap();
        assert_eq!(message.expiration, "90000");
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_operations() {
        let manager = PublishManager::disconnected_for_tests(test_config());
        manager.inner.closed.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let err = manager
            .publish(&cancel, "e", "q", 1, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ManagerClosed));

        let err = manager.batch_publish(&cancel, vec![Message::new(signed_options(), 1, "x")]).await.unwrap_err();
        assert!(matches!(err, ClientError::ManagerClosed));

        let err = manager.health_check().await.unwrap_err();
        assert!(matches!(err, ClientError::ManagerClosed));
    }

    #[tokio::test]
    async fn test_health_check_requires_initialization() {
        let manager = PublishManager::disconnected_for_tests(test_config());
        let err = manager.health_check().await.unwrap_err();
        assert!(matches!(err, ClientError::ManagerNotInitialized));
    }

    #[tokio::test]
    async fn test_batch_publish_rejects_mixed_targets() {
        let manager = PublishManager::disconnected_for_tests(test_config());
        let cancel = CancellationToken::new();

        let batch = vec![
            Message::new(signed_options(), 1, "a"),
            Message::new(
                MessageOptions::new("other.ex", "t.q").with_signature(SignatureType::Plain, "k"),
                1,
                "b",
            ),
        ];
        let err = manager.batch_publish(&cancel, batch).await.unwrap_err();
        assert!(matches!(err, ClientError::BatchInconsistent));
    }

    #[tokio::test]
    async fn test_batch_publish_empty_is_noop() {
        let manager = PublishManager::disconnected_for_tests(test_config());
        let cancel = CancellationToken::new();
        manager.batch_publish(&cancel, Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_validates_options() {
        let manager = PublishManager::disconnected_for_tests(test_config());
        let cancel = CancellationToken::new();

        let bad = Message::new(MessageOptions::new("", "q"), 1, "x");
        let err = manager.publish_message(&cancel, bad).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = PublishManager::disconnected_for_tests(test_config());
        manager.close().await.unwrap();
        manager.close().await.unwrap();

        let cancel = CancellationToken::new();
        let err = manager.publish(&cancel, "e", "q", 1, "x").await.unwrap_err();
        assert!(matches!(err, ClientError::ManagerClosed));
    }

    #[test]
    fn test_build_properties() {
        let mut message = Message::new(signed_options(), 1, "x").with_priority(9).with_delay(2);
        preprocess_message(&mut message, None).unwrap();

        let properties = build_properties(&message);
        assert_eq!(properties.priority(), &Some(9));
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some(message.nonce.as_str())
        );
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.expiration().as_ref().map(|s| s.as_str()),
            Some("2000")
        );
        assert_eq!(
            properties.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
    }

    #[test]
    fn test_mode_from_options() {
        assert_eq!(PublishMode::for_options(&signed_options()), PublishMode::Confirm);
        assert_eq!(
            PublishMode::for_options(&signed_options().with_transaction(true)),
            PublishMode::Transaction
        );
        assert_eq!(
            PublishMode::for_options(&signed_options().with_kind(ExchangeType::Topic)),
            PublishMode::Confirm
        );
    }
}
