//! RelayMQ — resilient AMQP 0-9-1 publish/subscribe client.
//!
//! One broker connection per named data source, many logical publishing
//! endpoints multiplexed over it. The library hides connection and channel
//! lifecycle: liveness monitoring, exponential-backoff reconnection,
//! topology redeclaration after loss, publisher confirms, transactional
//! batching, and consumer delivery with verification and bounded retry.
//!
//! ```rust,ignore
//! use rmq_client::{AmqpConfig, PublishManager};
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = PublishManager::new(AmqpConfig {
//!     host: "broker.internal".into(),
//!     secret_key: Some("shared-secret".into()),
//!     ..AmqpConfig::default()
//! })
//! .await?;
//!
//! let cancel = CancellationToken::new();
//! manager.publish(&cancel, "orders.ex", "orders.q", 1, "payload").await?;
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod topology;

mod connection;
mod endpoint;

pub use config::AmqpConfig;
pub use consumer::{MessageHandler, PullManager, ReceiverConfig};
pub use error::{ClientError, Result, TransportError, TransportKind};
pub use publisher::PublishManager;
pub use registry::{get_publish_manager, get_pull_manager};
pub use topology::QueueInfo;

// Re-export the shared message model so applications depend on one crate.
pub use rmq_common::{
    DlxConfig, ExchangeType, Message, MessageOptions, SignatureType,
};
