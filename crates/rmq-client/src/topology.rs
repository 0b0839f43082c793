//! Exchange/queue topology declaration.
//!
//! Declaration order: primary exchange, optional dead-letter exchange +
//! queue + binding, primary queue (carrying the DLX arguments when
//! configured), primary binding. Every step is fatal; the caller is
//! responsible for closing the partially built channel.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tracing::debug;

use rmq_common::{ExchangeType, MessageOptions};

use crate::error::{ClientError, Result};

/// Snapshot of a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u32,
    pub consumers: u32,
}

impl From<lapin::Queue> for QueueInfo {
    fn from(queue: lapin::Queue) -> Self {
        Self {
            name: queue.name().as_str().to_string(),
            messages: queue.message_count(),
            consumers: queue.consumer_count(),
        }
    }
}

pub(crate) fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Fanout => ExchangeKind::Fanout,
    }
}

/// Declare the endpoint's full topology on `channel`.
pub(crate) async fn declare_topology(channel: &Channel, options: &MessageOptions) -> Result<QueueInfo> {
    channel
        .exchange_declare(
            &options.exchange,
            exchange_kind(options.kind),
            ExchangeDeclareOptions {
                durable: options.durable,
                auto_delete: options.auto_delete,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| ClientError::ExchangePrepareFailed(e.into()))?;

    let mut queue_args = FieldTable::default();
    if let Some(dlx) = &options.dlx {
        channel
            .exchange_declare(
                &dlx.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: options.durable, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::DlxFailed(e.into()))?;

        channel
            .queue_declare(
                &dlx.queue,
                QueueDeclareOptions { durable: options.durable, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::DlxFailed(e.into()))?;

        channel
            .queue_bind(
                &dlx.queue,
                &dlx.exchange,
                &dlx.router,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::DlxFailed(e.into()))?;

        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.exchange.clone().into()),
        );
        queue_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlx.router.clone().into()),
        );
    }

    let queue = channel
        .queue_declare(
            &options.queue,
            QueueDeclareOptions {
                durable: options.durable,
                auto_delete: options.auto_delete,
                exclusive: options.exclusive,
                ..Default::default()
            },
            queue_args,
        )
        .await
        .map_err(|e| ClientError::QueuePrepareFailed(e.into()))?;

    channel
        .queue_bind(
            &options.queue,
            &options.exchange,
            &options.router,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| ClientError::QueuePrepareFailed(e.into()))?;

    debug!(
        exchange = %options.exchange,
        queue = %options.queue,
        router = %options.router,
        kind = %options.kind,
        dlx = options.dlx.is_some(),
        "declared endpoint topology"
    );

    Ok(queue.into())
}

/// Inspect a queue without mutating topology (passive declare).
pub(crate) async fn inspect_queue(channel: &Channel, queue: &str) -> Result<QueueInfo> {
    let queue = channel
        .queue_declare(
            queue,
            QueueDeclareOptions { passive: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|e| ClientError::QueuePrepareFailed(e.into()))?;
    Ok(queue.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert_eq!(exchange_kind(ExchangeType::Direct), ExchangeKind::Direct);
        assert_eq!(exchange_kind(ExchangeType::Topic), ExchangeKind::Topic);
        assert_eq!(exchange_kind(ExchangeType::Headers), ExchangeKind::Headers);
        assert_eq!(exchange_kind(ExchangeType::Fanout), ExchangeKind::Fanout);
    }
}
