//! The boundary between partition workers and the stream broker.
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConsumerError;
use crate::message::Message;

/// A subscription to a single topic, owned by exactly one partition worker.
///
/// Offsets are stored explicitly through `store_offset` and committed periodically by
/// the underlying client, plus once synchronously through `commit` at shutdown.
#[async_trait]
pub trait TopicConsumer: Send {
    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>, ConsumerError>;

    /// Mark a processed message as safe to commit.
    fn store_offset(&mut self, message: &Message) -> Result<(), ConsumerError>;

    fn unsubscribe(&mut self) -> Result<(), ConsumerError>;

    /// Synchronously commit every stored offset, without blocking the runtime.
    /// `ConsumerError::NoOffset` when there was nothing to commit.
    async fn commit(&mut self) -> Result<(), ConsumerError>;
}

/// Creates subscribed consumers, one per worker.
pub trait ConsumerFactory: Send + Sync {
    type Consumer: TopicConsumer + 'static;

    fn subscribe(&self, topic: &str, client_id: &str) -> Result<Self::Consumer, ConsumerError>;
}
