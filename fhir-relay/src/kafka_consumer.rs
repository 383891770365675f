use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientConfig, TopicPartitionList};
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::consumer::{ConsumerFactory, TopicConsumer};
use crate::error::ConsumerError;
use crate::message::Message;

/// Logs rebalances and background commits of a single worker's consumer.
pub struct RelayContext {
    client_id: String,
}

impl ClientContext for RelayContext {}

impl ConsumerContext for RelayContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(client_id = %self.client_id, "pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(client_id = %self.client_id, "post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(client_id = %self.client_id, "committed offsets {:?}", offsets),
            Err(error) => error!(client_id = %self.client_id, %error, "failed to commit offsets"),
        }
    }
}

pub struct KafkaTopicConsumer {
    consumer: Arc<StreamConsumer<RelayContext>>,
}

#[async_trait]
impl TopicConsumer for KafkaTopicConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>, ConsumerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(Message::from_kafka(&message))),
            Ok(Err(error)) => Err(ConsumerError::from_poll(error)),
            // Not an error, the topic is just quiet.
            Err(_) => Ok(None),
        }
    }

    fn store_offset(&mut self, message: &Message) -> Result<(), ConsumerError> {
        // The stored offset is the next one to consume.
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)
            .map_err(|error| ConsumerError::Store(error.to_string()))
    }

    fn unsubscribe(&mut self) -> Result<(), ConsumerError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConsumerError> {
        // A synchronous commit blocks for the broker round trip, keep it off the runtime.
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit_consumer_state(CommitMode::Sync))
            .await
            .map_err(|error| ConsumerError::Commit(error.to_string()))?
            .map_err(ConsumerError::from_commit)
    }
}

/// Creates one rdkafka consumer per worker, all sharing the consumer group named after
/// the application.
pub struct KafkaConsumerFactory {
    group_id: String,
    config: KafkaConfig,
}

impl KafkaConsumerFactory {
    pub fn new(group_id: &str, config: KafkaConfig) -> Self {
        Self {
            group_id: group_id.to_owned(),
            config,
        }
    }

    pub fn client_config(&self, client_id: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.kafka_bootstrap_servers)
            .set("security.protocol", &self.config.kafka_security_protocol)
            .set("broker.address.family", "v4")
            .set("group.id", &self.group_id)
            .set("client.id", format!("{}-{}", self.group_id, client_id))
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.config.kafka_auto_commit_interval_ms.to_string(),
            )
            // Offsets are stored by the workers once a message is safely handled.
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.config.kafka_offset_reset);

        let ssl = [
            ("ssl.ca.location", &self.config.kafka_ssl_ca_location),
            (
                "ssl.certificate.location",
                &self.config.kafka_ssl_certificate_location,
            ),
            ("ssl.key.location", &self.config.kafka_ssl_key_location),
        ];
        for (key, value) in ssl {
            if let Some(value) = value {
                client_config.set(key, value);
            }
        }
        if let Some(password) = &self.config.kafka_ssl_key_password {
            client_config.set("ssl.key.password", password.expose());
        }

        client_config
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    type Consumer = KafkaTopicConsumer;

    fn subscribe(&self, topic: &str, client_id: &str) -> Result<Self::Consumer, ConsumerError> {
        let subscribe_error = |error: rdkafka::error::KafkaError| ConsumerError::Subscribe {
            topic: topic.to_owned(),
            reason: error.to_string(),
        };

        let consumer: StreamConsumer<RelayContext> = self
            .client_config(client_id)
            .create_with_context(RelayContext {
                client_id: client_id.to_owned(),
            })
            .map_err(subscribe_error)?;
        consumer.subscribe(&[topic]).map_err(subscribe_error)?;

        Ok(KafkaTopicConsumer {
            consumer: Arc::new(consumer),
        })
    }
}
