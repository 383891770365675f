use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Enumeration of errors related to loading the relay configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load env file {path}: {source}")]
    EnvFile {
        path: String,
        source: dotenvy::Error,
    },
    #[error("invalid environment: {0}")]
    Env(#[from] envconfig::Error),
}

/// Enumeration of errors returned by a `TopicConsumer`.
///
/// Poll errors are classified by how the worker must react: `Recoverable` errors are
/// retried internally by the client, `Evicted` and `Fatal` stop the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("consumer error: {0}")]
    Recoverable(String),
    #[error("consumer left the group: {0}")]
    Evicted(String),
    #[error("fatal consumer error: {0}")]
    Fatal(String),
    #[error("failed to store offset: {0}")]
    Store(String),
    #[error("failed to unsubscribe: {0}")]
    Unsubscribe(String),
    #[error("no stored offsets to commit")]
    NoOffset,
    #[error("failed to commit offsets: {0}")]
    Commit(String),
}

impl ConsumerError {
    /// Classify an error returned while receiving messages.
    pub fn from_poll(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            // Exceeding max.poll.interval.ms makes the client leave the consumer group.
            Some(RDKafkaErrorCode::PollExceeded) => ConsumerError::Evicted(error.to_string()),
            Some(RDKafkaErrorCode::Fatal) => ConsumerError::Fatal(error.to_string()),
            Some(_) => ConsumerError::Recoverable(error.to_string()),
            None => ConsumerError::Fatal(error.to_string()),
        }
    }

    pub fn from_commit(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::NoOffset) => ConsumerError::NoOffset,
            _ => ConsumerError::Commit(error.to_string()),
        }
    }
}

/// Enumeration of errors related to building the `Forwarder`.
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("basic auth credentials cannot be used as a header value")]
    InvalidCredentials(#[from] reqwest::header::InvalidHeaderValue),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Enumeration of errors that end a partition worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker {client_id} could not subscribe: {error}")]
    Subscribe {
        client_id: String,
        error: ConsumerError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_poll_errors() {
        assert!(matches!(
            ConsumerError::from_poll(KafkaError::MessageConsumption(
                RDKafkaErrorCode::PollExceeded
            )),
            ConsumerError::Evicted(_)
        ));
        assert!(matches!(
            ConsumerError::from_poll(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure
            )),
            ConsumerError::Recoverable(_)
        ));
        assert!(matches!(
            ConsumerError::from_poll(KafkaError::MessageConsumption(RDKafkaErrorCode::Fatal)),
            ConsumerError::Fatal(_)
        ));
        assert!(matches!(
            ConsumerError::from_poll(KafkaError::Canceled),
            ConsumerError::Fatal(_)
        ));
    }

    #[test]
    fn test_classify_commit_errors() {
        assert_eq!(
            ConsumerError::from_commit(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)),
            ConsumerError::NoOffset
        );
        assert!(matches!(
            ConsumerError::from_commit(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RequestTimedOut
            )),
            ConsumerError::Commit(_)
        ));
    }
}
