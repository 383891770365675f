use std::sync::Arc;
use std::time;

use fhir_common::health::{ComponentStatus, HealthHandle};
use tracing::{debug, error, info, warn};

use crate::consumer::{ConsumerFactory, TopicConsumer};
use crate::error::{ConsumerError, WorkerError};
use crate::processor::Processor;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Subscribing,
    Polling,
    Processing,
    Draining,
    Unsubscribing,
    Committing,
    Closed,
}

/// Summary of a finished worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub topic: String,
    pub client_id: String,
    /// Last offset stored for commit, i.e. the next offset the group will consume.
    pub last_stored_offset: Option<i64>,
    /// Messages handled successfully, whether forwarded or skipped.
    pub processed: u64,
}

struct WorkerState<C> {
    consumer: C,
    phase: WorkerPhase,
    last_stored_offset: Option<i64>,
    processed: u64,
}

/// Consumes a single topic: polls messages, hands them to the `Processor` and stores
/// the offset of every message the processor is done with.
///
/// A failed message is never stored. The worker raises the shared shutdown instead, so
/// that every worker drains and commits what it already stored, and the failed message
/// is consumed again on restart.
pub struct PartitionWorker<F: ConsumerFactory> {
    topic: String,
    client_id: String,
    factory: Arc<F>,
    processor: Arc<Processor>,
    shutdown: ShutdownCoordinator,
    poll_timeout: time::Duration,
    /// The liveness check handle, reported on every poll loop iteration.
    liveness: HealthHandle,
}

impl<F: ConsumerFactory> PartitionWorker<F> {
    pub fn new(
        topic: &str,
        client_id: &str,
        factory: Arc<F>,
        processor: Arc<Processor>,
        shutdown: ShutdownCoordinator,
        poll_timeout: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            client_id: client_id.to_owned(),
            factory,
            processor,
            shutdown,
            poll_timeout,
            liveness,
        }
    }

    pub async fn run(self) -> Result<WorkerReport, WorkerError> {
        let mut state = self.subscribe()?;

        self.consume(&mut state).await;

        Ok(self.close(state).await)
    }

    fn subscribe(&self) -> Result<WorkerState<F::Consumer>, WorkerError> {
        debug!(topic = %self.topic, client_id = %self.client_id, phase = ?WorkerPhase::Subscribing, "subscribing");

        match self.factory.subscribe(&self.topic, &self.client_id) {
            Ok(consumer) => {
                info!(topic = %self.topic, client_id = %self.client_id, "subscribed");
                Ok(WorkerState {
                    consumer,
                    phase: WorkerPhase::Subscribing,
                    last_stored_offset: None,
                    processed: 0,
                })
            }
            Err(error) => {
                error!(topic = %self.topic, client_id = %self.client_id, %error, "failed to subscribe");
                self.liveness.report_status(ComponentStatus::Stopped);
                self.shutdown.raise(ShutdownReason::Subscribe {
                    topic: self.topic.clone(),
                });
                Err(WorkerError::Subscribe {
                    client_id: self.client_id.clone(),
                    error,
                })
            }
        }
    }

    async fn consume(&self, state: &mut WorkerState<F::Consumer>) {
        while !self.shutdown.is_raised() {
            self.transition(state, WorkerPhase::Polling);
            self.liveness.report_healthy();

            let message = match state.consumer.poll(self.poll_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(ConsumerError::Recoverable(reason)) => {
                    error!(topic = %self.topic, client_id = %self.client_id, %reason, "consumer error");
                    continue;
                }
                Err(error @ ConsumerError::Evicted(_)) => {
                    error!(topic = %self.topic, client_id = %self.client_id, %error, "consumer evicted from group");
                    self.shutdown.raise(ShutdownReason::ConsumerEvicted {
                        topic: self.topic.clone(),
                    });
                    break;
                }
                Err(error) => {
                    error!(topic = %self.topic, client_id = %self.client_id, %error, "fatal consumer error");
                    self.shutdown.raise(ShutdownReason::ConsumerFatal {
                        topic: self.topic.clone(),
                    });
                    break;
                }
            };

            self.transition(state, WorkerPhase::Processing);
            if !self.processor.process(&message).await {
                self.shutdown.raise(ShutdownReason::ForwardingFailed {
                    topic: self.topic.clone(),
                    offset: message.offset,
                });
                break;
            }

            state.processed += 1;
            match state.consumer.store_offset(&message) {
                Ok(()) => state.last_stored_offset = Some(message.offset + 1),
                Err(error) => warn!(
                    topic = %self.topic,
                    partition = message.partition,
                    offset = message.offset,
                    %error,
                    "failed to store offset"
                ),
            }
        }

        self.transition(state, WorkerPhase::Draining);
    }

    async fn close(&self, mut state: WorkerState<F::Consumer>) -> WorkerReport {
        self.transition(&mut state, WorkerPhase::Unsubscribing);
        if let Err(error) = state.consumer.unsubscribe() {
            warn!(topic = %self.topic, client_id = %self.client_id, %error, "failed to unsubscribe");
        }

        self.transition(&mut state, WorkerPhase::Committing);
        match state.consumer.commit().await {
            Ok(()) => info!(
                topic = %self.topic,
                client_id = %self.client_id,
                offset = ?state.last_stored_offset,
                "committed stored offsets"
            ),
            Err(ConsumerError::NoOffset) => {
                debug!(topic = %self.topic, client_id = %self.client_id, "no offsets to commit")
            }
            Err(error) => {
                error!(topic = %self.topic, client_id = %self.client_id, %error, "failed to commit offsets")
            }
        }

        self.transition(&mut state, WorkerPhase::Closed);
        self.liveness.report_status(ComponentStatus::Stopped);

        let WorkerState {
            consumer,
            last_stored_offset,
            processed,
            ..
        } = state;
        drop(consumer);

        WorkerReport {
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
            last_stored_offset,
            processed,
        }
    }

    fn transition(&self, state: &mut WorkerState<F::Consumer>, phase: WorkerPhase) {
        if state.phase != phase {
            debug!(topic = %self.topic, client_id = %self.client_id, from = ?state.phase, to = ?phase, "worker phase");
            state.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::Forwarder;
    use crate::message::Message;
    use crate::test_utils::MockConsumerFactory;
    use fhir_common::health::HealthRegistry;
    use fhir_common::retry::RetryPolicy;
    use httpmock::prelude::*;
    use std::time::Duration;

    const TOPIC: &str = "fhir.bundles";
    const ACCEPTED: &str = r#"{"resourceType": "Bundle", "entry": [{"response": {"status": "201 Created"}}]}"#;
    const REJECTED: &str = r#"{"resourceType": "Bundle", "entry": [{"response": {"status": "422 Unprocessable Entity"}}]}"#;

    fn processor(server: &MockServer) -> Arc<Processor> {
        let forwarder = Forwarder::new(
            server.url("/fhir").parse().expect("invalid url"),
            None,
            RetryPolicy::new(
                1,
                Duration::from_secs(5),
                Duration::from_millis(10),
                Duration::from_millis(10),
            ),
        )
        .expect("failed to build forwarder");
        Arc::new(Processor::new(forwarder, None))
    }

    fn worker(
        factory: &Arc<MockConsumerFactory>,
        server: &MockServer,
        shutdown: &ShutdownCoordinator,
        registry: &HealthRegistry,
    ) -> PartitionWorker<MockConsumerFactory> {
        PartitionWorker::new(
            TOPIC,
            "1",
            factory.clone(),
            processor(server),
            shutdown.clone(),
            Duration::from_millis(50),
            registry.register("worker-1".to_owned(), ::time::Duration::seconds(30)),
        )
    }

    async fn wait_for_stored(factory: &MockConsumerFactory, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.log(TOPIC).stored_offsets.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offsets were not stored in time");
    }

    #[tokio::test]
    async fn test_stores_offsets_and_commits_on_signal() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(200).body(ACCEPTED);
            })
            .await;
        let factory = Arc::new(MockConsumerFactory::new().with_messages(
            TOPIC,
            10,
            &[Some("{}"), None, Some("{}")],
        ));
        let shutdown = ShutdownCoordinator::new();
        let registry = HealthRegistry::new("liveness");

        let handle = tokio::spawn(worker(&factory, &server, &shutdown, &registry).run());
        wait_for_stored(&factory, 3).await;
        assert!(registry.get_status().healthy);

        shutdown.raise(ShutdownReason::Signal);
        let report = handle
            .await
            .expect("worker panicked")
            .expect("worker failed");

        assert_eq!(
            report,
            WorkerReport {
                topic: TOPIC.to_owned(),
                client_id: "1".to_owned(),
                last_stored_offset: Some(13),
                processed: 3,
            }
        );
        let log = factory.log(TOPIC);
        assert_eq!(log.stored_offsets, vec![11, 12, 13]);
        assert!(log.unsubscribed);
        assert_eq!(log.committed_offsets, Some(vec![11, 12, 13]));
        // The tombstone is never forwarded.
        assert_eq!(mock.hits_async().await, 2);
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_failure_stops_without_storing_the_offset() {
        let server = MockServer::start_async().await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir").body("first");
                then.status(200).body(ACCEPTED);
            })
            .await;
        let rejected = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir").body("second");
                then.status(200).body(REJECTED);
            })
            .await;
        let factory = Arc::new(MockConsumerFactory::new().with_messages(
            TOPIC,
            10,
            &[Some("first"), Some("second"), Some("third")],
        ));
        let shutdown = ShutdownCoordinator::new();
        let registry = HealthRegistry::new("liveness");

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            worker(&factory, &server, &shutdown, &registry).run(),
        )
        .await
        .expect("worker did not stop")
        .expect("worker failed");

        assert_eq!(report.last_stored_offset, Some(11));
        assert_eq!(report.processed, 1);
        assert_eq!(
            shutdown.reason(),
            Some(&ShutdownReason::ForwardingFailed {
                topic: TOPIC.to_owned(),
                offset: 11,
            })
        );

        let log = factory.log(TOPIC);
        assert_eq!(log.stored_offsets, vec![11]);
        assert_eq!(log.committed_offsets, Some(vec![11]));
        assert_eq!(accepted.hits_async().await, 1);
        assert_eq!(rejected.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_first_failure_commits_nothing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(500);
            })
            .await;
        let factory = Arc::new(MockConsumerFactory::new().with_messages(TOPIC, 0, &[Some("{}")]));
        let shutdown = ShutdownCoordinator::new();
        let registry = HealthRegistry::new("liveness");

        let report = worker(&factory, &server, &shutdown, &registry)
            .run()
            .await
            .expect("worker failed");

        assert_eq!(report.last_stored_offset, None);
        let log = factory.log(TOPIC);
        assert!(log.stored_offsets.is_empty());
        assert!(log.unsubscribed);
        assert_eq!(log.committed_offsets, None);
        assert!(shutdown.reason().is_some_and(ShutdownReason::is_failure));
    }

    #[tokio::test]
    async fn test_subscribe_failure_raises_shutdown() {
        let server = MockServer::start_async().await;
        let factory = Arc::new(MockConsumerFactory::new().unavailable(TOPIC));
        let shutdown = ShutdownCoordinator::new();
        let registry = HealthRegistry::new("liveness");

        let result = worker(&factory, &server, &shutdown, &registry).run().await;

        assert!(matches!(result, Err(WorkerError::Subscribe { .. })));
        assert_eq!(
            shutdown.reason(),
            Some(&ShutdownReason::Subscribe {
                topic: TOPIC.to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_recoverable_errors_are_skipped() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(200);
            })
            .await;
        let factory = Arc::new(MockConsumerFactory::new().with_polls(
            TOPIC,
            [
                Err(ConsumerError::Recoverable("broker transport failure".to_owned())),
                Ok(Some(Message::new(TOPIC, 0, 5, b"key", Some(b"{}")))),
                Err(ConsumerError::Evicted("max poll interval exceeded".to_owned())),
                Ok(Some(Message::new(TOPIC, 0, 6, b"key", Some(b"{}")))),
            ],
        ));
        let shutdown = ShutdownCoordinator::new();
        let registry = HealthRegistry::new("liveness");

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            worker(&factory, &server, &shutdown, &registry).run(),
        )
        .await
        .expect("worker did not stop")
        .expect("worker failed");

        assert_eq!(report.last_stored_offset, Some(6));
        assert_eq!(
            shutdown.reason(),
            Some(&ShutdownReason::ConsumerEvicted {
                topic: TOPIC.to_owned()
            })
        );
        assert_eq!(factory.log(TOPIC).polls, 3);
    }

    #[tokio::test]
    async fn test_already_raised_shutdown_skips_polling() {
        let server = MockServer::start_async().await;
        let factory = Arc::new(MockConsumerFactory::new().with_messages(TOPIC, 0, &[Some("{}")]));
        let shutdown = ShutdownCoordinator::new();
        let registry = HealthRegistry::new("liveness");
        shutdown.raise(ShutdownReason::Signal);

        let report = worker(&factory, &server, &shutdown, &registry)
            .run()
            .await
            .expect("worker failed");

        assert_eq!(report.processed, 0);
        let log = factory.log(TOPIC);
        assert_eq!(log.polls, 0);
        assert!(log.unsubscribed);
        assert_eq!(log.committed_offsets, None);
    }
}
