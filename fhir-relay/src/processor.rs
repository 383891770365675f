use fhir_common::filter::TemporalFilter;
use tracing::{debug, error};

use crate::forwarder::Forwarder;
use crate::message::Message;

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No payload, nothing to forward.
    Tombstone,
    /// Rejected by the temporal filter, deliberately skipped.
    Filtered,
    Forwarded,
    Failed,
}

impl Outcome {
    /// Whether the message is done with and its offset may be stored.
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Tombstone => "tombstone",
            Outcome::Filtered => "filtered",
            Outcome::Forwarded => "forwarded",
            Outcome::Failed => "failed",
        }
    }
}

/// Decides, for every consumed message, whether to skip it or forward it.
/// Shared by all partition workers.
pub struct Processor {
    forwarder: Forwarder,
    filter: Option<TemporalFilter>,
}

impl Processor {
    pub fn new(forwarder: Forwarder, filter: Option<TemporalFilter>) -> Self {
        Self { forwarder, filter }
    }

    pub async fn process(&self, message: &Message) -> bool {
        self.handle(message).await.is_success()
    }

    pub async fn handle(&self, message: &Message) -> Outcome {
        let outcome = match &message.value {
            None => Outcome::Tombstone,
            Some(payload) => {
                if self.filter.as_ref().is_some_and(|filter| !filter.accepts(payload)) {
                    Outcome::Filtered
                } else if self.forwarder.send(payload).await {
                    Outcome::Forwarded
                } else {
                    Outcome::Failed
                }
            }
        };

        match outcome {
            Outcome::Failed => error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                key = %message.key_str(),
                "failed to forward message"
            ),
            _ => debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                key = %message.key_str(),
                outcome = outcome.as_str(),
                "processed message"
            ),
        }
        metrics::counter!("fhir_messages_total", "outcome" => outcome.as_str()).increment(1);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use fhir_common::filter::{Comparator, DateFilterConfig};
    use fhir_common::retry::RetryPolicy;
    use httpmock::prelude::*;
    use std::time::Duration;

    const ACCEPTED: &str = r#"{"resourceType": "Bundle", "entry": [{"response": {"status": "201 Created"}}]}"#;

    const PROCEDURE_2023: &str = r#"{
        "resourceType": "Bundle",
        "entry": [{"resource": {"resourceType": "Procedure", "recordedDate": "2023-02-20T10:00:00+01:00"}}]
    }"#;

    const ENCOUNTER_2018: &str = r#"{
        "resourceType": "Bundle",
        "entry": [{"resource": {
            "resourceType": "Encounter",
            "period": {"start": "2018-02-28T08:00:00+01:00", "end": "2018-03-10T17:00:00+01:00"}
        }}]
    }"#;

    fn processor(server: &MockServer, filter: Option<(&str, &str)>) -> Processor {
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

        let filter = filter.map(|(date, comparator)| {
            let config = DateFilterConfig::new(
                NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("invalid date"),
                comparator.parse::<Comparator>().expect("invalid comparator"),
            );
            TemporalFilter::new(&config).expect("invalid filter")
        });

        Processor::new(forwarder, filter)
    }

    fn message(value: Option<&str>) -> Message {
        Message::new("fhir.bundles", 0, 12, b"patient-1", value.map(str::as_bytes))
    }

    #[tokio::test]
    async fn test_forwards_without_filter() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(200).body(ACCEPTED);
            })
            .await;

        let processor = processor(&server, None);

        assert_eq!(
            processor.handle(&message(Some(PROCEDURE_2023))).await,
            Outcome::Forwarded
        );
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_filtered_bundle_is_skipped() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(200).body(ACCEPTED);
            })
            .await;

        let processor = processor(&server, Some(("2018-03-01", "<")));

        assert!(processor.process(&message(Some(PROCEDURE_2023))).await);
        assert_eq!(
            processor.handle(&message(Some(PROCEDURE_2023))).await,
            Outcome::Filtered
        );
        assert_eq!(mock.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_period_overlapping_threshold_is_forwarded() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir").body(ENCOUNTER_2018);
                then.status(200).body(ACCEPTED);
            })
            .await;

        let processor = processor(&server, Some(("2018-03-01", ">")));

        assert_eq!(
            processor.handle(&message(Some(ENCOUNTER_2018))).await,
            Outcome::Forwarded
        );
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_embedded_rejection_fails() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(200).body(
                    r#"{"resourceType": "Bundle", "entry": [{"response": {"status": "422 Unprocessable Entity"}}]}"#,
                );
            })
            .await;

        let processor = processor(&server, None);

        assert!(!processor.process(&message(Some(PROCEDURE_2023))).await);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_tombstone_is_skipped() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/fhir");
                then.status(200).body(ACCEPTED);
            })
            .await;

        for filter in [None, Some(("2018-03-01", ">"))] {
            let processor = processor(&server, filter);
            assert_eq!(processor.handle(&message(None)).await, Outcome::Tombstone);
        }
        assert_eq!(mock.hits_async().await, 0);
    }

    #[test]
    fn test_only_failures_block_the_offset() {
        assert!(Outcome::Tombstone.is_success());
        assert!(Outcome::Filtered.is_success());
        assert!(Outcome::Forwarded.is_success());
        assert!(!Outcome::Failed.is_success());
    }
}
