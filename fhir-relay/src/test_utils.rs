//! In-memory consumers to drive partition workers in tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::consumer::{ConsumerFactory, TopicConsumer};
use crate::error::ConsumerError;
use crate::message::Message;

/// Upper bound on how long an idle `MockConsumer` poll pretends to wait.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Everything a worker did with its consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerLog {
    pub polls: usize,
    /// Offsets as handed to the broker, i.e. the next offset to consume.
    pub stored_offsets: Vec<i64>,
    pub unsubscribed: bool,
    /// Offsets included in the final synchronous commit.
    pub committed_offsets: Option<Vec<i64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockConsumer {
    polls: VecDeque<Result<Option<Message>, ConsumerError>>,
    log: Arc<Mutex<ConsumerLog>>,
}

#[async_trait]
impl TopicConsumer for MockConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>, ConsumerError> {
        lock(&self.log).polls += 1;

        match self.polls.pop_front() {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout.min(IDLE_POLL)).await;
                Ok(None)
            }
        }
    }

    fn store_offset(&mut self, message: &Message) -> Result<(), ConsumerError> {
        lock(&self.log).stored_offsets.push(message.offset + 1);
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), ConsumerError> {
        lock(&self.log).unsubscribed = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConsumerError> {
        // Like the broker round trip, give other workers a turn before committing.
        tokio::task::yield_now().await;
        let mut log = lock(&self.log);
        if log.stored_offsets.is_empty() {
            return Err(ConsumerError::NoOffset);
        }
        log.committed_offsets = Some(log.stored_offsets.clone());
        Ok(())
    }
}

/// Hands out `MockConsumer`s replaying scripted poll results, one script per topic.
/// Once its script is exhausted a consumer keeps returning empty polls.
#[derive(Default)]
pub struct MockConsumerFactory {
    scripts: Mutex<HashMap<String, VecDeque<Result<Option<Message>, ConsumerError>>>>,
    logs: Mutex<HashMap<String, Arc<Mutex<ConsumerLog>>>>,
    unavailable: HashSet<String>,
}

impl MockConsumerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue messages with consecutive offsets, starting at `first_offset`.
    pub fn with_messages(self, topic: &str, first_offset: i64, values: &[Option<&str>]) -> Self {
        let polls = values.iter().zip(first_offset..).map(|(value, offset)| {
            Ok(Some(Message::new(
                topic,
                0,
                offset,
                format!("key-{}", offset).as_bytes(),
                value.map(str::as_bytes),
            )))
        });
        self.with_polls(topic, polls)
    }

    pub fn with_polls(
        self,
        topic: &str,
        polls: impl IntoIterator<Item = Result<Option<Message>, ConsumerError>>,
    ) -> Self {
        lock(&self.scripts)
            .entry(topic.to_owned())
            .or_default()
            .extend(polls);
        self
    }

    /// Make subscribing to `topic` fail.
    pub fn unavailable(mut self, topic: &str) -> Self {
        self.unavailable.insert(topic.to_owned());
        self
    }

    pub fn log(&self, topic: &str) -> ConsumerLog {
        lock(&self.logs)
            .get(topic)
            .map(|log| lock(log).clone())
            .unwrap_or_default()
    }
}

impl ConsumerFactory for MockConsumerFactory {
    type Consumer = MockConsumer;

    fn subscribe(&self, topic: &str, _client_id: &str) -> Result<Self::Consumer, ConsumerError> {
        if self.unavailable.contains(topic) {
            return Err(ConsumerError::Subscribe {
                topic: topic.to_owned(),
                reason: "unknown topic".to_owned(),
            });
        }

        let log = Arc::new(Mutex::new(ConsumerLog::default()));
        lock(&self.logs).insert(topic.to_owned(), log.clone());

        Ok(MockConsumer {
            polls: lock(&self.scripts).remove(topic).unwrap_or_default(),
            log,
        })
    }
}
