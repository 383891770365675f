use std::borrow::Cow;

/// A record read from an input topic, detached from the consumer that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    /// `None` for a tombstone.
    pub value: Option<Vec<u8>>,
}

impl Message {
    pub fn new(
        topic: &str,
        partition: i32,
        offset: i64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        }
    }

    /// Build a `Message` from anything rdkafka hands out, borrowed or owned.
    pub fn from_kafka<M: rdkafka::Message>(message: &M) -> Self {
        Self::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.key().unwrap_or_default(),
            message.payload(),
        )
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// The key for logging purposes.
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}
