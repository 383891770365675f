pub mod config;
pub mod consumer;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod kafka_consumer;
pub mod message;
pub mod processor;
pub mod shutdown;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod worker;
