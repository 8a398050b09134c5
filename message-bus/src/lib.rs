//! Message Bus with NATS support
//!
//! Carries saga events between participants:
//! - Four stages (`initiated`, `forwarded`, `processed`, `completed`), one
//!   JetStream stream each
//! - Partitioning by institution id, ordered per key
//! - Per-stage typed payloads decoded by stage name
//! - Retry logic with exponential backoff, broker dedup on message id
//! - Partitioned worker lanes on the consuming side
//! - An in-memory transport with the same delivery contract
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod events;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod partitioning;
pub mod publisher;
pub mod subscriber;
pub mod transport;
pub mod types;

pub use client::{NatsClient, NatsConfig};
pub use error::{Error, Result};
pub use events::{SagaEvent, TransferForwarded, TransferInitiated, TransferResult};
pub use memory::{InMemoryBus, PumpReport};
pub use message::Message;
pub use publisher::{JetStreamPublisher, PublisherConfig};
pub use subscriber::{Subscriber, SubscriberConfig};
pub use transport::{MessageHandler, Transport};
pub use types::{PartitionKey, Subjects};
