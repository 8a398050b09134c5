//! Transport seams
//!
//! The saga core needs only two properties from a transport: `publish`
//! resolves after the broker has acknowledged the message, and messages
//! sharing a [`PartitionKey`](crate::PartitionKey) are delivered in publish
//! order. Delivery is at-least-once; handlers deduplicate.

use crate::{message::Message, Result};
use async_trait::async_trait;

/// Outbound side of a transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish and wait for the broker acknowledgement
    async fn publish(&self, message: &Message) -> Result<()>;
}

/// Message handler trait
///
/// `Ok` acknowledges the delivery. An error asks for redelivery, except
/// [`Error::Decode`](crate::Error::Decode), which drops the message for good.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle incoming message
    async fn handle(&self, message: Message) -> Result<()>;
}
