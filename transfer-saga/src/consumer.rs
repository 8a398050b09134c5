//! Bank-side message handler

use crate::{destination::DestinationSaga, origin::OriginSaga};
use async_trait::async_trait;
use message_bus::{events::SagaEvent, Message, MessageHandler};
use tracing::debug;

/// Dispatches `forwarded` to the destination role and `completed` to the
/// origin role. Both are idempotent, so redelivery is always safe.
#[derive(Debug, Clone)]
pub struct BankConsumer {
    origin: OriginSaga,
    destination: DestinationSaga,
}

impl BankConsumer {
    /// New consumer over both roles
    pub fn new(origin: OriginSaga, destination: DestinationSaga) -> Self {
        Self {
            origin,
            destination,
        }
    }
}

#[async_trait]
impl MessageHandler for BankConsumer {
    async fn handle(&self, message: Message) -> message_bus::Result<()> {
        debug!(message_id = %message.id, stage = %message.stage, "Bank consumer received message");

        match message.decode()? {
            SagaEvent::Forwarded(event) => {
                self.destination.on_forwarded(&event)?;
            }
            SagaEvent::Completed(result) => {
                self.origin.on_completed(&result)?;
            }
            other => {
                return Err(message_bus::Error::Decode(format!(
                    "bank does not consume {}",
                    other.stage()
                )));
            }
        }
        Ok(())
    }
}
