//! Clearing-side message handler

use crate::clearing::ClearingEngine;
use async_trait::async_trait;
use message_bus::{events::SagaEvent, Message, MessageHandler};
use tracing::debug;

/// Dispatches `initiated` and `processed` to the clearing engine
#[derive(Debug, Clone)]
pub struct ClearingConsumer {
    engine: ClearingEngine,
}

impl ClearingConsumer {
    /// New consumer
    pub fn new(engine: ClearingEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageHandler for ClearingConsumer {
    async fn handle(&self, message: Message) -> message_bus::Result<()> {
        debug!(message_id = %message.id, stage = %message.stage, "Clearing consumer received message");

        match message.decode()? {
            SagaEvent::Initiated(event) => {
                self.engine.on_initiated(&event)?;
            }
            SagaEvent::Processed(result) => {
                self.engine.on_processed(&result)?;
            }
            other => {
                return Err(message_bus::Error::Decode(format!(
                    "clearing does not consume {}",
                    other.stage()
                )));
            }
        }
        Ok(())
    }
}
