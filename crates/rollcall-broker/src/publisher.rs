//! Publisher seam between the daemons and the broker.

use async_trait::async_trait;
use lapin::BasicProperties;
use rollcall_core::error::Result;

use crate::event::Event;

/// Sends messages to the primary exchange.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish raw bytes with the given routing key and properties.
    /// Returns only after the broker has accepted the message.
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()>;

    /// Publish a domain event, routed by its event type.
    async fn publish_event(&self, event: &Event) -> Result<()> {
        let body = event.to_bytes()?;
        self.publish(event.routing_key(), &body, event.properties())
            .await
    }
}
