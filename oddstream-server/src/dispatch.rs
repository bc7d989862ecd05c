//! Bridges bus events into the hub.

use async_trait::async_trait;

use oddstream_realtime::broker::{Dispatcher, Event};
use oddstream_realtime::ws::BroadcastMessage;
use oddstream_realtime::Hub;

/// Publishes every bus event as a broadcast on the topic's channel.
pub struct HubDispatcher {
    hub: Hub,
}

impl HubDispatcher {
    /// Creates a dispatcher forwarding into the given hub.
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Dispatcher for HubDispatcher {
    async fn dispatch(&self, event: Event) {
        // Awaiting here is the backpressure path: a full hub queue throttles
        // the consumer loop that called us.
        self.hub.publish(to_broadcast(event)).await;
    }
}

fn to_broadcast(event: Event) -> BroadcastMessage {
    BroadcastMessage {
        channel: event.topic,
        payload: event.payload,
        timestamp: event.timestamp,
    }
}
