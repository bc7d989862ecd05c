//! Upstream bus consumer.
//!
//! One Kafka consumer per configured topic, all in the same consumer group.
//! Each topic loop delivers every message to the [`Dispatcher`] exactly once
//! and commits the offset afterwards: delivery to the hub is at-least-once,
//! the commit attempt per message at-most-once. Per-partition ordering is
//! preserved end-to-end; nothing is promised across partitions or topics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rdkafka::{
    ClientConfig, Message, Timestamp,
    consumer::{CommitMode, Consumer, StreamConsumer},
};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::RealtimeError;
use crate::shutdown::ShutdownController;

/// A bus message delivered to the dispatcher.
///
/// The payload is copied out of the consumer's buffer before dispatch, so
/// the event may outlive the underlying message.
#[derive(Debug, Clone)]
pub struct Event {
    /// Source topic (equals the channel name downstream)
    pub topic: String,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Broker timestamp, or receive time when the broker supplies none
    pub timestamp: DateTime<Utc>,
}

/// Forwards events to a downstream consumer, one call per message.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Handles a single event. Called in per-partition order.
    async fn dispatch(&self, event: Event);
}

/// Kafka consumer fanning messages out to the dispatcher.
pub struct BusConsumer {
    consumers: Vec<Arc<StreamConsumer>>,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown_timeout: Duration,
}

impl BusConsumer {
    /// Creates one consumer per topic and subscribes each.
    ///
    /// # Errors
    ///
    /// Returns an error if a consumer cannot be created or subscribed.
    pub fn new(
        brokers: &[String],
        group_id: &str,
        topics: &[String],
        dispatcher: Arc<dyn Dispatcher>,
        shutdown_timeout: Duration,
    ) -> Result<Self, RealtimeError> {
        let mut consumers = Vec::with_capacity(topics.len());
        for topic in topics {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", brokers.join(","))
                .set("group.id", group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "latest")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| RealtimeError::Bus(e.to_string()))?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| RealtimeError::Bus(e.to_string()))?;

            consumers.push(Arc::new(consumer));
        }

        Ok(Self {
            consumers,
            dispatcher,
            shutdown_timeout,
        })
    }

    /// Runs one fetch loop per topic until shutdown is initiated, then waits
    /// for the loops to drain within the configured deadline.
    pub async fn start(&self, shutdown: ShutdownController) {
        let mut tasks = JoinSet::new();
        for consumer in &self.consumers {
            tasks.spawn(consume_topic(
                Arc::clone(consumer),
                Arc::clone(&self.dispatcher),
                shutdown.subscribe(),
            ));
        }

        shutdown.wait_for_shutdown().await;

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("timed out waiting for bus consumers to stop");
            tasks.abort_all();
        }
    }

    /// Releases consumer subscriptions. Idempotent; safe to call after
    /// [`BusConsumer::start`] has returned. Remaining resources are freed
    /// on drop.
    pub fn close(&self) {
        for consumer in &self.consumers {
            consumer.unsubscribe();
        }
    }
}

async fn consume_topic(
    consumer: Arc<StreamConsumer>,
    dispatcher: Arc<dyn Dispatcher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown_rx.recv() => return,
            received = consumer.recv() => match received {
                Ok(message) => message,
                Err(e) => {
                    // Transient; the driver backs off internally.
                    warn!(error = %e, "error fetching message from bus");
                    continue;
                }
            },
        };

        let event = Event {
            topic: message.topic().to_string(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: event_timestamp(message.timestamp()),
        };
        debug!(topic = %event.topic, partition = event.partition, offset = event.offset, "dispatching bus message");

        dispatcher.dispatch(event).await;

        // The dispatcher already ran; a failed commit means a possible
        // duplicate after restart, never a loss.
        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(error = %e, "failed to commit message offset");
        }
    }
}

fn event_timestamp(timestamp: Timestamp) -> DateTime<Utc> {
    timestamp
        .to_millis()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now)
}
