//! The hub: single-owner registry and broadcast dispatcher.
//!
//! All index mutations funnel through one event-loop task, which makes the
//! registry invariants hold at every quiescent point without per-field
//! locking. The auxiliary lock exists only so the fast-path [`Hub::remove`]
//! (called from a client's own teardown) and read-side inspectors can
//! coexist with the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::client::{ClientHandle, ClientId, CloseReason};
use super::message::{BroadcastMessage, encode_outbound};
use crate::shutdown::ShutdownController;

/// Capacity of the control command queue.
const CONTROL_QUEUE: usize = 64;
/// Capacity of the broadcast queue. A full queue makes [`Hub::publish`]
/// await, which throttles the upstream consumer.
const BROADCAST_QUEUE: usize = 256;

enum HubCommand {
    Register(Arc<ClientHandle>),
    Unregister(ClientId),
    Subscribe { client: ClientId, channel: String },
    Unsubscribe { client: ClientId, channel: String },
}

#[derive(Default)]
struct HubIndexes {
    clients: HashMap<ClientId, Arc<ClientHandle>>,
    channel_subscribers: HashMap<String, HashSet<ClientId>>,
    client_subscriptions: HashMap<ClientId, HashSet<String>>,
}

impl HubIndexes {
    /// Removes a client and every subscription it holds. Idempotent; called
    /// from both the loop's unregister case and the fast-path remove.
    fn remove_client(&mut self, id: &ClientId) {
        if self.clients.remove(id).is_none() {
            return;
        }
        if let Some(channels) = self.client_subscriptions.remove(id) {
            for channel in channels {
                if let Some(subscribers) = self.channel_subscribers.get_mut(&channel) {
                    subscribers.remove(id);
                    if subscribers.is_empty() {
                        self.channel_subscribers.remove(&channel);
                    }
                }
            }
        }
    }
}

struct HubShared {
    indexes: RwLock<HubIndexes>,
    allowed_channels: HashSet<String>,
}

impl HubShared {
    fn channel_allowed(&self, channel: &str) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.contains(channel)
    }
}

/// Handle to the hub. Cheap to clone; all mutations are serialized through
/// the event loop owned by the paired [`HubRunner`].
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
    control_tx: mpsc::Sender<HubCommand>,
    broadcast_tx: mpsc::Sender<BroadcastMessage>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Creates a hub and the runner that owns its event loop.
    ///
    /// `allowed_channels` gates both subscription and broadcast; an empty
    /// list means no restriction. Blank entries are dropped.
    #[must_use]
    pub fn new(allowed_channels: &[String]) -> (Self, HubRunner) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);

        let shared = Arc::new(HubShared {
            indexes: RwLock::new(HubIndexes::default()),
            allowed_channels: allowed_channels
                .iter()
                .map(|channel| channel.trim())
                .filter(|channel| !channel.is_empty())
                .map(ToString::to_string)
                .collect(),
        });

        let hub = Self {
            shared: Arc::clone(&shared),
            control_tx,
            broadcast_tx,
        };
        let runner = HubRunner {
            shared,
            control_rx,
            broadcast_rx,
        };

        (hub, runner)
    }

    /// Requests that a client be added to the hub.
    pub async fn register(&self, client: Arc<ClientHandle>) {
        self.send(HubCommand::Register(client)).await;
    }

    /// Requests that a client be removed from the hub.
    pub async fn unregister(&self, client: ClientId) {
        self.send(HubCommand::Unregister(client)).await;
    }

    /// Requests a subscription of `client` to `channel`.
    pub async fn subscribe(&self, client: ClientId, channel: String) {
        self.send(HubCommand::Subscribe { client, channel }).await;
    }

    /// Requests removal of a subscription.
    pub async fn unsubscribe(&self, client: ClientId, channel: String) {
        self.send(HubCommand::Unsubscribe { client, channel }).await;
    }

    /// Enqueues a broadcast for dispatch.
    ///
    /// Awaits when the broadcast queue is full; that backpressure is the
    /// intended throttle on the upstream consumer.
    pub async fn publish(&self, msg: BroadcastMessage) {
        if self.broadcast_tx.send(msg).await.is_err() {
            debug!("hub loop gone, dropping broadcast");
        }
    }

    /// Immediate client removal bypassing the event loop.
    ///
    /// Used by a client's own teardown and during shutdown, when the loop
    /// may no longer be servicing commands. Idempotent.
    pub fn remove(&self, client: &ClientId) {
        self.shared.indexes.write().remove_client(client);
    }

    /// Returns the number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.indexes.read().clients.len()
    }

    /// Returns whether a client is currently registered.
    #[must_use]
    pub fn is_registered(&self, client: &ClientId) -> bool {
        self.shared.indexes.read().clients.contains_key(client)
    }

    /// Returns the number of subscribers of a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .indexes
            .read()
            .channel_subscribers
            .get(channel)
            .map_or(0, HashSet::len)
    }

    /// Returns whether the channel has an entry in the subscriber index.
    ///
    /// An empty subscriber set is never stored, so this is `true` only while
    /// the channel has at least one subscriber.
    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.shared
            .indexes
            .read()
            .channel_subscribers
            .contains_key(channel)
    }

    /// Returns the channels a client is subscribed to.
    #[must_use]
    pub fn subscriptions_of(&self, client: &ClientId) -> Vec<String> {
        self.shared
            .indexes
            .read()
            .client_subscriptions
            .get(client)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn send(&self, command: HubCommand) {
        if self.control_tx.send(command).await.is_err() {
            debug!("hub loop gone, dropping command");
        }
    }
}

/// Owns the hub event loop. Obtained from [`Hub::new`] and driven to
/// completion in its own task.
pub struct HubRunner {
    shared: Arc<HubShared>,
    control_rx: mpsc::Receiver<HubCommand>,
    broadcast_rx: mpsc::Receiver<BroadcastMessage>,
}

impl HubRunner {
    /// Runs the event loop until shutdown is signalled.
    ///
    /// On shutdown every registered client is closed and all indexes are
    /// reset before the loop returns.
    pub async fn run(mut self, shutdown: ShutdownController) {
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            // Control first: a subscribe issued before a publish should be
            // visible to it whenever the loop can arrange that.
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                command = self.control_rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                msg = self.broadcast_rx.recv() => match msg {
                    Some(msg) => self.dispatch(&msg),
                    None => break,
                },
            }
        }

        self.shutdown();
    }

    fn apply(&self, command: HubCommand) {
        match command {
            HubCommand::Register(client) => {
                let mut indexes = self.shared.indexes.write();
                indexes
                    .client_subscriptions
                    .entry(client.id().clone())
                    .or_default();
                indexes.clients.insert(client.id().clone(), client);
            }
            HubCommand::Unregister(client) => {
                self.shared.indexes.write().remove_client(&client);
            }
            HubCommand::Subscribe { client, channel } => {
                let mut indexes = self.shared.indexes.write();
                if !indexes.clients.contains_key(&client) {
                    return;
                }
                if !self.shared.channel_allowed(&channel) {
                    warn!(%client, %channel, "rejecting subscription to unauthorized channel");
                    return;
                }
                indexes
                    .channel_subscribers
                    .entry(channel.clone())
                    .or_default()
                    .insert(client.clone());
                indexes
                    .client_subscriptions
                    .entry(client)
                    .or_default()
                    .insert(channel);
            }
            HubCommand::Unsubscribe { client, channel } => {
                let mut indexes = self.shared.indexes.write();
                if !indexes.clients.contains_key(&client) {
                    return;
                }
                if let Some(subscribers) = indexes.channel_subscribers.get_mut(&channel) {
                    subscribers.remove(&client);
                    if subscribers.is_empty() {
                        indexes.channel_subscribers.remove(&channel);
                    }
                }
                if let Some(channels) = indexes.client_subscriptions.get_mut(&client) {
                    channels.remove(&channel);
                }
            }
        }
    }

    fn dispatch(&self, msg: &BroadcastMessage) {
        if !self.shared.channel_allowed(&msg.channel) {
            warn!(channel = %msg.channel, "dropping message for unauthorized channel");
            return;
        }

        // One encoding per broadcast, shared across subscribers.
        let frame: Utf8Bytes = match encode_outbound(msg) {
            Ok(encoded) => encoded.into(),
            Err(e) => {
                error!(channel = %msg.channel, error = %e, "failed to encode outbound message");
                return;
            }
        };

        let mut evicted: Vec<Arc<ClientHandle>> = Vec::new();
        {
            let indexes = self.shared.indexes.read();
            if let Some(subscribers) = indexes.channel_subscribers.get(&msg.channel) {
                for id in subscribers {
                    let Some(client) = indexes.clients.get(id) else {
                        continue;
                    };
                    if !client.queue(frame.clone()) {
                        evicted.push(Arc::clone(client));
                    }
                }
            }
        }

        // Close outside the index lock; eviction completes when the client's
        // own teardown removes it.
        for client in evicted {
            warn!(client = %client.id(), "dropping client due to backpressure");
            client.close(CloseReason::SlowConsumer);
        }
    }

    fn shutdown(&mut self) {
        let clients: Vec<Arc<ClientHandle>> = {
            let mut indexes = self.shared.indexes.write();
            let clients = std::mem::take(&mut indexes.clients);
            indexes.channel_subscribers.clear();
            indexes.client_subscriptions.clear();
            clients.into_values().collect()
        };

        for client in clients {
            client.close(CloseReason::Normal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::{mpsc::Receiver, watch};

    use super::super::client::Outbound;

    fn spawn_hub(allowed: &[&str]) -> (Hub, ShutdownController) {
        let allowed: Vec<String> = allowed.iter().map(ToString::to_string).collect();
        let (hub, runner) = Hub::new(&allowed);
        let shutdown = ShutdownController::new();
        tokio::spawn(runner.run(shutdown.clone()));
        (hub, shutdown)
    }

    fn broadcast(channel: &str, payload: &[u8]) -> BroadcastMessage {
        BroadcastMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn connect(
        hub: &Hub,
        subject: &str,
        buffer: usize,
    ) -> (
        Arc<ClientHandle>,
        Receiver<Outbound>,
        watch::Receiver<Option<CloseReason>>,
    ) {
        let (handle, rx, close_rx) = ClientHandle::channel(subject, buffer);
        hub.register(Arc::clone(&handle)).await;
        let id = handle.id().clone();
        wait_until(|| hub.is_registered(&id)).await;
        (handle, rx, close_rx)
    }

    async fn subscribed(hub: &Hub, handle: &ClientHandle, channel: &str) {
        hub.subscribe(handle.id().clone(), channel.to_string()).await;
        let id = handle.id().clone();
        let channel = channel.to_string();
        wait_until(|| hub.subscriptions_of(&id).contains(&channel)).await;
    }

    async fn next_frame(rx: &mut Receiver<Outbound>) -> Utf8Bytes {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_updates_both_indexes() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;

        subscribed(&hub, &handle, "lines").await;

        assert_eq!(hub.subscriber_count("lines"), 1);
        assert_eq!(hub.subscriptions_of(handle.id()), vec!["lines"]);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;

        subscribed(&hub, &handle, "lines").await;
        subscribed(&hub, &handle, "lines").await;

        assert_eq!(hub.subscriber_count("lines"), 1);
        assert_eq!(hub.subscriptions_of(handle.id()).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_client_is_ignored() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = ClientHandle::channel("ghost", 4);

        hub.subscribe(handle.id().clone(), "lines".to_string()).await;
        // Give the loop a chance to process the command.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!hub.has_channel("lines"));
        assert!(!hub.is_registered(handle.id()));
    }

    #[tokio::test]
    async fn test_subscribe_disallowed_channel_is_rejected() {
        let (hub, _shutdown) = spawn_hub(&["lines"]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;

        hub.subscribe(handle.id().clone(), "secret".to_string()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!hub.has_channel("secret"));
        assert!(hub.subscriptions_of(handle.id()).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_restores_prior_state() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;

        subscribed(&hub, &handle, "lines").await;
        hub.unsubscribe(handle.id().clone(), "lines".to_string()).await;

        let id = handle.id().clone();
        wait_until(|| hub.subscriptions_of(&id).is_empty()).await;

        // The last unsubscribe deletes the channel entry outright.
        assert!(!hub.has_channel("lines"));
        assert!(hub.is_registered(handle.id()));
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscription_is_a_noop() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;

        hub.unsubscribe(handle.id().clone(), "lines".to_string()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(hub.is_registered(handle.id()));
        assert!(!hub.has_channel("lines"));
    }

    #[tokio::test]
    async fn test_unregister_clears_every_index() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;

        subscribed(&hub, &handle, "lines").await;
        subscribed(&hub, &handle, "analytics").await;

        hub.unregister(handle.id().clone()).await;
        let id = handle.id().clone();
        wait_until(|| !hub.is_registered(&id)).await;

        assert!(!hub.has_channel("lines"));
        assert!(!hub.has_channel("analytics"));
        assert!(hub.subscriptions_of(handle.id()).is_empty());
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_fast_path_is_idempotent() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, _rx, _close) = connect(&hub, "alice", 4).await;
        subscribed(&hub, &handle, "lines").await;

        hub.remove(handle.id());
        hub.remove(handle.id());

        assert!(!hub.is_registered(handle.id()));
        assert!(!hub.has_channel("lines"));
    }

    #[tokio::test]
    async fn test_publish_delivers_in_order() {
        let (hub, _shutdown) = spawn_hub(&["lines"]);
        let (handle, mut rx, _close) = connect(&hub, "alice", 8).await;
        subscribed(&hub, &handle, "lines").await;

        for i in 0..5 {
            hub.publish(broadcast("lines", format!(r#"{{"seq":{i}}}"#).as_bytes()))
                .await;
        }

        for i in 0..5 {
            let frame = next_frame(&mut rx).await;
            let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
            assert_eq!(value["channel"], "lines");
            assert_eq!(value["payload"]["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_publish_wraps_non_json_payload() {
        let (hub, _shutdown) = spawn_hub(&[]);
        let (handle, mut rx, _close) = connect(&hub, "alice", 4).await;
        subscribed(&hub, &handle, "lines").await;

        hub.publish(broadcast("lines", b"hello")).await;

        let frame = next_frame(&mut rx).await;
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(value["payload"], "hello");
    }

    #[tokio::test]
    async fn test_publish_disallowed_channel_reaches_no_one() {
        let (hub, _shutdown) = spawn_hub(&["lines"]);
        let (handle, mut rx, _close) = connect(&hub, "alice", 4).await;
        subscribed(&hub, &handle, "lines").await;

        hub.publish(broadcast("secret", b"{}")).await;
        hub.publish(broadcast("lines", b"{}")).await;

        // Only the allowed broadcast arrives.
        let frame = next_frame(&mut rx).await;
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(value["channel"], "lines");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_client_is_evicted_others_unaffected() {
        let (hub, _shutdown) = spawn_hub(&["lines"]);
        let (slow, _slow_rx, mut slow_close) = connect(&hub, "slow", 1).await;
        let (fast, mut fast_rx, _fast_close) = connect(&hub, "fast", 8).await;
        subscribed(&hub, &slow, "lines").await;
        subscribed(&hub, &fast, "lines").await;

        // The slow client never drains: the second publish overflows its
        // queue and must evict it.
        hub.publish(broadcast("lines", br#"{"n":1}"#)).await;
        hub.publish(broadcast("lines", br#"{"n":2}"#)).await;

        tokio::time::timeout(Duration::from_secs(1), slow_close.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*slow_close.borrow(), Some(CloseReason::SlowConsumer));

        let first = next_frame(&mut fast_rx).await;
        let second = next_frame(&mut fast_rx).await;
        let first: serde_json::Value = serde_json::from_str(first.as_str()).unwrap();
        let second: serde_json::Value = serde_json::from_str(second.as_str()).unwrap();
        assert_eq!(first["payload"]["n"], 1);
        assert_eq!(second["payload"]["n"], 2);

        // The evicted client's teardown completes the removal.
        hub.remove(slow.id());
        assert!(!hub.is_registered(slow.id()));
        assert!(hub.is_registered(fast.id()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_clients_and_resets() {
        let (hub, shutdown) = spawn_hub(&[]);
        let mut closes = Vec::new();
        for subject in ["a", "b", "c"] {
            let (handle, rx, close_rx) = connect(&hub, subject, 4).await;
            subscribed(&hub, &handle, "lines").await;
            closes.push((handle, rx, close_rx));
        }

        shutdown.initiate_shutdown();

        for (handle, _rx, close_rx) in &mut closes {
            tokio::time::timeout(Duration::from_secs(1), close_rx.changed())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(*close_rx.borrow(), Some(CloseReason::Normal));
            assert!(handle.is_closed());
        }

        assert_eq!(hub.client_count(), 0);
        assert!(!hub.has_channel("lines"));
    }
}
