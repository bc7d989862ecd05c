//! WebSocket client sessions.
//!
//! Each connection runs two cooperating tasks: the reader pump (owns the
//! session, parses inbound control frames, enforces the pong deadline) and
//! the writer pump (drains the bounded outbound queue, sends keepalive
//! pings, and emits the close frame). The hub only ever sees the
//! [`ClientHandle`] half: identity, non-blocking enqueue, and the one-shot
//! close latch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::hub::Hub;
use super::message::ClientMessage;
use crate::shutdown::ShutdownController;

/// Deadline for a single socket write.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Read deadline; refreshed by each received pong frame.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Keepalive ping cadence; must be shorter than `PONG_WAIT`.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Maximum inbound message size, applied at upgrade time.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Unique client identifier: subject plus a process-monotonic sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    fn next(subject: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{subject}-{seq}"))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a session was closed; determines the close code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly teardown (peer disconnect, shutdown)
    Normal,
    /// The client's outbound queue could not accept the next broadcast
    SlowConsumer,
}

impl CloseReason {
    /// WebSocket close code for this reason.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => close_code::NORMAL,
            Self::SlowConsumer => close_code::POLICY,
        }
    }

    const fn text(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::SlowConsumer => "backpressure",
        }
    }
}

/// A frame queued for the writer pump.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    /// Pre-encoded broadcast envelope
    Frame(Utf8Bytes),
    /// Transport pong answering an application-level ping
    Pong,
}

/// The hub-visible half of a client: identity, enqueue, close latch.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    subject: String,
    sender: mpsc::Sender<Outbound>,
    close_tx: watch::Sender<Option<CloseReason>>,
    closed: AtomicBool,
}

impl ClientHandle {
    /// Creates a handle with its outbound queue and close-latch receivers.
    pub(crate) fn channel(
        subject: &str,
        buffer: usize,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Outbound>,
        watch::Receiver<Option<CloseReason>>,
    ) {
        let (sender, receiver) = mpsc::channel(buffer);
        let (close_tx, close_rx) = watch::channel(None);

        let handle = Arc::new(Self {
            id: ClientId::next(subject),
            subject: subject.to_string(),
            sender,
            close_tx,
            closed: AtomicBool::new(false),
        });

        (handle, receiver, close_rx)
    }

    /// Returns the client identifier.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns the authenticated subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Attempts a non-blocking enqueue of a pre-encoded frame.
    ///
    /// Returns `false` when the queue is full (or the session is gone); the
    /// hub uses that to evict the client.
    #[must_use]
    pub fn queue(&self, frame: Utf8Bytes) -> bool {
        self.sender.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Initiates session close with the given reason. The first call wins;
    /// repeated calls are no-ops.
    pub fn close(&self, reason: CloseReason) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(Some(reason));
        }
    }

    /// Returns whether close has been initiated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pong(&self) -> bool {
        self.sender.try_send(Outbound::Pong).is_ok()
    }
}

/// A live WebSocket session.
pub struct Client {
    handle: Arc<ClientHandle>,
    hub: Hub,
    socket: WebSocket,
    outbound: mpsc::Receiver<Outbound>,
    close_rx: watch::Receiver<Option<CloseReason>>,
}

impl Client {
    /// Creates a session for an upgraded socket.
    #[must_use]
    pub fn new(hub: Hub, subject: &str, socket: WebSocket, buffer: usize) -> Self {
        let (handle, outbound, close_rx) = ClientHandle::channel(subject, buffer);
        Self {
            handle,
            hub,
            socket,
            outbound,
            close_rx,
        }
    }

    /// Returns the client identifier.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        self.handle.id()
    }

    /// Registers with the hub and runs both pumps until the session ends.
    ///
    /// On exit the client is removed from the hub and the close latch is
    /// settled, whichever side terminated first.
    pub async fn run(self, shutdown: &ShutdownController) {
        let Self {
            handle,
            hub,
            socket,
            outbound,
            close_rx,
        } = self;

        hub.register(Arc::clone(&handle)).await;

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_pump(
            sink,
            outbound,
            close_rx.clone(),
            shutdown.subscribe(),
        ));

        read_pump(stream, &hub, &handle, close_rx, shutdown.subscribe()).await;

        hub.remove(handle.id());
        handle.close(CloseReason::Normal);
        let _ = writer.await;
    }
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    hub: &Hub,
    handle: &Arc<ClientHandle>,
    mut close_rx: watch::Receiver<Option<CloseReason>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = close_rx.changed() => return,
            read = tokio::time::timeout_at(deadline, stream.next()) => match read {
                Err(_) => {
                    debug!(client = %handle.id(), "pong deadline expired");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!(client = %handle.id(), error = %e, "websocket read failed");
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        match frame {
            Message::Text(text) => handle_control(text.as_bytes(), hub, handle).await,
            Message::Binary(data) => handle_control(&data, hub, handle).await,
            Message::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            // Transport pings are answered by the websocket stack.
            Message::Ping(_) => {}
            Message::Close(_) => return,
        }
    }
}

async fn handle_control(raw: &[u8], hub: &Hub, handle: &Arc<ClientHandle>) {
    match serde_json::from_slice::<ClientMessage>(raw) {
        Ok(ClientMessage::Subscribe { channels }) => {
            for channel in channels {
                let channel = channel.trim();
                if channel.is_empty() {
                    continue;
                }
                hub.subscribe(handle.id().clone(), channel.to_string()).await;
            }
        }
        Ok(ClientMessage::Unsubscribe { channels }) => {
            for channel in channels {
                let channel = channel.trim();
                if channel.is_empty() {
                    continue;
                }
                hub.unsubscribe(handle.id().clone(), channel.to_string())
                    .await;
            }
        }
        Ok(ClientMessage::Ping) => {
            if !handle.pong() {
                debug!(client = %handle.id(), "dropping pong for saturated client");
            }
        }
        Ok(ClientMessage::Unknown) => {
            warn!(client = %handle.id(), "unsupported client message type");
        }
        Err(e) => {
            warn!(client = %handle.id(), error = %e, "invalid client message");
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut close_rx: watch::Receiver<Option<CloseReason>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        // The close latch is polled first so an eviction emits its close
        // frame even when shutdown fires at the same time; the ticker sits
        // ahead of the queue so a busy channel cannot starve keepalives.
        tokio::select! {
            biased;
            changed = close_rx.changed() => {
                let reason = if changed.is_ok() { *close_rx.borrow() } else { None };
                let frame = reason.map(|reason| CloseFrame {
                    code: reason.code(),
                    reason: Utf8Bytes::from_static(reason.text()),
                });
                let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(frame))).await;
                return;
            }
            _ = shutdown_rx.recv() => {
                let frame = CloseFrame {
                    code: CloseReason::Normal.code(),
                    reason: Utf8Bytes::from_static(""),
                };
                let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(Some(frame)))).await;
                return;
            }
            _ = ticker.tick() => {
                if !write(&mut sink, Message::Ping(Bytes::new())).await {
                    // The reader will observe the dead peer shortly.
                    return;
                }
            }
            item = outbound.recv() => match item {
                Some(Outbound::Frame(frame)) => {
                    if !write(&mut sink, Message::Text(frame)).await {
                        return;
                    }
                }
                Some(Outbound::Pong) => {
                    if !write(&mut sink, Message::Pong(Bytes::new())).await {
                        return;
                    }
                }
                None => {
                    let _ = tokio::time::timeout(
                        WRITE_WAIT,
                        sink.send(Message::Close(None)),
                    )
                    .await;
                    return;
                }
            },
        }
    }
}

async fn write(sink: &mut SplitSink<WebSocket, Message>, message: Message) -> bool {
    match tokio::time::timeout(WRITE_WAIT, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            false
        }
        Err(_) => {
            debug!("websocket write timed out");
            false
        }
    }
}
