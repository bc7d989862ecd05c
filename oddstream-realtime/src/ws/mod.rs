//! WebSocket distribution core.
//!
//! This module contains the realtime fan-out machinery:
//! - [`Hub`]: single-owner event loop over client registration,
//!   subscriptions, and broadcast dispatch
//! - [`Client`]: per-connection reader/writer pumps with heartbeat and a
//!   bounded outbound queue
//! - Message types and the outbound JSON envelope
//! - The `/ws` upgrade handler
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Hub event loop                      │
//! │  clients / channel→subscribers / client→subscriptions     │
//! │  (mutated only by the loop; fast-path remove takes the    │
//! │   auxiliary lock during client teardown)                  │
//! └───────┬───────────────────┬───────────────────┬──────────┘
//!         ▼                   ▼                   ▼
//!     Client #1           Client #2           Client #3
//!   reader │ writer     reader │ writer     reader │ writer
//! ```
//!
//! Dispatch never blocks on a slow client: enqueue is non-blocking and a
//! full queue evicts the client with a policy-violation close code.

pub mod client;
pub mod handler;
pub mod hub;
pub mod message;

pub use client::{Client, ClientHandle, ClientId, CloseReason, MAX_MESSAGE_SIZE};
pub use handler::ws_handler;
pub use hub::{Hub, HubRunner};
pub use message::{BroadcastMessage, ClientMessage};
