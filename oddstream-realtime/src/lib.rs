//! # Oddstream Realtime
//!
//! Real-time WebSocket distribution hub for the oddstream platform.
//!
//! This crate bridges the platform's partitioned message bus to long-lived
//! WebSocket clients:
//! - Kafka consumer with commit-after-dispatch semantics
//! - Single-owner hub event loop for clients, channels, and subscriptions
//! - Per-connection reader/writer pumps with heartbeat and backpressure
//!   eviction of slow consumers
//! - JWT-authenticated upgrade surface with origin checking
//!
//! # Architecture
//!
//! ```text
//! Kafka topics ──► BusConsumer ──► Dispatcher ──► Hub event loop
//!                                                     │ fan-out
//!                                      ┌──────────────┼──────────────┐
//!                                      ▼              ▼              ▼
//!                                  Client #1      Client #2      Client #3
//!                                (reader/writer pumps, bounded queues)
//! ```
//!
//! Channel names are the upstream topic names; the configured topic list also
//! gates which channels clients may subscribe to. Delivery is best-effort: a
//! client whose outbound queue cannot accept the next broadcast is closed
//! with a policy-violation code rather than buffered indefinitely.
//!
//! # Authentication
//!
//! WebSocket connections authenticate at upgrade time with an HMAC-signed
//! JWT, passed either as `Authorization: Bearer <token>` or as a `token`
//! query parameter.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod ws;

pub use auth::Authenticator;
pub use config::Config;
pub use error::RealtimeError;
pub use server::RealtimeServer;
pub use shutdown::ShutdownController;
pub use state::AppState;
pub use ws::{BroadcastMessage, Hub};
