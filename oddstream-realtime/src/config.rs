//! Runtime configuration.
//!
//! Configuration is resolved from `WS_*` environment variables with
//! defaults suitable for local development. Any invalid required value is a
//! startup error.

use std::time::Duration;

use thiserror::Error;

/// Configuration errors. All of these are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `WS_AUTH_SECRET` missing or blank
    #[error("WS_AUTH_SECRET must be provided")]
    MissingAuthSecret,

    /// `WS_KAFKA_BROKERS` resolved to an empty list
    #[error("WS_KAFKA_BROKERS must be provided")]
    MissingBrokers,

    /// A variable failed to parse or violated its constraint
    #[error("invalid {name} value {value:?}")]
    InvalidValue {
        /// Environment variable name
        name: &'static str,
        /// The offending raw value
        value: String,
    },
}

/// Runtime configuration for the realtime distribution service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to
    pub bind_address: String,
    /// Kafka bootstrap brokers
    pub kafka_brokers: Vec<String>,
    /// Kafka consumer group id
    pub kafka_group_id: String,
    /// Topics to consume; doubles as the allowed channel set
    pub kafka_topics: Vec<String>,
    /// HMAC secret for token validation
    pub auth_secret: String,
    /// Allowed WebSocket origins; empty means unrestricted
    pub allowed_origins: Vec<String>,
    /// Per-client outbound queue capacity
    pub client_buffer: usize,
    /// Deadline for consumer tasks to drain on shutdown
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Resolves configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_address = normalize_bind_address(&get(&lookup, "WS_BIND_ADDRESS", ":8080"));

        let kafka_brokers = split_and_trim(&get(&lookup, "WS_KAFKA_BROKERS", "localhost:9092"));
        if kafka_brokers.is_empty() {
            return Err(ConfigError::MissingBrokers);
        }

        let auth_secret = lookup("WS_AUTH_SECRET").unwrap_or_default();
        if auth_secret.trim().is_empty() {
            return Err(ConfigError::MissingAuthSecret);
        }

        let client_buffer_raw = get(&lookup, "WS_CLIENT_BUFFER", "256");
        let client_buffer = client_buffer_raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|buffer| *buffer > 0)
            .ok_or(ConfigError::InvalidValue {
                name: "WS_CLIENT_BUFFER",
                value: client_buffer_raw,
            })?;

        let shutdown_raw = get(&lookup, "WS_SHUTDOWN_TIMEOUT_SECONDS", "10");
        let shutdown_secs = shutdown_raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::InvalidValue {
                name: "WS_SHUTDOWN_TIMEOUT_SECONDS",
                value: shutdown_raw,
            })?;

        Ok(Self {
            bind_address,
            kafka_brokers,
            kafka_group_id: get(&lookup, "WS_KAFKA_GROUP_ID", "ws-realtime"),
            kafka_topics: split_and_trim(&get(
                &lookup,
                "WS_KAFKA_TOPICS",
                "lines,order_book,analytics",
            )),
            auth_secret,
            allowed_origins: split_and_trim(&lookup("WS_ALLOWED_ORIGINS").unwrap_or_default()),
            client_buffer,
            shutdown_timeout: Duration::from_secs(shutdown_secs),
        })
    }
}

fn get(lookup: &impl Fn(&str) -> Option<String>, name: &str, fallback: &str) -> String {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// A bare `:port` binds every interface.
fn normalize_bind_address(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn split_and_trim(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}
