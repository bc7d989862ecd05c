//! # Oddstream Server
//!
//! Entry point for the oddstream real-time distribution service: consumes
//! odds updates from Kafka and fans them out to WebSocket subscribers.
//!
//! ```bash
//! # Run with environment configuration
//! WS_AUTH_SECRET=... WS_KAFKA_BROKERS=kafka-1:9092 oddstream-server
//!
//! # Check configuration without starting
//! oddstream-server --validate
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oddstream_realtime::Config;

mod app;
mod dispatch;

/// Oddstream real-time distribution server
#[derive(Parser, Debug)]
#[command(name = "oddstream-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if args.validate {
        println!("configuration is valid");
        return;
    }

    match app::run(config).await {
        Ok(()) => info!("oddstream server stopped"),
        Err(e) => {
            error!("server error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
