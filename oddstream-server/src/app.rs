//! Component wiring and lifecycle.
//!
//! Startup order: authenticator → hub loop → bus consumer → HTTP listener.
//! Shutdown order on SIGINT/SIGTERM: listener drains, the hub loop closes
//! every client and resets its indexes, then the consumer is closed and
//! awaited within the configured deadline.

use std::sync::Arc;

use tracing::{info, warn};

use oddstream_realtime::broker::BusConsumer;
use oddstream_realtime::shutdown::{ShutdownController, setup_signal_handlers};
use oddstream_realtime::ws::Hub;
use oddstream_realtime::{AppState, Authenticator, Config, RealtimeError, RealtimeServer};

use crate::dispatch::HubDispatcher;

/// Runs the service until shutdown completes.
pub async fn run(config: Config) -> Result<(), RealtimeError> {
    let authenticator = Arc::new(Authenticator::new(&config.auth_secret)?);

    let shutdown = ShutdownController::new();
    tokio::spawn(setup_signal_handlers(shutdown.clone()));

    let (hub, runner) = Hub::new(&config.kafka_topics);
    let hub_task = tokio::spawn(runner.run(shutdown.clone()));

    let consumer = Arc::new(BusConsumer::new(
        &config.kafka_brokers,
        &config.kafka_group_id,
        &config.kafka_topics,
        Arc::new(HubDispatcher::new(hub.clone())),
        config.shutdown_timeout,
    )?);

    let consumer_task = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let shutdown = shutdown.clone();
        async move { consumer.start(shutdown).await }
    });

    info!(
        bind_address = %config.bind_address,
        topics = ?config.kafka_topics,
        "starting realtime server"
    );

    let state = Arc::new(AppState::new(
        &config,
        authenticator,
        hub,
        shutdown.clone(),
    ));
    let result = RealtimeServer::new(&config.bind_address, state).run().await;

    // The listener exits on shutdown or on error; either way the rest of the
    // service comes down with it.
    shutdown.initiate_shutdown();

    let _ = hub_task.await;

    consumer.close();
    if tokio::time::timeout(config.shutdown_timeout, consumer_task)
        .await
        .is_err()
    {
        warn!("timed out waiting for bus consumer shutdown");
    }

    info!("shutdown complete");
    result
}
