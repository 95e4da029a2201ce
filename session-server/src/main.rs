mod admin;
mod anticheat;
mod auth;
mod chat;
mod config;
mod connection;
mod diag;
mod error;
mod events;
mod metrics;
mod object;
mod room;
mod transport;
mod worker;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::NullAuth;
use crate::metrics::LogMetrics;
use crate::worker::Worker;

#[tokio::main]
/// Activates tracing, loads the configuration, binds the game socket and
/// the admin pages, then runs the worker until the process dies. A
/// watchdog sweeps for leaked rooms as a fallback.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = match config::load_config().await {
        Ok(config) => Arc::new(config),
        Err(message) => {
            tracing::error!(message, "Initial config load error.");
            panic!("Initial config load error: {}", message);
        }
    };

    let (worker, events) = Worker::bind(config.clone(), Arc::new(LogMetrics), Arc::new(NullAuth))
        .await
        .expect("Binding the game socket failed");
    worker.hub.register(Arc::new(events::TraceListener));
    tracing::info!(
        game = %config.bind,
        admin = %config.admin_bind,
        server_as_host = config.server_as_host,
        "Session server up."
    );

    let watchdog_worker = worker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1200)); // 20 Min
        loop {
            interval.tick().await;
            watchdog_worker.cleanup_dead_rooms().await;
        }
    });

    let admin = admin::router(worker.clone());
    let listener = tokio::net::TcpListener::bind(&config.admin_bind)
        .await
        .expect("Binding the admin address failed");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, admin).await {
            tracing::error!(?err, "Admin server stopped.");
        }
    });

    worker.run(events).await;
}
