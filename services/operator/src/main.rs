//! nestplane operator
//!
//! Reads cluster watch events as JSON lines on stdin
//! (`{"type": "ADDED", "object": {...}}`) and reconciles them against the
//! in-memory collaborators.

use std::sync::Arc;

use anyhow::Result;
use nestplane_api::{WatchEvent, WatchEventType};
use nestplane_operator::memory::{MemoryBackend, MemoryClusterStore};
use nestplane_operator::{Config, Dispatcher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Buffer between the stdin reader and the dispatcher.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        base_domain = %config.base_domain,
        default_version = %config.default_version,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        queue_capacity = config.event_queue_capacity,
        "Starting nestplane operator"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

    let backend = MemoryBackend::new();
    let context = backend.context(config.actor_settings(), config.catalog.clone());
    let mut dispatcher = Dispatcher::new(context);

    let reader = tokio::spawn(read_events(backend.store.clone(), events_tx));
    let dispatcher_handle = tokio::spawn(async move {
        dispatcher.run(events_rx, shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reader => {
            match result {
                Ok(Ok(())) => info!("Event input closed"),
                Ok(Err(e)) => error!(error = %e, "Event reader error"),
                Err(e) => error!(error = %e, "Event reader panicked"),
            }
            // keep reconciling until interrupted
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher_handle.await {
        error!(error = %e, "Dispatcher task panicked");
    }

    info!(stats = ?backend.stats.snapshot(), "Operator shutdown complete");
    Ok(())
}

/// Record each event in the store, then forward the stored copy.
async fn read_events(
    store: Arc<MemoryClusterStore>,
    events: mpsc::Sender<WatchEvent>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let event: WatchEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed watch event");
                continue;
            }
        };

        let object = match event.event_type {
            WatchEventType::Deleted => {
                store.remove(event.object.namespace(), event.object.name()).await;
                event.object
            }
            _ => store.upsert(event.object).await,
        };

        let forwarded = WatchEvent {
            event_type: event.event_type,
            object,
        };
        if events.send(forwarded).await.is_err() {
            break;
        }
    }

    Ok(())
}
