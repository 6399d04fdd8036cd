use std::sync::Arc;

use anyhow::Result;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cqrs_dispatch::{
    handler_fn, CounterMetrics, DispatchConfig, EventDispatchManager, MemoryEventBus,
    MemoryTypeRegistry, VersionedEventPublisher,
};
use cqrs_events::{EventKind, VersionedEvent};

#[derive(Debug)]
struct AccountOpened {
    owner: String,
}

impl EventKind for AccountOpened {
    const EVENT_TYPE: &'static str = "account:opened";
}

#[derive(Debug)]
struct FundsDeposited {
    amount_cents: u64,
}

impl EventKind for FundsDeposited {
    const EVENT_TYPE: &'static str = "account:funds_deposited";
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cqrs=info".parse()?))
        .init();

    info!("cqrs dispatch demo starting...");

    let config = DispatchConfig::from_env()?;
    config.log();

    let bus = Arc::new(MemoryEventBus::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut manager = EventDispatchManager::with_metrics(
        bus.clone(),
        Arc::new(MemoryTypeRegistry::new()),
        metrics.clone(),
    );

    manager.register_event_handler::<AccountOpened>(handler_fn(|event| {
        if let Some(opened) = event.payload_as::<AccountOpened>() {
            info!(account = %event.source_id, owner = %opened.owner, "Account opened");
        }
        Ok(())
    }))?;
    manager.register_event_handler::<FundsDeposited>(handler_fn(|event| {
        if let Some(deposit) = event.payload_as::<FundsDeposited>() {
            info!(account = %event.source_id, amount_cents = deposit.amount_cents, "Funds deposited");
        }
        Ok(())
    }))?;
    manager.register_global_handler(handler_fn(|event| {
        info!(event_type = %event.event_type, version = event.version, "Audit");
        Ok(())
    }))?;

    let (stop, stop_rx) = oneshot::channel();
    let handle = manager.listen(stop_rx, config.listen_options()).await?;

    let opened = VersionedEvent::new(
        "acct-1",
        1,
        AccountOpened {
            owner: "ada".into(),
        },
    )
    .with_actor("teller");
    let deposited = VersionedEvent::new("acct-1", 2, FundsDeposited { amount_cents: 2_500 })
        .with_correlation_id(opened.correlation_id.clone())
        .with_actor("teller");
    bus.publish_events(vec![opened, deposited]).await?;

    info!("Listening. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    if stop.send(()).is_err() {
        info!("Monitor already gone");
    }
    handle.stopped().await?;

    let snapshot = metrics.snapshot();
    for (event_type, count) in &snapshot.dispatched {
        info!(event_type = %event_type, count, "events_dispatched");
    }
    for (event_type, count) in &snapshot.failed {
        info!(event_type = %event_type, count, "events_failed");
    }

    Ok(())
}
