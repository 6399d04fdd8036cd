//! End-to-end: publish on the memory bus, receive through the dispatch
//! manager, stop with the close handshake.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use cqrs_dispatch::{
    handler_fn, BusError, CloseRequest, CounterMetrics, EventDispatchManager, ListenOptions,
    ListenState, MemoryEventBus, MemoryTypeRegistry, ReceiverOptions, TransactedHandler, TypeRegistry,
    VersionedEventPublisher, VersionedEventReceiver,
};
use cqrs_events::{EventKind, VersionedEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct SampleEvent {
    message: String,
}

impl EventKind for SampleEvent {
    const EVENT_TYPE: &'static str = "sample";
}

fn sample(version: i64, message: &str) -> VersionedEvent {
    VersionedEvent::new(
        "sample-1",
        version,
        SampleEvent {
            message: message.into(),
        },
    )
}

/// Poll until `check` holds or the wait budget runs out.
async fn eventually(check: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =========================================================================
// Publish → dispatch → stop
// =========================================================================

#[tokio::test]
async fn published_events_reach_handlers() {
    let bus = Arc::new(MemoryEventBus::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut manager = EventDispatchManager::with_metrics(
        bus.clone(),
        Arc::new(MemoryTypeRegistry::new()),
        metrics.clone(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager
        .register_event_handler::<SampleEvent>(handler_fn(move |event| {
            let payload = event
                .payload_as::<SampleEvent>()
                .ok_or_else(|| anyhow!("wrong payload"))?;
            sink.lock().unwrap().push(payload.message.clone());
            Ok(())
        }))
        .unwrap();

    let (stop, stop_rx) = oneshot::channel();
    let handle = manager
        .listen(stop_rx, ListenOptions::default())
        .await
        .unwrap();
    assert_eq!(bus.attached_receivers(), 1);

    bus.publish_events(vec![sample(1, "first"), sample(2, "second")])
        .await
        .unwrap();
    eventually(|| seen.lock().unwrap().len() == 2).await;

    stop.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(metrics.dispatched("sample"), 2);
    assert_eq!(bus.attached_receivers(), 0);
}

#[tokio::test]
async fn failed_dispatch_is_dropped_and_delivery_continues() {
    let bus = Arc::new(MemoryEventBus::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut manager = EventDispatchManager::with_metrics(
        bus.clone(),
        Arc::new(MemoryTypeRegistry::new()),
        metrics.clone(),
    );
    manager
        .register_event_handler::<SampleEvent>(handler_fn(|event| {
            if event.version == 1 {
                Err(anyhow!("poison"))
            } else {
                Ok(())
            }
        }))
        .unwrap();

    let (stop, stop_rx) = oneshot::channel();
    let handle = manager
        .listen(stop_rx, ListenOptions::default())
        .await
        .unwrap();

    bus.publish_events(vec![sample(1, "bad"), sample(2, "good")])
        .await
        .unwrap();
    eventually(|| metrics.dispatched("sample") == 1).await;

    stop.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();
    assert_eq!(metrics.failed("sample"), 1);
}

#[tokio::test]
async fn panicking_handler_does_not_stall_delivery() {
    let bus = Arc::new(MemoryEventBus::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut manager = EventDispatchManager::with_metrics(
        bus.clone(),
        Arc::new(MemoryTypeRegistry::new()),
        metrics.clone(),
    );
    manager
        .register_event_handler::<SampleEvent>(handler_fn(|event| {
            if event.version == 1 {
                panic!("handler blew up");
            }
            Ok(())
        }))
        .unwrap();

    let (stop, stop_rx) = oneshot::channel();
    let handle = manager
        .listen(stop_rx, ListenOptions::default())
        .await
        .unwrap();

    bus.publish_events(vec![sample(1, "boom"), sample(2, "after")])
        .await
        .unwrap();
    eventually(|| metrics.dispatched("sample") == 1).await;
    assert_eq!(handle.state(), ListenState::Listening);

    stop.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();
    assert_eq!(bus.attached_receivers(), 0);
}

#[tokio::test]
async fn multiple_listeners_share_the_queue() {
    let bus = Arc::new(MemoryEventBus::new());
    let mut manager =
        EventDispatchManager::new(bus.clone(), Arc::new(MemoryTypeRegistry::new()));

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    manager
        .register_global_handler(handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    let (stop, stop_rx) = oneshot::channel();
    let handle = manager
        .listen(
            stop_rx,
            ListenOptions {
                listener_count: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let batch = (1..=20).map(|v| sample(v, "load")).collect();
    bus.publish_events(batch).await.unwrap();
    eventually(|| handled.load(Ordering::SeqCst) == 20).await;

    stop.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn registration_reopens_after_receiver_detaches() {
    let bus = Arc::new(MemoryEventBus::new());
    let mut manager =
        EventDispatchManager::new(bus.clone(), Arc::new(MemoryTypeRegistry::new()));

    let (stop, stop_rx) = oneshot::channel();
    let handle = manager
        .listen(stop_rx, ListenOptions::default())
        .await
        .unwrap();
    assert!(manager
        .register_global_handler(handler_fn(|_| Ok(())))
        .is_err());

    stop.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();

    // The supervisor drops its listeners before acknowledging, so the
    // dispatch table is exclusively ours again.
    manager
        .register_global_handler(handler_fn(|_| Ok(())))
        .unwrap();
    assert_eq!(manager.dispatcher().global_handler_count(), 1);
}

// =========================================================================
// Exclusivity
// =========================================================================

#[tokio::test]
async fn exclusive_receiver_rejects_a_second_attach() {
    let bus = Arc::new(MemoryEventBus::new());
    let first = EventDispatchManager::new(bus.clone(), Arc::new(MemoryTypeRegistry::new()));
    let second = EventDispatchManager::new(bus.clone(), Arc::new(MemoryTypeRegistry::new()));

    let exclusive = ListenOptions {
        exclusive: true,
        ..Default::default()
    };
    let (stop, stop_rx) = oneshot::channel();
    let handle = first.listen(stop_rx, exclusive).await.unwrap();

    let (_stop2, stop_rx2) = oneshot::channel::<()>();
    let err = second
        .listen(stop_rx2, ListenOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<BusError>(), Some(&BusError::ReceiverBusy));

    stop.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();

    // Once detached, the bus accepts a new receiver.
    let (stop3, stop_rx3) = oneshot::channel();
    let handle = second.listen(stop_rx3, exclusive).await.unwrap();
    stop3.send(()).unwrap();
    timeout(WAIT, handle.stopped()).await.unwrap().unwrap();
}

#[tokio::test]
async fn shared_receivers_can_attach_together() {
    let bus = Arc::new(MemoryEventBus::new());
    let first = EventDispatchManager::new(bus.clone(), Arc::new(MemoryTypeRegistry::new()));
    let second = EventDispatchManager::new(bus.clone(), Arc::new(MemoryTypeRegistry::new()));

    let (stop1, rx1) = oneshot::channel();
    let (stop2, rx2) = oneshot::channel();
    let h1 = first.listen(rx1, ListenOptions::default()).await.unwrap();
    let h2 = second.listen(rx2, ListenOptions::default()).await.unwrap();
    assert_eq!(bus.attached_receivers(), 2);

    stop1.send(()).unwrap();
    stop2.send(()).unwrap();
    timeout(WAIT, h1.stopped()).await.unwrap().unwrap();
    timeout(WAIT, h2.stopped()).await.unwrap().unwrap();
    assert_eq!(bus.attached_receivers(), 0);
}

// =========================================================================
// Driving the receiver directly
// =========================================================================

#[tokio::test]
async fn transacted_accept_round_trip() {
    let bus = MemoryEventBus::new();
    let (close_tx, close_rx) = mpsc::channel(1);
    let (error_tx, mut error_rx) = mpsc::channel(1);
    let (accept_tx, mut accept_rx) = mpsc::channel(1);

    bus.receive_events(ReceiverOptions {
        type_registry: Arc::new(MemoryTypeRegistry::new()),
        close: close_rx,
        errors: error_tx,
        receive_event: Arc::new(TransactedHandler::new(accept_tx)),
        exclusive: false,
        listener_count: 1,
    })
    .await
    .unwrap();

    bus.publish_events(vec![sample(1, "TestInMemoryEventBus")])
        .await
        .unwrap();

    tokio::select! {
        _ = tokio::time::sleep(WAIT) => panic!("test timed out"),
        accept = accept_rx.recv() => {
            let accept = accept.unwrap();
            let payload = accept.event.payload_as::<SampleEvent>().unwrap();
            assert_eq!(payload.message, "TestInMemoryEventBus");
            accept.accept(true);
        }
        err = error_rx.recv() => panic!("receiver reported {err:?}"),
    }

    let (request, answer) = CloseRequest::new();
    close_tx.send(request).await.unwrap();
    timeout(WAIT, answer).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn failed_listener_is_reported_and_replaced() {
    let bus = MemoryEventBus::new();
    let (close_tx, close_rx) = mpsc::channel(1);
    let (error_tx, mut error_rx) = mpsc::channel(1);

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    bus.receive_events(ReceiverOptions {
        type_registry: Arc::new(MemoryTypeRegistry::new()),
        close: close_rx,
        errors: error_tx,
        receive_event: handler_fn(move |event| {
            if event.version == 1 {
                panic!("handler blew up");
            }
            sink.lock().unwrap().push(event.version);
            Ok(())
        }),
        exclusive: false,
        listener_count: 1,
    })
    .await
    .unwrap();

    bus.publish_events(vec![sample(1, "boom"), sample(2, "after")])
        .await
        .unwrap();

    let report = timeout(WAIT, error_rx.recv()).await.unwrap().unwrap();
    assert!(report.to_string().starts_with("memory bus listener failed"));
    eventually(|| *delivered.lock().unwrap() == vec![2]).await;

    let (request, answer) = CloseRequest::new();
    close_tx.send(request).await.unwrap();
    timeout(WAIT, answer).await.unwrap().unwrap().unwrap();
    assert_eq!(bus.attached_receivers(), 0);
}

#[tokio::test]
async fn type_registry_is_populated_by_registration() {
    let bus = Arc::new(MemoryEventBus::new());
    let registry = Arc::new(MemoryTypeRegistry::new());
    let mut manager = EventDispatchManager::new(bus, registry.clone());

    manager
        .register_event_handler::<SampleEvent>(handler_fn(|_| Ok(())))
        .unwrap();

    assert_eq!(registry.type_names(), vec!["sample"]);
}
