//! Control-plane behaviour against hardware-free doubles

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

use remoteio::audio::MockEnumerator;
use remoteio::config::AppConfig;
use remoteio::error::{ConnectError, Error, NotFoundError, StateError};
use remoteio::media::{LogTransport, MediaDriver};
use remoteio::network::{Established, Link, MockBehavior, MockConnector};
use remoteio::protocol::{
    ConnectionId, ConnectionState, DeviceRole, DeviceScope, Role, WireDevice, WireMessage,
};
use remoteio::{ControlEvent, ControlPlane};

fn speakers() -> Vec<WireDevice> {
    vec![
        WireDevice::new("Speakers", true),
        WireDevice::new("Headphones", false),
    ]
}

fn config(connect_timeout_ms: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.client.connect_timeout_ms = connect_timeout_ms;
    config.server.handshake_timeout_ms = connect_timeout_ms;
    config.client.close_grace_ms = 200;
    config
}

async fn plane_with(
    config: &AppConfig,
    connector: Arc<MockConnector>,
    enumerator: Arc<MockEnumerator>,
) -> ControlPlane {
    let plane = ControlPlane::new(config, connector, enumerator);
    for role in [DeviceRole::Input, DeviceRole::Output] {
        plane.refresh(DeviceScope::Local, role).await.unwrap();
    }
    plane
}

async fn plane() -> (ControlPlane, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::new(speakers()));
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1", "Mic2"], &["Monitor"]));
    let plane = plane_with(&config(2_000), connector.clone(), enumerator).await;
    (plane, connector)
}

/// A link whose transport just idles until it is closed
fn idle_link() -> Link {
    let (outbound, mut rx) = mpsc::unbounded_channel::<WireMessage>();
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => return,
                message = rx.recv() => if message.is_none() { return },
            }
        }
    });
    Link::new(outbound, shutdown, task)
}

async fn admit(plane: &ControlPlane, endpoint: &str, inputs: &[&str]) -> ConnectionId {
    let inputs: Vec<WireDevice> = inputs
        .iter()
        .enumerate()
        .map(|(i, name)| WireDevice::new(*name, i == 0))
        .collect();
    plane
        .admit(endpoint.to_string(), move |_id, _events| async move {
            Ok(Established {
                link: idle_link(),
                remote_devices: inputs,
            })
        })
        .await
        .unwrap()
        .value
        .id
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ControlEvent>, mut pred: F) -> ControlEvent
where
    F: FnMut(&ControlEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen in time")
}

#[tokio::test]
async fn test_connect_route_disconnect_scenario() {
    let (plane, _connector) = plane().await;

    let applied = plane.connect("ws://host:8000").await.unwrap();
    assert_eq!(applied.value.id, ConnectionId(1));
    assert_eq!(applied.value.state, ConnectionState::Active);
    assert_eq!(applied.snapshot.connections.len(), 1);

    let snapshot = plane.set_route(ConnectionId(1), "Mic1", "Speakers").unwrap();
    assert!(snapshot.routes.contains_key(&ConnectionId(1)));

    let snapshot = plane.disconnect(ConnectionId(1)).await.unwrap();
    assert!(!snapshot.routes.contains_key(&ConnectionId(1)));
    assert!(!plane.get_routes().contains_key(&ConnectionId(1)));
    assert!(plane.list_client_connections().is_empty());
    assert!(plane
        .list_devices(DeviceScope::Remote(ConnectionId(1)), DeviceRole::Output)
        .is_empty());
}

#[tokio::test]
async fn test_connect_advertises_local_inputs() {
    let (plane, connector) = plane().await;
    let id = plane.connect("10.1.1.1:8000").await.unwrap().value.id;

    let names: Vec<String> = connector
        .advertised_inputs(id)
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["Mic1", "Mic2"]);
}

#[tokio::test]
async fn test_unreachable_leaves_registry_unchanged() {
    let (plane, connector) = plane().await;
    connector.script("ws://10.9.9.9:8000", MockBehavior::Unreachable);
    let before = plane.snapshot();

    let started = Instant::now();
    let err = plane.connect("ws://10.9.9.9:8000").await.unwrap_err();
    assert!(matches!(err, Error::Connect(ConnectError::Unreachable(_))));
    assert!(started.elapsed() < Duration::from_secs(2));

    let after = plane.snapshot();
    assert_eq!(after.connections, before.connections);
    assert!(after.pending.is_empty());
}

#[tokio::test]
async fn test_hanging_peer_times_out() {
    let connector = Arc::new(MockConnector::new(speakers()));
    connector.set_default(MockBehavior::Hang);
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1"], &[]));
    let plane = plane_with(&config(100), connector, enumerator).await;

    let err = plane.connect("ws://host:8000").await.unwrap_err();
    assert!(matches!(err, Error::Connect(ConnectError::Timeout(_))));
    assert!(plane.snapshot().pending.is_empty());
    assert!(plane.snapshot().connections.is_empty());
}

#[tokio::test]
async fn test_invalid_address_is_rejected_before_reserving() {
    let (plane, _connector) = plane().await;
    let err = plane.connect("http://host:8000").await.unwrap_err();
    assert!(matches!(err, Error::Connect(ConnectError::InvalidAddress(_))));

    // the failed attempt consumed no id
    let id = plane.connect("host:8000").await.unwrap().value.id;
    assert_eq!(id, ConnectionId(1));
}

#[tokio::test]
async fn test_duplicate_endpoint_is_already_connected() {
    let (plane, _connector) = plane().await;
    plane.connect("ws://host:8000").await.unwrap();

    let err = plane.connect("host:8000").await.unwrap_err();
    assert!(matches!(err, Error::Connect(ConnectError::AlreadyConnected(_))));
    assert_eq!(plane.list_client_connections().len(), 1);
}

#[tokio::test]
async fn test_cancel_in_flight_connect() {
    let connector = Arc::new(MockConnector::new(speakers()));
    connector.set_default(MockBehavior::Hang);
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1"], &[]));
    let plane = plane_with(&config(10_000), connector, enumerator).await;

    let attempt = {
        let plane = plane.clone();
        tokio::spawn(async move { plane.connect("ws://slow:8000").await })
    };

    let pending = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(info) = plane.snapshot().pending.first().cloned() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(pending.state, ConnectionState::Connecting);
    assert!(plane.list_client_connections().is_empty());

    plane.disconnect(pending.id).await.unwrap();
    let err = attempt.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Connect(ConnectError::Cancelled(id)) if id == pending.id));

    let snapshot = plane.snapshot();
    assert!(snapshot.pending.is_empty());
    assert!(snapshot.connections.is_empty());
}

#[tokio::test]
async fn test_set_route_on_inactive_connection_changes_nothing() {
    let (plane, _connector) = plane().await;
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic1", "Speakers").unwrap();
    let before = plane.get_routes();

    let err = plane
        .set_route(ConnectionId(42), "Mic1", "Speakers")
        .unwrap_err();
    assert!(matches!(err, Error::State(StateError::ConnectionNotActive(_))));
    assert_eq!(plane.get_routes(), before);
}

#[tokio::test]
async fn test_set_route_with_unknown_device() {
    let (plane, _connector) = plane().await;
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;

    let err = plane.set_route(id, "Mic9", "Speakers").unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound(NotFoundError::Device { scope: DeviceScope::Local, .. })
    ));
    assert!(plane.get_routes().is_empty());
}

#[tokio::test]
async fn test_clear_route_is_idempotent() {
    let (plane, _connector) = plane().await;
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic1", "Speakers").unwrap();

    plane.clear_route(id).unwrap();
    let once = plane.get_routes();
    plane.clear_route(id).unwrap();
    assert_eq!(plane.get_routes(), once);
    assert!(once.is_empty());
}

#[tokio::test]
async fn test_failed_refresh_keeps_last_list() {
    let connector = Arc::new(MockConnector::new(speakers()));
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1", "Mic2"], &["Monitor"]));
    let plane = plane_with(&config(2_000), connector, enumerator.clone()).await;

    let before = plane.list_client_devices();
    enumerator.fail_with(Some("device busy"));
    let err = plane
        .refresh(DeviceScope::Local, DeviceRole::Input)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Device(_)));
    assert_eq!(plane.list_client_devices(), before);
}

#[tokio::test]
async fn test_vanished_input_drops_route() {
    let connector = Arc::new(MockConnector::new(speakers()));
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1", "Mic2"], &["Monitor"]));
    let plane = plane_with(&config(2_000), connector, enumerator.clone()).await;
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic2", "Speakers").unwrap();

    enumerator.set_inputs(&["Mic1"]);
    let snapshot = plane
        .refresh(DeviceScope::Local, DeviceRole::Input)
        .await
        .unwrap();
    assert!(snapshot.routes.is_empty());
    assert_eq!(plane.list_client_connections().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_routes_to_same_output() {
    let connector = Arc::new(MockConnector::new(speakers()));
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1"], &["Monitor"]));
    let plane = plane_with(&config(2_000), connector, enumerator).await;

    let a = admit(&plane, "ws://10.0.0.1:50001", &["MicA"]).await;
    let b = admit(&plane, "ws://10.0.0.2:50002", &["MicB"]).await;

    let first = {
        let plane = plane.clone();
        tokio::spawn(async move { plane.set_route(a, "MicA", "Monitor") })
    };
    let second = {
        let plane = plane.clone();
        tokio::spawn(async move { plane.set_route(b, "MicB", "Monitor") })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let routes = plane.get_routes();
    assert_eq!(routes.len(), 2);
    assert!(routes.values().all(|r| r.output == "Monitor"));
}

#[tokio::test]
async fn test_admitted_client_is_routed_to_server_output() {
    let (plane, _connector) = plane().await;
    plane.set_server_output_device("Monitor").unwrap();

    let id = admit(&plane, "ws://10.0.0.7:40000", &["Line In", "Mic"]).await;
    let route = plane.get_routes().remove(&id).unwrap();
    assert_eq!(route.input, "Line In");
    assert_eq!(route.output, "Monitor");
    assert_eq!(plane.list_server_connections()[0].role, Role::Server);
}

#[tokio::test]
async fn test_server_output_must_exist_locally() {
    let (plane, _connector) = plane().await;
    let err = plane.set_server_output_device("Speakers").unwrap_err();
    assert!(matches!(err, Error::NotFound(NotFoundError::Device { .. })));
    assert!(plane.snapshot().server_output.is_none());
}

#[tokio::test]
async fn test_client_input_follows_selected_output() {
    let (plane, connector) = plane().await;
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;

    plane
        .select_output_device(DeviceScope::Remote(id), "Headphones")
        .unwrap();
    plane.set_client_input_device(id, "Mic2").unwrap();
    let route = plane.get_routes().remove(&id).unwrap();
    assert_eq!((route.input.as_str(), route.output.as_str()), ("Mic2", "Headphones"));

    // re-pointing the output keeps the input
    plane
        .select_output_device(DeviceScope::Remote(id), "Speakers")
        .unwrap();
    assert_eq!(plane.get_routes()[&id].output, "Speakers");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let sent = connector.sent(id);
    assert!(sent.contains(&WireMessage::Route {
        input: "Mic2".into(),
        output: "Speakers".into(),
    }));
}

#[tokio::test]
async fn test_transport_loss_cascades() {
    let (plane, connector) = plane().await;
    let mut events = plane.subscribe();
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic1", "Speakers").unwrap();

    assert!(connector.sever(id));
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::ConnectionClosed { id: closed, .. } if *closed == id)
    })
    .await;

    let snapshot = plane.snapshot();
    assert!(snapshot.connections.is_empty());
    assert!(snapshot.routes.is_empty());
    let err = plane.set_route(id, "Mic1", "Speakers").unwrap_err();
    assert!(matches!(err, Error::State(StateError::ConnectionNotActive(_))));
}

#[tokio::test]
async fn test_remote_device_update_invalidates_route() {
    let (plane, connector) = plane().await;
    let mut events = plane.subscribe();
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic1", "Headphones").unwrap();

    assert!(connector.inject(id, WireMessage::Devices(vec![WireDevice::new("Speakers", true)])));
    wait_for(&mut events, |e| matches!(e, ControlEvent::RouteCleared(r) if r.connection == id)).await;

    let outputs = plane.list_devices(DeviceScope::Remote(id), DeviceRole::Output);
    assert_eq!(outputs.len(), 1);
    assert!(plane.get_routes().is_empty());
}

#[tokio::test]
async fn test_disconnect_unknown_and_twice() {
    let (plane, _connector) = plane().await;
    let err = plane.disconnect(ConnectionId(5)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(NotFoundError::Connection(_))));

    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.disconnect(id).await.unwrap();
    let err = plane.disconnect(id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(NotFoundError::Connection(_))));
}

#[tokio::test]
async fn test_events_follow_commit_order() {
    let (plane, _connector) = plane().await;
    let mut events = plane.subscribe();

    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic1", "Speakers").unwrap();
    plane.disconnect(id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let opened = seen
        .iter()
        .position(|e| matches!(e, ControlEvent::ConnectionOpened(_)))
        .unwrap();
    let routed = seen
        .iter()
        .position(|e| matches!(e, ControlEvent::RouteSet(_)))
        .unwrap();
    let cleared = seen
        .iter()
        .position(|e| matches!(e, ControlEvent::RouteCleared(_)))
        .unwrap();
    let closed = seen
        .iter()
        .position(|e| matches!(e, ControlEvent::ConnectionClosed { .. }))
        .unwrap();
    assert!(opened < routed && routed < cleared && cleared < closed);
}

#[tokio::test]
async fn test_media_driver_follows_routes() {
    let (plane, _connector) = plane().await;
    let driver = MediaDriver::attach(&plane, Arc::new(LogTransport));

    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane.set_route(id, "Mic1", "Speakers").unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while driver.active_sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(driver.active_sessions()[0].connection, id);

    plane.disconnect(id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !driver.active_sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_vanished_remote_output_falls_back_to_default() {
    let (plane, connector) = plane().await;
    let mut events = plane.subscribe();
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    plane
        .select_output_device(DeviceScope::Remote(id), "Headphones")
        .unwrap();

    assert!(connector.inject(id, WireMessage::Devices(vec![WireDevice::new("Speakers", true)])));
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::DevicesChanged { scope: DeviceScope::Remote(changed), .. } if *changed == id)
    })
    .await;

    plane.set_client_input_device(id, "Mic1").unwrap();
    assert_eq!(plane.get_routes()[&id].output, "Speakers");
}

#[tokio::test]
async fn test_vanished_server_output_is_cleared() {
    let connector = Arc::new(MockConnector::new(speakers()));
    let enumerator = Arc::new(MockEnumerator::new(&["Mic1"], &["Monitor", "HDMI"]));
    let plane = plane_with(&config(2_000), connector, enumerator.clone()).await;
    plane.set_server_output_device("HDMI").unwrap();

    enumerator.set_outputs(&["Monitor"]);
    let snapshot = plane
        .refresh(DeviceScope::Local, DeviceRole::Output)
        .await
        .unwrap();
    assert!(snapshot.server_output.is_none());

    // nothing to auto-route to any more
    let id = admit(&plane, "ws://10.0.0.9:40000", &["Mic"]).await;
    assert!(!plane.get_routes().contains_key(&id));
}

#[tokio::test]
async fn test_slow_handshake_is_listed_as_pending() {
    let (plane, connector) = plane().await;
    connector.script(
        "ws://slow:8000",
        MockBehavior::Delay(Duration::from_millis(150), speakers()),
    );

    let attempt = {
        let plane = plane.clone();
        tokio::spawn(async move { plane.connect("slow:8000").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let snapshot = plane.snapshot();
    assert_eq!(snapshot.pending.len(), 1);
    assert!(snapshot.connections.is_empty());

    let applied = attempt.await.unwrap().unwrap();
    assert_eq!(applied.value.state, ConnectionState::Active);
    assert!(plane.snapshot().pending.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_route_events_replay_to_final_table() {
    let (plane, _connector) = plane().await;
    let id = plane.connect("ws://host:8000").await.unwrap().value.id;
    let mut events = plane.subscribe();

    let tasks: Vec<_> = (0..4)
        .map(|n| {
            let plane = plane.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    if (n + i) % 2 == 0 {
                        plane.set_route(id, "Mic1", "Speakers").unwrap();
                    } else {
                        plane.clear_route(id).unwrap();
                    }
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let mut replayed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ControlEvent::RouteSet(route) => replayed = Some(route),
            ControlEvent::RouteCleared(_) => replayed = None,
            _ => {}
        }
    }
    assert_eq!(replayed.as_ref(), plane.get_routes().get(&id));
}

#[derive(Debug, Clone)]
enum Op {
    Connect(u8),
    Disconnect(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Connect),
        (0u8..8).prop_map(Op::Disconnect),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_active_ids_are_unique_and_never_reused(ops in prop::collection::vec(op(), 1..24)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (plane, _connector) = plane().await;
            let mut issued = HashSet::new();
            let mut last = 0u64;

            for op in ops {
                match op {
                    Op::Connect(host) => {
                        if let Ok(applied) = plane.connect(&format!("ws://h{}:8000", host)).await {
                            let id = applied.value.id;
                            assert!(issued.insert(id), "id {} issued twice", id);
                            assert!(id.0 > last);
                            last = id.0;
                        }
                    }
                    Op::Disconnect(id) => {
                        let _ = plane.disconnect(ConnectionId(id as u64 + 1)).await;
                    }
                }

                let active: Vec<_> = plane
                    .snapshot()
                    .connections
                    .iter()
                    .filter(|c| c.is_active())
                    .map(|c| c.id)
                    .collect();
                let unique: HashSet<_> = active.iter().copied().collect();
                assert_eq!(unique.len(), active.len());
            }
        });
    }
}
