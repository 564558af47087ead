//! Tests for the service-multiplexing transport.

mod common;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use common::{Call, StubBridge, address_in_use, bare_capabilities, init_tracing};
use parking_lot::Mutex;
use peerlink_net::service::ServiceState;
use peerlink_net::udp::{ModuleGeneration, PacketSocketState, SocketOptions, UdpTransport};
use peerlink_net::{
    DEFAULT_SERVICE_PORT, InboundMessage, LocalInfo, NetworkError, RemoteInfo, ServicePacket,
    ServiceTransport, ServiceTransportConfig, ServiceType,
};

fn service_on(bridge: &Arc<StubBridge>) -> ServiceTransport {
    let udp = UdpTransport::new(bridge.loader());
    ServiceTransport::new(udp, ServiceTransportConfig::new().port(DEFAULT_SERVICE_PORT))
}

fn peer() -> SocketAddr {
    "192.168.1.20:49497".parse().unwrap()
}

fn capture_messages(service: &ServiceTransport) -> Arc<Mutex<Vec<InboundMessage>>> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let capture = messages.clone();
    service
        .message()
        .connect(move |message| capture.lock().push(message.clone()));
    messages
}

#[tokio::test]
async fn test_init_binds_and_enables_broadcast() {
    init_tracing();
    let bridge = StubBridge::new();
    let service = service_on(&bridge);

    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    service.ready().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    service.init().await.unwrap();

    let socket = service.socket().unwrap();
    let calls = bridge.calls();
    assert!(calls.contains(&Call::CreateSocket(
        SocketOptions::default().reuse_address(true).broadcast(false)
    )));
    assert!(calls.contains(&Call::Bind(socket.id(), "0.0.0.0:49497".parse().unwrap())));
    assert!(calls.contains(&Call::SetBroadcast(socket.id(), true)));
    assert_eq!(service.state(), ServiceState::Ready);
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert_eq!(
        service.get_info(),
        Some(LocalInfo {
            host: "0.0.0.0".parse().unwrap(),
            port: DEFAULT_SERVICE_PORT,
        })
    );
}

#[tokio::test]
async fn test_broadcast_send_reaches_native_module() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    let socket_id = service.socket().unwrap().id();

    let payload = Bytes::from_static(b"\x01discover-peers!!");
    assert_eq!(payload.len(), 17);
    let broadcast: IpAddr = "255.255.255.255".parse().unwrap();
    service
        .send(payload.clone(), broadcast, DEFAULT_SERVICE_PORT)
        .await
        .unwrap();

    assert_eq!(
        bridge.sends(),
        vec![Call::Send {
            socket_id,
            offset: 0,
            length: 17,
            target: SocketAddr::new(broadcast, DEFAULT_SERVICE_PORT),
            data: payload,
        }]
    );
    let stats = service.stats();
    assert_eq!(stats.packets_sent, 1);
    assert_eq!(stats.bytes_sent, 17);
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);

    service.init().await.unwrap();
    service.init().await.unwrap();

    assert_eq!(bridge.count(|call| matches!(call, Call::CreateSocket(_))), 1);
    assert_eq!(service.udp().ref_count(), 1);
}

#[tokio::test]
async fn test_inbound_routing() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);

    let journal = Arc::new(Mutex::new(Vec::new()));
    let capture = journal.clone();
    service.add_service(ServiceType::JournalSync, move |packet, remote: RemoteInfo| {
        capture.lock().push((packet, remote.socket_addr()));
    });
    let credentials = Arc::new(Mutex::new(Vec::new()));
    let capture = credentials.clone();
    service.add_service(ServiceType::Credentials, move |packet, _remote| {
        capture.lock().push(packet);
    });
    let framed_tag_hits = Arc::new(AtomicUsize::new(0));
    let counter = framed_tag_hits.clone();
    service.add_service(0x85, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let messages = capture_messages(&service);
    service.init().await.unwrap();
    let socket_id = service.socket().unwrap().id();

    // Service tag: handler gets the payload without its tag.
    bridge.inject(socket_id, &[0x05, 0x41, 0x42], peer());
    // Framed packet: never routed by its first byte.
    let mut framed = vec![0x85];
    framed.extend([0u8; 24]);
    bridge.inject(socket_id, &framed, peer());
    // JSON envelope with a numeric string tag.
    bridge.inject(socket_id, br#"{"type":"2","nonce":"abc"}"#, peer());
    // Unregistered tag.
    bridge.inject(socket_id, &[0x09, 0x00], peer());

    assert_eq!(
        *journal.lock(),
        vec![(ServicePacket::Bytes(Bytes::from_static(b"AB")), peer())]
    );
    assert_eq!(framed_tag_hits.load(Ordering::SeqCst), 0);
    let credentials = credentials.lock();
    assert_eq!(credentials.len(), 1);
    match &credentials[0] {
        ServicePacket::Json(value) => assert_eq!(value["nonce"], "abc"),
        other => panic!("expected JSON packet, got {other:?}"),
    }

    let messages = messages.lock();
    assert_eq!(messages.len(), 4);
    assert_eq!(&messages[0].data[..], &[0x05, 0x41, 0x42]);
    assert_eq!(messages[0].service_tag, Some(5));
    assert!(messages[1].framed);
    assert_eq!(messages[1].service_tag, None);
    assert_eq!(messages[1].data.len(), 25);
    assert_eq!(messages[2].service_tag, Some(2));
    assert_eq!(messages[3].service_tag, None);
    assert!(!messages[3].framed);
    assert_eq!(messages[3].remote.size, 2);

    assert_eq!(service.stats().packets_received, 4);
}

#[tokio::test]
async fn test_replacing_and_removing_services() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    let hits = Arc::new(AtomicUsize::new(0));

    assert!(!service.add_service(ServiceType::Heartbeat, |_, _| {}));
    let counter = hits.clone();
    assert!(service.add_service(ServiceType::Heartbeat, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(service.service_count(), 1);

    service.init().await.unwrap();
    let socket_id = service.socket().unwrap().id();
    bridge.inject(socket_id, &[8], peer());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(service.remove_service(ServiceType::Heartbeat));
    assert!(!service.has_service(8));
    bridge.inject(socket_id, &[8], peer());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_recovers_from_invalidated_socket() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    let first = service.socket().unwrap();
    bridge.fail_next_sends(1);

    service
        .send(&b"\x08ping"[..], peer().ip(), peer().port())
        .await
        .unwrap();

    assert_eq!(bridge.sends().len(), 2);
    assert_eq!(bridge.count(|call| matches!(call, Call::CreateSocket(_))), 2);
    let second = service.socket().unwrap();
    assert_ne!(first.id(), second.id());
    assert!(second.is_live());

    let stats = service.stats();
    assert_eq!(stats.reinitializations, 1);
    assert_eq!(stats.packets_sent, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(service.udp().ref_count(), 1);
}

#[tokio::test]
async fn test_send_retries_only_once() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    bridge.fail_next_sends(2);

    let err = service
        .send(&b"\x08ping"[..], peer().ip(), peer().port())
        .await
        .unwrap_err();

    assert!(err.is_invalidated());
    assert_eq!(bridge.sends().len(), 2);
    assert_eq!(service.stats().reinitializations, 1);
}

#[tokio::test]
async fn test_failed_reinitialization_is_reported() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    bridge.fail_next_sends(1);
    bridge.fail_next_creates(1);

    let err = service
        .send(&b"\x08ping"[..], peer().ip(), peer().port())
        .await
        .unwrap_err();

    assert!(matches!(err, NetworkError::CreateSocket(_)));
    assert_eq!(bridge.sends().len(), 1);
    assert!(!service.is_initialized());
    assert_eq!(service.udp().ref_count(), 0);
}

#[tokio::test]
async fn test_init_replaces_stale_socket() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    let stale = service.socket().unwrap();

    service.udp().registry().invalidate_all();
    assert!(!stale.is_live());

    service.init().await.unwrap();
    let fresh = service.socket().unwrap();
    assert!(fresh.is_live());
    assert_ne!(stale.id(), fresh.id());
}

#[tokio::test]
async fn test_module_reload_is_survived() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();

    bridge.reload(ModuleGeneration::new(1_700_000_500_000));
    service
        .send(&b"\x01hello"[..], peer().ip(), peer().port())
        .await
        .unwrap();

    assert!(service.socket().unwrap().is_live());
    assert_eq!(service.stats().reinitializations, 1);
}

#[tokio::test]
async fn test_send_initializes_on_demand() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);

    service
        .send(&b"\x01hello"[..], peer().ip(), peer().port())
        .await
        .unwrap();

    assert!(service.is_initialized());
    assert_eq!(bridge.sends().len(), 1);
}

#[tokio::test]
async fn test_close_releases_udp_transport() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.add_service(ServiceType::Discovery, |_, _| {});
    service.init().await.unwrap();
    let socket = service.socket().unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    service.close_signal().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    service.close().await;

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(service.service_count(), 0);
    assert!(service.socket().is_none());
    assert_eq!(bridge.close_count(socket.id()), 1);
    assert_eq!(service.udp().shutdown_count(), 1);
    assert!(service.get_info().is_none());
}

#[tokio::test]
async fn test_native_close_uninitializes() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    let socket_id = service.socket().unwrap().id();

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    service.close_signal().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bridge.deliver(peerlink_net::udp::BridgeEvent::Close { socket_id });

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(service.state(), ServiceState::Uninitialized);
}

#[tokio::test]
async fn test_socket_errors_are_forwarded() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    let socket_id = service.socket().unwrap().id();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let capture = errors.clone();
    service
        .error()
        .connect(move |err: &NetworkError| capture.lock().push(err.clone()));

    bridge.deliver(peerlink_net::udp::BridgeEvent::Error {
        socket_id,
        message: "network unreachable".into(),
    });

    assert_eq!(errors.lock().len(), 1);
    assert_eq!(service.stats().errors, 1);
}

#[tokio::test]
async fn test_missing_broadcast_does_not_block_init() {
    let bridge = StubBridge::with_capabilities(bare_capabilities());
    let service = service_on(&bridge);

    service.init().await.unwrap();

    assert!(service.is_initialized());
    assert!(!service.socket().unwrap().is_broadcast());
    assert_eq!(bridge.count(|call| matches!(call, Call::SetBroadcast(..))), 0);
}

#[tokio::test]
async fn test_bind_failure_releases_reference() {
    let bridge = StubBridge::new();
    bridge.set_bind_error(Some(address_in_use()));
    let service = service_on(&bridge);

    let err = service.init().await.unwrap_err();

    assert!(matches!(err, NetworkError::Bind { code: "EADDRINUSE", .. }));
    assert!(!service.is_initialized());
    assert_eq!(service.udp().ref_count(), 0);
    assert_eq!(service.udp().shutdown_count(), 1);
}

#[tokio::test]
async fn test_unbound_service_skips_bind() {
    let bridge = StubBridge::new();
    let udp = UdpTransport::new(bridge.loader());
    let service = ServiceTransport::new(udp, ServiceTransportConfig::new());

    service.init().await.unwrap();

    assert_eq!(bridge.count(|call| matches!(call, Call::Bind(..))), 0);
    assert!(service.get_info().is_none());
    // Revalidation accepts an unbound socket when no port is configured.
    service.init().await.unwrap();
    assert_eq!(bridge.count(|call| matches!(call, Call::CreateSocket(_))), 1);
}

#[tokio::test]
async fn test_diagnostics_report() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.add_service(ServiceType::Discovery, |_, _| {});
    service.add_service(ServiceType::Heartbeat, |_, _| {});
    service.init().await.unwrap();
    service
        .send(&b"\x01hi"[..], peer().ip(), peer().port())
        .await
        .unwrap();

    let report = service.run_diagnostics();
    assert!(report.contains("initialized: true"));
    assert!(report.contains("local address: 0.0.0.0:49497"));
    assert!(report.contains("services: 2 [1, 8]"));
    assert!(report.contains("sent: 1 packets, 3 bytes"));
    assert!(report.contains("udp transport: Ready (1 references)"));
}

#[tokio::test]
async fn test_shared_udp_transport_outlives_one_service() {
    let bridge = StubBridge::new();
    let udp = UdpTransport::new(bridge.loader());
    let first = ServiceTransport::new(udp.clone(), ServiceTransportConfig::new().port(49497));
    let second = ServiceTransport::new(udp.clone(), ServiceTransportConfig::new().port(49498));

    first.init().await.unwrap();
    second.init().await.unwrap();
    assert_eq!(udp.ref_count(), 2);

    first.close().await;
    assert!(udp.is_ready());
    assert!(second.socket().unwrap().is_live());

    second.close().await;
    assert_eq!(udp.shutdown_count(), 1);
}

#[tokio::test]
async fn test_forced_shutdown_voids_service_reference() {
    init_tracing();
    let bridge = StubBridge::new();
    let udp = UdpTransport::new(bridge.loader());
    let service = ServiceTransport::new(udp.clone(), ServiceTransportConfig::new().port(49497));
    service.init().await.unwrap();

    udp.force_shutdown().await;
    assert_eq!(service.state(), ServiceState::Uninitialized);

    // A later consumer brings the transport back up with its own reference.
    let other = udp.acquire().await.unwrap();
    let socket = other.create_socket(SocketOptions::default()).await.unwrap();

    service.close().await;

    assert_eq!(udp.ref_count(), 1);
    assert!(udp.is_ready());
    assert_eq!(udp.shutdown_count(), 1);
    assert_eq!(socket.state(), PacketSocketState::Unbound);
    assert!(socket.is_live());
}

#[tokio::test]
async fn test_send_recovers_after_forced_shutdown() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();

    service.udp().force_shutdown().await;
    assert!(!service.is_initialized());
    assert_eq!(service.udp().ref_count(), 0);

    service
        .send(&b"\x01hello"[..], peer().ip(), peer().port())
        .await
        .unwrap();

    assert!(service.is_initialized());
    assert_eq!(service.udp().ref_count(), 1);
    assert_eq!(bridge.count(|call| matches!(call, Call::CreateSocket(_))), 2);

    service.close().await;
    assert_eq!(service.udp().ref_count(), 0);
    assert_eq!(service.udp().shutdown_count(), 2);
}

#[tokio::test]
async fn test_failed_init_after_forced_shutdown_releases_nothing_twice() {
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    service.udp().force_shutdown().await;

    bridge.set_bind_error(Some(address_in_use()));
    assert!(service.init().await.is_err());
    assert_eq!(service.udp().ref_count(), 0);
    assert_eq!(service.udp().shutdown_count(), 2);

    service.close().await;
    assert_eq!(service.udp().shutdown_count(), 2);
}

#[tokio::test]
async fn test_stale_send_keeps_binding_rebuilt_meanwhile() {
    init_tracing();
    let bridge = StubBridge::new();
    let service = service_on(&bridge);
    service.init().await.unwrap();
    let first = service.socket().unwrap();

    // The held send reports the socket as unknown once released.
    bridge.gate_sends();
    bridge.fail_next_sends(1);
    let sender = service.clone();
    let held = tokio::spawn(async move {
        sender
            .send(&b"\x08ping"[..], peer().ip(), peer().port())
            .await
    });
    while bridge.sends().is_empty() {
        tokio::task::yield_now().await;
    }

    // Another caller rebuilds the binding while that send is in flight.
    service.udp().registry().invalidate_all();
    service.init().await.unwrap();
    let rebuilt = service.socket().unwrap();
    assert_ne!(first.id(), rebuilt.id());

    bridge.open_sends();
    held.await.unwrap().unwrap();

    assert_eq!(bridge.count(|call| matches!(call, Call::CreateSocket(_))), 2);
    let current = service.socket().unwrap();
    assert_eq!(current.id(), rebuilt.id());
    assert!(current.is_live());
    assert_eq!(service.stats().reinitializations, 1);
    assert!(matches!(
        bridge.sends().last(),
        Some(Call::Send { socket_id, .. }) if *socket_id == rebuilt.id()
    ));
}
