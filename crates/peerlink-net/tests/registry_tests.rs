//! Tests for socket registry routing and native module reload detection.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{StubBridge, init_tracing};
use parking_lot::Mutex;
use peerlink_net::NetworkError;
use peerlink_net::udp::{
    BridgeCapabilities, EventPath, GenerationCheck, ModuleGeneration, PacketSocketState,
    SocketId, SocketOptions, UdpTransport,
};

async fn ready_transport(bridge: &Arc<StubBridge>) -> UdpTransport {
    let transport = UdpTransport::new(bridge.loader());
    transport.acquire().await.unwrap();
    transport
}

fn peer() -> SocketAddr {
    "192.168.1.20:49497".parse().unwrap()
}

#[tokio::test]
async fn test_new_generation_invalidates_tracked_sockets() {
    init_tracing();
    let bridge = StubBridge::new();
    let transport = ready_transport(&bridge).await;

    let socket = transport.create_socket(SocketOptions::default()).await.unwrap();
    socket.bind(0, None).await.unwrap();
    socket.message.connect(|_| {});
    socket.error.connect(|_| {});
    let old_id = socket.id();
    assert!(transport.registry().resolve(old_id).is_some());

    let check = transport
        .registry()
        .record_generation(ModuleGeneration::new(1_700_000_500_000));
    assert!(matches!(check, GenerationCheck::Reset { invalidated: 1, .. }));

    assert!(transport.registry().resolve(old_id).is_none());
    assert_eq!(socket.state(), PacketSocketState::Invalidated);
    assert_eq!(socket.message.connection_count(), 0);
    assert_eq!(socket.error.connection_count(), 0);
    assert!(!socket.is_live());
    assert!(socket.address().is_none());
}

#[tokio::test]
async fn test_reload_detected_on_next_creation() {
    let bridge = StubBridge::new();
    let transport = ready_transport(&bridge).await;

    let old = transport.create_socket(SocketOptions::default()).await.unwrap();
    assert!(old.id().is_first());

    bridge.reload(ModuleGeneration::new(1_700_000_900_000));
    let new = transport.create_socket(SocketOptions::default()).await.unwrap();

    // Same numeric id, different wrapper.
    assert_eq!(new.id(), old.id());
    assert_eq!(old.state(), PacketSocketState::Invalidated);
    let resolved = transport.registry().resolve(new.id()).unwrap();
    assert!(Arc::ptr_eq(&resolved, &new));
    assert!(!Arc::ptr_eq(&resolved, &old));
    assert_eq!(
        transport.registry().current_generation(),
        Some(ModuleGeneration::new(1_700_000_900_000))
    );
}

#[tokio::test]
async fn test_generation_within_tolerance_keeps_sockets() {
    let bridge = StubBridge::new();
    let transport = ready_transport(&bridge).await;

    let socket = transport.create_socket(SocketOptions::default()).await.unwrap();
    let check = transport
        .registry()
        .record_generation(ModuleGeneration::new(1_700_000_000_001));
    assert_eq!(check, GenerationCheck::Unchanged);
    assert!(socket.is_live());
}

#[tokio::test]
async fn test_send_on_invalidated_socket_fails_distinctly() {
    let bridge = StubBridge::new();
    let transport = ready_transport(&bridge).await;

    let socket = transport.create_socket(SocketOptions::default()).await.unwrap();
    transport.registry().invalidate_all();

    let err = socket
        .send(&b"hello"[..], 49497, peer().ip())
        .await
        .unwrap_err();
    assert!(err.is_invalidated());
    assert!(bridge.sends().is_empty());
}

#[tokio::test]
async fn test_reissued_first_id_rechecks_module() {
    let bridge = StubBridge::new();
    let transport = ready_transport(&bridge).await;

    transport.create_socket(SocketOptions::default()).await.unwrap();
    transport.create_socket(SocketOptions::default()).await.unwrap();

    // Ids restart without a generation change; the capability check passes.
    bridge.restart_ids();
    let socket = transport.create_socket(SocketOptions::default()).await.unwrap();
    assert!(socket.id().is_first());
    assert!(socket.is_live());

    transport.create_socket(SocketOptions::default()).await.unwrap();

    // Restart again, this time the module has lost its entry points.
    bridge.restart_ids();
    bridge.set_capabilities(BridgeCapabilities {
        bind: false,
        ..BridgeCapabilities::full()
    });
    let err = transport
        .create_socket(SocketOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::NativeModuleMissing(_)));
    assert_eq!(socket.state(), PacketSocketState::Invalidated);
    assert_eq!(transport.socket_count(), 0);
}

#[tokio::test]
async fn test_events_for_unknown_socket_are_dropped() {
    let bridge = StubBridge::new();
    let _transport = ready_transport(&bridge).await;

    bridge.inject(SocketId::new(99), b"stray", peer());
}

#[tokio::test]
async fn test_process_wide_channel_routes_by_id() {
    let bridge = StubBridge::with_capabilities(BridgeCapabilities::minimal());
    let transport = ready_transport(&bridge).await;

    let first = transport.create_socket(SocketOptions::default()).await.unwrap();
    let second = transport.create_socket(SocketOptions::default()).await.unwrap();
    first.bind(0, None).await.unwrap();
    second.bind(0, None).await.unwrap();
    assert_eq!(first.event_path(), Some(EventPath::ProcessWide));
    assert!(!bridge.has_socket_sink(first.id()));

    let first_seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let second_seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = first_seen.clone();
    first.message.connect(move |d| capture.lock().push(d.data.to_vec()));
    let capture = second_seen.clone();
    second.message.connect(move |d| capture.lock().push(d.data.to_vec()));

    bridge.inject(first.id(), b"for-first", peer());
    bridge.inject(second.id(), b"for-second", peer());
    bridge.inject(first.id(), b"again", peer());

    assert_eq!(
        *first_seen.lock(),
        vec![b"for-first".to_vec(), b"again".to_vec()]
    );
    assert_eq!(*second_seen.lock(), vec![b"for-second".to_vec()]);
}

#[tokio::test]
async fn test_closed_socket_leaves_registry() {
    let bridge = StubBridge::new();
    let transport = ready_transport(&bridge).await;

    let socket = transport.create_socket(SocketOptions::default()).await.unwrap();
    assert!(transport.registry().contains(socket.id()));
    socket.close().await.unwrap();
    assert!(!transport.registry().contains(socket.id()));
    assert!(transport.registry().is_empty());
}
