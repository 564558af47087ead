//! Scripted native bridge shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use peerlink_net::udp::{
    BridgeCapabilities, BridgeError, BridgeErrorKind, BridgeEvent, BridgeLoader, CreatedSocket,
    EventSink, ModuleGeneration, NativeBridge, RawMessage, RawPayload, SocketId, SocketOptions,
};

/// A native call recorded by [`StubBridge`].
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Initialize,
    CreateSocket(SocketOptions),
    Bind(SocketId, SocketAddr),
    Send {
        socket_id: SocketId,
        offset: usize,
        length: usize,
        target: SocketAddr,
        data: Bytes,
    },
    SendEncoded {
        socket_id: SocketId,
        payload: String,
        target: SocketAddr,
    },
    Close(SocketId),
    CloseAll,
    SetBroadcast(SocketId, bool),
    SetTtl(SocketId, u32),
    AddMembership(SocketId, IpAddr),
}

/// In-memory bridge that records calls and injects failures and events.
pub struct StubBridge {
    capabilities: Mutex<BridgeCapabilities>,
    generation: Mutex<ModuleGeneration>,
    next_id: Mutex<u64>,
    open: Mutex<HashMap<SocketId, Option<SocketAddr>>>,
    global_sink: Mutex<Option<EventSink>>,
    socket_sinks: Mutex<HashMap<SocketId, EventSink>>,
    calls: Mutex<Vec<Call>>,
    fail_sends: AtomicUsize,
    fail_creates: AtomicUsize,
    fail_initialize: AtomicBool,
    bind_error: Mutex<Option<BridgeError>>,
    echo: AtomicBool,
    send_gate: Mutex<Option<Arc<Notify>>>,
}

impl StubBridge {
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(BridgeCapabilities::full())
    }

    pub fn with_capabilities(capabilities: BridgeCapabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities: Mutex::new(capabilities),
            generation: Mutex::new(ModuleGeneration::new(1_700_000_000_000)),
            next_id: Mutex::new(1),
            open: Mutex::new(HashMap::new()),
            global_sink: Mutex::new(None),
            socket_sinks: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_sends: AtomicUsize::new(0),
            fail_creates: AtomicUsize::new(0),
            fail_initialize: AtomicBool::new(false),
            bind_error: Mutex::new(None),
            echo: AtomicBool::new(false),
            send_gate: Mutex::new(None),
        })
    }

    pub fn loader(self: &Arc<Self>) -> BridgeLoader {
        let bridge = self.clone();
        Arc::new(move || Some(bridge.clone() as Arc<dyn NativeBridge>))
    }

    pub fn set_capabilities(&self, capabilities: BridgeCapabilities) {
        *self.capabilities.lock() = capabilities;
    }

    /// Simulate a native module reload: new generation, ids restart, every
    /// open socket is forgotten.
    pub fn reload(&self, generation: ModuleGeneration) {
        *self.generation.lock() = generation;
        *self.next_id.lock() = 1;
        self.open.lock().clear();
        self.socket_sinks.lock().clear();
    }

    /// Restart ids without reporting a new generation.
    pub fn restart_ids(&self) {
        *self.next_id.lock() = 1;
    }

    /// Forget a socket as if it was closed natively.
    pub fn forget(&self, socket_id: SocketId) {
        self.open.lock().remove(&socket_id);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn set_bind_error(&self, error: Option<BridgeError>) {
        *self.bind_error.lock() = error;
    }

    /// Deliver every sent datagram back to the sending socket, synchronously,
    /// before the send completes.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// Hold every following send after it is recorded until the returned
    /// gate is notified. Sends issued after `open_sends` pass straight through.
    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock() = Some(gate.clone());
        gate
    }

    /// Stop gating new sends and let a held send continue.
    pub fn open_sends(&self) {
        if let Some(gate) = self.send_gate.lock().take() {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn sends(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Send { .. } | Call::SendEncoded { .. }))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| pred(call)).count()
    }

    pub fn close_count(&self, socket_id: SocketId) -> usize {
        self.count(|call| *call == Call::Close(socket_id))
    }

    pub fn open_sockets(&self) -> usize {
        self.open.lock().len()
    }

    pub fn has_socket_sink(&self, socket_id: SocketId) -> bool {
        self.socket_sinks.lock().contains_key(&socket_id)
    }

    pub fn has_global_sink(&self) -> bool {
        self.global_sink.lock().is_some()
    }

    /// Route an event the way a native module would.
    pub fn deliver(&self, event: BridgeEvent) {
        let sink = self
            .socket_sinks
            .lock()
            .get(&event.socket_id())
            .cloned()
            .or_else(|| self.global_sink.lock().clone());
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Deliver an inbound datagram to `socket_id`.
    pub fn inject(&self, socket_id: SocketId, data: &[u8], from: SocketAddr) {
        self.deliver(BridgeEvent::Message(RawMessage {
            socket_id,
            payload: RawPayload::Bytes(Bytes::copy_from_slice(data)),
            address: from.ip().to_string(),
            port: from.port(),
            family: None,
        }));
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check_open(&self, socket_id: SocketId) -> Result<(), BridgeError> {
        if self.open.lock().contains_key(&socket_id) {
            Ok(())
        } else {
            Err(BridgeError::socket_not_found(socket_id))
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NativeBridge for StubBridge {
    fn capabilities(&self) -> BridgeCapabilities {
        *self.capabilities.lock()
    }

    async fn initialize(&self) -> Result<(), BridgeError> {
        self.record(Call::Initialize);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(BridgeError::other("module failed to start"));
        }
        Ok(())
    }

    fn set_event_sink(&self, sink: Option<EventSink>) {
        *self.global_sink.lock() = sink;
    }

    fn set_socket_event_sink(&self, socket_id: SocketId, sink: Option<EventSink>) -> bool {
        if !self.capabilities.lock().per_socket_events {
            return false;
        }
        match sink {
            Some(sink) => {
                self.socket_sinks.lock().insert(socket_id, sink);
            }
            None => {
                self.socket_sinks.lock().remove(&socket_id);
            }
        }
        true
    }

    async fn create_socket(&self, options: &SocketOptions) -> Result<CreatedSocket, BridgeError> {
        self.record(Call::CreateSocket(options.clone()));
        if Self::take_failure(&self.fail_creates) {
            return Err(BridgeError::other("too many open sockets"));
        }
        let socket_id = {
            let mut next = self.next_id.lock();
            let id = SocketId::new(*next);
            *next += 1;
            id
        };
        self.open.lock().insert(socket_id, None);
        Ok(CreatedSocket {
            socket_id,
            module_generation: *self.generation.lock(),
        })
    }

    async fn bind(&self, socket_id: SocketId, address: SocketAddr) -> Result<SocketAddr, BridgeError> {
        self.record(Call::Bind(socket_id, address));
        self.check_open(socket_id)?;
        if let Some(err) = self.bind_error.lock().clone() {
            return Err(err);
        }
        let bound = if address.port() == 0 {
            SocketAddr::new(address.ip(), 40_000 + socket_id.get() as u16)
        } else {
            address
        };
        self.open.lock().insert(socket_id, Some(bound));
        Ok(bound)
    }

    async fn send(
        &self,
        socket_id: SocketId,
        buffer: Bytes,
        offset: usize,
        length: usize,
        target: SocketAddr,
    ) -> Result<(), BridgeError> {
        let data = buffer.slice(offset..offset + length);
        self.record(Call::Send {
            socket_id,
            offset,
            length,
            target,
            data: data.clone(),
        });
        let gate = self.send_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if Self::take_failure(&self.fail_sends) {
            return Err(BridgeError::socket_not_found(socket_id));
        }
        self.check_open(socket_id)?;
        if self.echo.load(Ordering::SeqCst) {
            self.inject(socket_id, &data, target);
        }
        Ok(())
    }

    async fn send_encoded(
        &self,
        socket_id: SocketId,
        payload: String,
        target: SocketAddr,
    ) -> Result<(), BridgeError> {
        self.record(Call::SendEncoded {
            socket_id,
            payload,
            target,
        });
        if Self::take_failure(&self.fail_sends) {
            return Err(BridgeError::socket_not_found(socket_id));
        }
        self.check_open(socket_id)
    }

    async fn close(&self, socket_id: SocketId) -> Result<(), BridgeError> {
        self.record(Call::Close(socket_id));
        self.socket_sinks.lock().remove(&socket_id);
        self.open
            .lock()
            .remove(&socket_id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::socket_not_found(socket_id))
    }

    async fn close_all_sockets(&self) -> Result<(), BridgeError> {
        self.record(Call::CloseAll);
        self.open.lock().clear();
        self.socket_sinks.lock().clear();
        Ok(())
    }

    async fn set_broadcast(&self, socket_id: SocketId, enabled: bool) -> Result<(), BridgeError> {
        self.record(Call::SetBroadcast(socket_id, enabled));
        self.check_open(socket_id)
    }

    async fn set_ttl(&self, socket_id: SocketId, ttl: u32) -> Result<(), BridgeError> {
        self.record(Call::SetTtl(socket_id, ttl));
        self.check_open(socket_id)
    }

    async fn add_membership(
        &self,
        socket_id: SocketId,
        group: IpAddr,
        _interface: Option<IpAddr>,
    ) -> Result<(), BridgeError> {
        self.record(Call::AddMembership(socket_id, group));
        self.check_open(socket_id)
    }
}

/// Capabilities of a module that lacks every optional primitive.
pub fn bare_capabilities() -> BridgeCapabilities {
    BridgeCapabilities::minimal()
}

/// An address-in-use bind failure as a native module reports it.
pub fn address_in_use() -> BridgeError {
    BridgeError::new(BridgeErrorKind::AddressInUse, "Address already in use (os error 98)")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
