//! Packet socket with signal-based event delivery.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::Signal;
use peerlink_core::logging::targets;

use super::bridge::{
    BridgeCapabilities, BridgeError, BridgeErrorKind, BridgeEvent, CreatedSocket, EventSink,
    ModuleGeneration, NativeBridge, RawMessage, RawPayload, SocketId,
};
use super::config::{Datagram, SocketFamily, SocketOptions};
use super::registry::SocketRegistry;
use super::state::PacketSocketState;
use crate::Result;
use crate::error::NetworkError;

/// How native events reach this socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventPath {
    /// A dedicated sink installed for this socket.
    PerSocket,
    /// The process-wide sink, routed through the registry.
    ProcessWide,
}

struct PacketSocketInner {
    state: PacketSocketState,
    local_addr: Option<SocketAddr>,
    broadcast: bool,
    reuse_address: bool,
    event_path: Option<EventPath>,
}

/// Clears the in-progress send flag when dropped.
struct SendGuard<'a>(&'a AtomicBool);

impl<'a> SendGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A datagram socket backed by the native UDP module.
///
/// Sockets are created through [`UdpTransport::create_socket`] and are
/// always handled as `Arc<PacketSocket>`.
///
/// # Signals
///
/// - [`bound`](Self::bound): Emitted when the socket is bound successfully
/// - [`message`](Self::message): Emitted when a datagram is received
/// - [`error`](Self::error): Emitted when the native layer reports an error
/// - [`closed`](Self::closed): Emitted once when the socket is closed
///
/// A socket invalidated by a native module reload loses all its listeners
/// without any signal being emitted.
///
/// # Example
///
/// ```ignore
/// let socket = transport.create_socket(SocketOptions::default()).await?;
///
/// socket.message.connect(|datagram| {
///     println!("Received {} bytes from {}", datagram.data.len(), datagram.source);
/// });
///
/// socket.bind(49497, None).await?;
/// socket.send(&b"hello"[..], 49497, "192.168.1.20".parse()?).await?;
/// ```
///
/// [`UdpTransport::create_socket`]: super::UdpTransport::create_socket
pub struct PacketSocket {
    id: SocketId,
    family: SocketFamily,
    generation: ModuleGeneration,
    created_at: SystemTime,
    bridge: Arc<dyn NativeBridge>,
    capabilities: BridgeCapabilities,
    registry: Arc<SocketRegistry>,
    inner: Mutex<PacketSocketInner>,
    sending: AtomicBool,

    /// Signal emitted when the socket is bound successfully.
    pub bound: Signal<SocketAddr>,
    /// Signal emitted when a datagram is received.
    pub message: Signal<Datagram>,
    /// Signal emitted when an error occurs.
    pub error: Signal<NetworkError>,
    /// Signal emitted when the socket is closed.
    pub closed: Signal<()>,
}

impl PacketSocket {
    pub(crate) fn new(
        created: CreatedSocket,
        options: &SocketOptions,
        bridge: Arc<dyn NativeBridge>,
        capabilities: BridgeCapabilities,
        registry: Arc<SocketRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: created.socket_id,
            family: options.family,
            generation: created.module_generation,
            created_at: SystemTime::now(),
            bridge,
            capabilities,
            registry,
            inner: Mutex::new(PacketSocketInner {
                state: PacketSocketState::Unbound,
                local_addr: None,
                broadcast: options.broadcast,
                reuse_address: options.reuse_address,
                event_path: None,
            }),
            sending: AtomicBool::new(false),
            bound: Signal::new(),
            message: Signal::new(),
            error: Signal::new(),
            closed: Signal::new(),
        })
    }

    /// The native socket id.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The socket's address family.
    pub fn family(&self) -> SocketFamily {
        self.family
    }

    /// The module generation that created this socket.
    pub fn generation(&self) -> ModuleGeneration {
        self.generation
    }

    /// When the wrapper was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Get the current socket state.
    pub fn state(&self) -> PacketSocketState {
        self.inner.lock().state
    }

    /// The last successfully bound address, or `None` if unbound.
    pub fn address(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Whether broadcast is enabled.
    pub fn is_broadcast(&self) -> bool {
        self.inner.lock().broadcast
    }

    /// Whether the socket was created with address reuse.
    pub fn reuse_address(&self) -> bool {
        self.inner.lock().reuse_address
    }

    /// How native events reach this socket, once bound.
    pub fn event_path(&self) -> Option<EventPath> {
        self.inner.lock().event_path
    }

    /// Whether the socket is usable and still the registry's entry for its id.
    pub fn is_live(&self) -> bool {
        self.state().is_usable() && self.registry.is_current(self)
    }

    fn ensure_usable(&self, operation: &'static str) -> Result<PacketSocketState> {
        match self.inner.lock().state {
            PacketSocketState::Closed => Err(NetworkError::SocketClosed { socket_id: self.id }),
            PacketSocketState::Invalidated => Err(NetworkError::SocketInvalidated {
                socket_id: self.id,
                operation,
            }),
            state => Ok(state),
        }
    }

    /// Treat a native "socket not found" as a stale handle.
    fn native_error(&self, err: BridgeError, operation: &'static str) -> NetworkError {
        if err.kind == BridgeErrorKind::SocketNotFound {
            tracing::warn!(
                target: targets::UDP,
                socket_id = %self.id,
                operation,
                "native layer no longer knows this socket"
            );
            self.invalidate();
            self.registry.unregister(self);
        }
        err.into_network_error(self.id, operation)
    }

    /// Bind to `port` on `address`, or the family's wildcard address.
    ///
    /// A socket binds at most once; re-create it to bind elsewhere.
    pub async fn bind(self: &Arc<Self>, port: u16, address: Option<IpAddr>) -> Result<SocketAddr> {
        if self.ensure_usable("bind")? == PacketSocketState::Bound {
            return Err(NetworkError::AlreadyBound { socket_id: self.id });
        }

        let requested = SocketAddr::new(address.unwrap_or(self.family.unspecified()), port);
        tracing::debug!(target: targets::UDP, socket_id = %self.id, %requested, "binding socket");

        let local_addr = match self.bridge.bind(self.id, requested).await {
            Ok(addr) => addr,
            Err(err) => {
                let code = match err.kind {
                    BridgeErrorKind::SocketNotFound => return Err(self.native_error(err, "bind")),
                    BridgeErrorKind::AddressInUse => "EADDRINUSE",
                    _ => "ERR_SOCKET_BIND",
                };
                tracing::error!(
                    target: targets::UDP,
                    socket_id = %self.id,
                    code,
                    error = %err.message,
                    "bind failed"
                );
                return Err(NetworkError::Bind {
                    socket_id: self.id,
                    code,
                    message: err.message,
                });
            }
        };

        {
            let mut inner = self.inner.lock();
            match inner.state {
                PacketSocketState::Closed => {
                    return Err(NetworkError::SocketClosed { socket_id: self.id });
                }
                PacketSocketState::Invalidated => {
                    return Err(NetworkError::SocketInvalidated {
                        socket_id: self.id,
                        operation: "bind",
                    });
                }
                _ => {}
            }
            inner.state = PacketSocketState::Bound;
            inner.local_addr = Some(local_addr);
        }

        let path = self.install_event_sink();
        self.inner.lock().event_path = Some(path);

        tracing::info!(
            target: targets::UDP,
            socket_id = %self.id,
            %local_addr,
            event_path = ?path,
            "socket bound"
        );
        self.bound.emit(local_addr);
        Ok(local_addr)
    }

    fn install_event_sink(self: &Arc<Self>) -> EventPath {
        if !self.capabilities.per_socket_events {
            return EventPath::ProcessWide;
        }
        let weak = Arc::downgrade(self);
        let sink: EventSink = Arc::new(move |event| {
            if let Some(socket) = weak.upgrade() {
                socket.dispatch(event);
            }
        });
        if self.bridge.set_socket_event_sink(self.id, Some(sink)) {
            EventPath::PerSocket
        } else {
            EventPath::ProcessWide
        }
    }

    /// Send `data` to `address:port`.
    pub async fn send(&self, data: impl Into<Bytes>, port: u16, address: IpAddr) -> Result<()> {
        let data = data.into();
        let length = data.len();
        self.send_range(data, 0, length, port, address).await
    }

    /// Send `buffer[offset..offset + length]` to `address:port`.
    ///
    /// The range is handed to the native layer without copying when the
    /// bridge supports it; otherwise only the range is base64 encoded.
    ///
    /// A send issued while another send on this socket is still in progress
    /// (for example from a `message` handler fired during the send) fails
    /// with [`NetworkError::ReentrantSend`].
    pub async fn send_range(
        &self,
        buffer: Bytes,
        offset: usize,
        length: usize,
        port: u16,
        address: IpAddr,
    ) -> Result<()> {
        let _guard = SendGuard::acquire(&self.sending)
            .ok_or(NetworkError::ReentrantSend { socket_id: self.id })?;
        self.ensure_usable("send")?;

        if offset.checked_add(length).is_none_or(|end| end > buffer.len()) {
            return Err(NetworkError::InvalidArgument(format!(
                "range {offset}+{length} exceeds buffer of {} bytes",
                buffer.len()
            )));
        }

        let target = SocketAddr::new(address, port);
        let result = if self.capabilities.send_zero_copy {
            self.bridge
                .send(self.id, buffer, offset, length, target)
                .await
        } else if self.capabilities.send_encoded {
            let encoded = BASE64.encode(&buffer[offset..offset + length]);
            self.bridge.send_encoded(self.id, encoded, target).await
        } else {
            Err(BridgeError::unsupported("send"))
        };

        if let Err(err) = result {
            return Err(self.native_error(err, "send"));
        }
        if self.state() == PacketSocketState::Invalidated {
            return Err(NetworkError::SocketInvalidated {
                socket_id: self.id,
                operation: "send",
            });
        }

        tracing::trace!(target: targets::UDP, socket_id = %self.id, %target, length, "datagram sent");
        Ok(())
    }

    async fn apply_option<F>(
        &self,
        supported: bool,
        operation: &'static str,
        call: F,
    ) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), BridgeError>>,
    {
        self.ensure_usable(operation)?;
        if !supported {
            return Err(NetworkError::Unsupported { operation });
        }
        call.await.map_err(|err| self.native_error(err, operation))
    }

    /// Enable or disable broadcast.
    pub async fn set_broadcast(&self, enabled: bool) -> Result<()> {
        self.apply_option(
            self.capabilities.set_broadcast,
            "setBroadcast",
            self.bridge.set_broadcast(self.id, enabled),
        )
        .await?;
        self.inner.lock().broadcast = enabled;
        Ok(())
    }

    /// Set the unicast TTL.
    pub async fn set_ttl(&self, ttl: u32) -> Result<()> {
        self.apply_option(
            self.capabilities.set_ttl,
            "setTTL",
            self.bridge.set_ttl(self.id, ttl),
        )
        .await
    }

    /// Set the multicast TTL.
    pub async fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.apply_option(
            self.capabilities.set_multicast_ttl,
            "setMulticastTTL",
            self.bridge.set_multicast_ttl(self.id, ttl),
        )
        .await
    }

    /// Enable or disable multicast loopback.
    pub async fn set_multicast_loopback(&self, enabled: bool) -> Result<()> {
        self.apply_option(
            self.capabilities.set_multicast_loopback,
            "setMulticastLoopback",
            self.bridge.set_multicast_loopback(self.id, enabled),
        )
        .await
    }

    /// Join a multicast group.
    pub async fn add_membership(&self, group: IpAddr, interface: Option<IpAddr>) -> Result<()> {
        self.apply_option(
            self.capabilities.add_membership,
            "addMembership",
            self.bridge.add_membership(self.id, group, interface),
        )
        .await
    }

    /// Leave a multicast group.
    pub async fn drop_membership(&self, group: IpAddr, interface: Option<IpAddr>) -> Result<()> {
        self.apply_option(
            self.capabilities.drop_membership,
            "dropMembership",
            self.bridge.drop_membership(self.id, group, interface),
        )
        .await
    }

    /// Close the socket.
    ///
    /// Closing twice is a no-op. A native "socket not found" is ignored since
    /// the socket is gone either way.
    pub async fn close(&self) -> Result<()> {
        let (previous, path) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            if previous == PacketSocketState::Closed {
                return Ok(());
            }
            inner.state = PacketSocketState::Closed;
            inner.local_addr = None;
            (previous, inner.event_path.take())
        };

        if path == Some(EventPath::PerSocket) {
            self.bridge.set_socket_event_sink(self.id, None);
        }
        self.registry.unregister(self);

        let result = if previous == PacketSocketState::Invalidated {
            Ok(())
        } else {
            self.bridge.close(self.id).await
        };

        tracing::debug!(target: targets::UDP, socket_id = %self.id, "socket closed");
        self.closed.emit(());
        self.disconnect_listeners();

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind == BridgeErrorKind::SocketNotFound => {
                tracing::debug!(target: targets::UDP, socket_id = %self.id, "native socket already gone");
                Ok(())
            }
            Err(err) => Err(err.into_network_error(self.id, "close")),
        }
    }

    /// Mark the socket stale and drop all listeners without emitting.
    pub(crate) fn invalidate(&self) {
        let path = {
            let mut inner = self.inner.lock();
            if inner.state == PacketSocketState::Closed {
                return;
            }
            inner.state = PacketSocketState::Invalidated;
            inner.local_addr = None;
            inner.event_path.take()
        };
        if path == Some(EventPath::PerSocket) {
            self.bridge.set_socket_event_sink(self.id, None);
        }
        self.disconnect_listeners();
        tracing::debug!(target: targets::UDP, socket_id = %self.id, "socket invalidated");
    }

    fn disconnect_listeners(&self) {
        self.bound.disconnect_all();
        self.message.disconnect_all();
        self.error.disconnect_all();
        self.closed.disconnect_all();
    }

    /// Deliver a native event to this socket's listeners.
    pub(crate) fn dispatch(&self, event: BridgeEvent) {
        if !self.state().is_usable() {
            tracing::trace!(target: targets::UDP, socket_id = %self.id, "dropping event for unusable socket");
            return;
        }
        match event {
            BridgeEvent::Message(raw) => match normalize_message(raw) {
                Ok(datagram) => {
                    self.message.emit(datagram);
                }
                Err(err) => {
                    tracing::warn!(target: targets::UDP, socket_id = %self.id, error = %err, "malformed inbound message");
                    self.error.emit(err);
                }
            },
            BridgeEvent::Error { message, .. } => {
                tracing::warn!(target: targets::UDP, socket_id = %self.id, error = %message, "native socket error");
                self.error.emit(NetworkError::Native {
                    socket_id: self.id,
                    operation: "receive",
                    message,
                });
            }
            BridgeEvent::Close { .. } => {
                {
                    let mut inner = self.inner.lock();
                    inner.state = PacketSocketState::Closed;
                    inner.local_addr = None;
                    inner.event_path = None;
                }
                self.registry.unregister(self);
                tracing::debug!(target: targets::UDP, socket_id = %self.id, "socket closed by native layer");
                self.closed.emit(());
                self.disconnect_listeners();
            }
        }
    }
}

/// Turn a native message into a [`Datagram`], decoding base64 payloads.
pub(crate) fn normalize_message(raw: RawMessage) -> Result<Datagram> {
    let malformed = |message: String| NetworkError::Native {
        socket_id: raw.socket_id,
        operation: "receive",
        message,
    };

    let ip: IpAddr = raw
        .address
        .parse()
        .map_err(|_| malformed(format!("invalid source address {:?}", raw.address)))?;
    let data = match &raw.payload {
        RawPayload::Bytes(bytes) => bytes.clone(),
        RawPayload::Base64(text) => BASE64
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(|e| malformed(format!("invalid base64 payload: {e}")))?,
    };
    let family = raw
        .family
        .as_deref()
        .and_then(SocketFamily::from_native)
        .unwrap_or_else(|| SocketFamily::of(&ip));

    Ok(Datagram {
        data,
        source: SocketAddr::new(ip, raw.port),
        family,
    })
}

impl std::fmt::Debug for PacketSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PacketSocket")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("generation", &self.generation)
            .field("state", &inner.state)
            .field("local_addr", &inner.local_addr)
            .finish()
    }
}
