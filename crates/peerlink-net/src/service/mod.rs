//! Service-multiplexing transport over one packet socket.
//!
//! Several logical sub-protocols share one UDP port. Each datagram starts
//! with a one-byte service tag; registered handlers receive the payload with
//! the tag stripped. Framed protocol packets (long header, see
//! [`FramingPolicy`]) and JSON envelopes are recognized as well.
//!
//! # Example
//!
//! ```ignore
//! use peerlink_net::service::{ServiceTransport, ServiceTransportConfig, ServiceType, DEFAULT_SERVICE_PORT};
//!
//! let service = ServiceTransport::new(udp, ServiceTransportConfig::new().port(DEFAULT_SERVICE_PORT));
//!
//! service.add_service(ServiceType::Discovery, |packet, remote| {
//!     println!("discovery from {}:{}: {:?}", remote.address, remote.port, packet);
//! });
//!
//! service.init().await?;
//! service.send(&[1, 0x41][..], "255.255.255.255".parse()?, DEFAULT_SERVICE_PORT).await?;
//! ```

mod config;
mod demux;
mod stats;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use peerlink_core::logging::{span_names, targets};
use peerlink_core::{ConnectionId, Signal};
use serde_json::Value;
use tracing::Instrument;

pub use config::{DEFAULT_SERVICE_PORT, FramingPolicy, ServiceTransportConfig, ServiceType};
pub use demux::{Route, classify};
pub use stats::TransportStats;

use self::stats::StatsCounters;
use crate::Result;
use crate::error::NetworkError;
use crate::manager::{EventForwarder, EventForwarding, Transport, TransportEvent, TransportKind};
use crate::udp::{Datagram, PacketSocket, SocketFamily, SocketOptions, UdpTransport};

/// Payload handed to a service handler.
#[derive(Clone, Debug, PartialEq)]
pub enum ServicePacket {
    /// The datagram with its leading tag byte removed.
    Bytes(Bytes),
    /// A parsed JSON envelope.
    Json(Value),
}

impl ServicePacket {
    /// The raw bytes, if this is a binary packet.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ServicePacket::Bytes(bytes) => Some(bytes),
            ServicePacket::Json(_) => None,
        }
    }
}

/// Sender of an inbound datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Sender address.
    pub address: IpAddr,
    /// Sender port.
    pub port: u16,
    /// Sender family.
    pub family: SocketFamily,
    /// Size of the full datagram.
    pub size: usize,
}

impl RemoteInfo {
    fn of(datagram: &Datagram) -> Self {
        Self {
            address: datagram.source.ip(),
            port: datagram.source.port(),
            family: datagram.family,
            size: datagram.data.len(),
        }
    }

    /// The sender as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// A datagram emitted on the generic `message` signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// The full, unmodified payload.
    pub data: Bytes,
    /// The sender.
    pub remote: RemoteInfo,
    /// The service tag the payload was routed by, if any.
    pub service_tag: Option<u8>,
    /// Whether the payload was recognized as a framed protocol packet.
    pub framed: bool,
}

/// The local endpoint of a bound service transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalInfo {
    /// Bound address.
    pub host: IpAddr,
    /// Bound port.
    pub port: u16,
}

/// Handler for one service tag.
pub type ServiceHandler = Arc<dyn Fn(ServicePacket, RemoteInfo) + Send + Sync>;

/// Service transport state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServiceState {
    /// No socket is held.
    #[default]
    Uninitialized,
    /// A socket is open and handlers are installed.
    Ready,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Uninitialized => write!(f, "Uninitialized"),
            ServiceState::Ready => write!(f, "Ready"),
        }
    }
}

struct Binding {
    socket: Arc<PacketSocket>,
    connections: [ConnectionId; 3],
}

impl Binding {
    fn detach(&self) {
        let [message, error, closed] = self.connections;
        self.socket.message.disconnect(message);
        self.socket.error.disconnect(error);
        self.socket.closed.disconnect(closed);
    }
}

struct ServiceInner {
    state: ServiceState,
    binding: Option<Binding>,
    /// UDP teardown count when our reference was taken. A later teardown
    /// (forced shutdown) voids the reference.
    reference_epoch: Option<u64>,
}

struct ServiceShared {
    udp: UdpTransport,
    config: ServiceTransportConfig,
    services: RwLock<HashMap<u8, ServiceHandler>>,
    inner: Mutex<ServiceInner>,
    init_lock: tokio::sync::Mutex<()>,
    stats: StatsCounters,
    ready: Signal<()>,
    close: Signal<()>,
    error: Signal<NetworkError>,
    message: Signal<InboundMessage>,
}

impl ServiceShared {
    fn handle_inbound(&self, datagram: &Datagram) {
        let _span = tracing::trace_span!(target: targets::SERVICE, span_names::DEMUX).entered();
        self.stats.record_received(datagram.data.len());
        let remote = RemoteInfo::of(datagram);
        let route = {
            let services = self.services.read();
            demux::classify(&datagram.data, &self.config.framing, |tag| {
                services.contains_key(&tag)
            })
        };
        tracing::trace!(
            target: targets::SERVICE,
            size = datagram.data.len(),
            source = %datagram.source,
            ?route,
            "inbound datagram"
        );

        let (service_tag, framed) = match route {
            Route::Framed => (None, true),
            Route::Service(tag) => {
                if let Some(handler) = self.handler(tag) {
                    handler(ServicePacket::Bytes(datagram.data.slice(1..)), remote.clone());
                }
                (Some(tag), false)
            }
            Route::Json { tag, value } => {
                if let Some(handler) = self.handler(tag) {
                    handler(ServicePacket::Json(value), remote.clone());
                }
                (Some(tag), false)
            }
            Route::Unrecognized => (None, false),
        };

        self.message.emit(InboundMessage {
            data: datagram.data.clone(),
            remote,
            service_tag,
            framed,
        });
    }

    fn handler(&self, tag: u8) -> Option<ServiceHandler> {
        self.services.read().get(&tag).cloned()
    }

    fn handle_socket_error(&self, err: &NetworkError) {
        self.stats.record_error();
        tracing::warn!(target: targets::SERVICE, error = %err, "socket error");
        self.error.emit(err.clone());
    }

    fn handle_socket_closed(&self, socket: &PacketSocket) {
        let detached = {
            let mut inner = self.inner.lock();
            let ours = inner
                .binding
                .as_ref()
                .is_some_and(|binding| std::ptr::eq(Arc::as_ptr(&binding.socket), socket));
            if ours {
                inner.binding = None;
                inner.state = ServiceState::Uninitialized;
            }
            ours
        };
        if detached {
            tracing::info!(target: targets::SERVICE, socket_id = %socket.id(), "socket closed by native layer");
            self.close.emit(());
        }
    }
}

/// A UDP transport that routes datagrams by service tag.
///
/// Handles are cheap clones of the same transport.
///
/// # Signals
///
/// - [`ready`](Self::ready): Emitted after a successful initialization
/// - [`close`](Self::close_signal): Emitted when the transport closes
/// - [`error`](Self::error): Emitted when the socket reports an error
/// - [`message`](Self::message): Emitted for every inbound datagram
#[derive(Clone)]
pub struct ServiceTransport {
    shared: Arc<ServiceShared>,
}

impl ServiceTransport {
    /// Create an uninitialized transport on top of `udp`.
    pub fn new(udp: UdpTransport, config: ServiceTransportConfig) -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                udp,
                config,
                services: RwLock::new(HashMap::new()),
                inner: Mutex::new(ServiceInner {
                    state: ServiceState::Uninitialized,
                    binding: None,
                    reference_epoch: None,
                }),
                init_lock: tokio::sync::Mutex::new(()),
                stats: StatsCounters::default(),
                ready: Signal::new(),
                close: Signal::new(),
                error: Signal::new(),
                message: Signal::new(),
            }),
        }
    }

    /// Signal emitted after a successful initialization.
    pub fn ready(&self) -> &Signal<()> {
        &self.shared.ready
    }

    /// Signal emitted when the transport closes.
    pub fn close_signal(&self) -> &Signal<()> {
        &self.shared.close
    }

    /// Signal emitted when the socket reports an error.
    pub fn error(&self) -> &Signal<NetworkError> {
        &self.shared.error
    }

    /// Signal emitted for every inbound datagram.
    pub fn message(&self) -> &Signal<InboundMessage> {
        &self.shared.message
    }

    /// The configuration this transport was created with.
    pub fn config(&self) -> &ServiceTransportConfig {
        &self.shared.config
    }

    /// The underlying UDP transport.
    pub fn udp(&self) -> &UdpTransport {
        &self.shared.udp
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.shared.inner.lock().state
    }

    /// Whether a socket is held.
    pub fn is_initialized(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// The socket in use, if initialized.
    pub fn socket(&self) -> Option<Arc<PacketSocket>> {
        self.shared
            .inner
            .lock()
            .binding
            .as_ref()
            .map(|binding| binding.socket.clone())
    }

    /// A snapshot of the traffic counters.
    pub fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    /// Register `handler` for `tag`, replacing any earlier handler.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn add_service<F>(&self, tag: impl Into<u8>, handler: F) -> bool
    where
        F: Fn(ServicePacket, RemoteInfo) + Send + Sync + 'static,
    {
        let tag = tag.into();
        let replaced = self
            .shared
            .services
            .write()
            .insert(tag, Arc::new(handler))
            .is_some();
        tracing::debug!(target: targets::SERVICE, tag, replaced, "service registered");
        replaced
    }

    /// Remove the handler for `tag`.
    pub fn remove_service(&self, tag: impl Into<u8>) -> bool {
        let tag = tag.into();
        let removed = self.shared.services.write().remove(&tag).is_some();
        tracing::debug!(target: targets::SERVICE, tag, removed, "service removed");
        removed
    }

    /// Remove every handler.
    pub fn clear_services(&self) {
        self.shared.services.write().clear();
    }

    /// Number of registered handlers.
    pub fn service_count(&self) -> usize {
        self.shared.services.read().len()
    }

    /// Whether `tag` has a handler.
    pub fn has_service(&self, tag: impl Into<u8>) -> bool {
        self.shared.services.read().contains_key(&tag.into())
    }

    /// Open and bind the socket.
    ///
    /// When already initialized the socket is validated first; a stale
    /// socket is closed and the transport is brought up again.
    pub async fn init(&self) -> Result<()> {
        let _serialized = self.shared.init_lock.lock().await;
        self.init_locked()
            .instrument(tracing::info_span!(target: targets::SERVICE, span_names::SERVICE_INIT))
            .await
    }

    async fn init_locked(&self) -> Result<()> {
        if let Some(socket) = self.socket() {
            let needs_bind = self.shared.config.port.is_some();
            if socket.is_live() && (!needs_bind || socket.address().is_some()) {
                tracing::debug!(target: targets::SERVICE, socket_id = %socket.id(), "already initialized");
                return Ok(());
            }
            tracing::warn!(target: targets::SERVICE, socket_id = %socket.id(), "socket failed validation, reinitializing");
            self.drop_binding().await;
        }

        if !self.holds_reference() || !self.shared.udp.is_ready() {
            self.shared.udp.acquire().await?;
            self.shared.inner.lock().reference_epoch = Some(self.shared.udp.shutdown_count());
        }

        match self.open_socket().await {
            Ok(binding) => {
                let local = binding.socket.address();
                {
                    let mut inner = self.shared.inner.lock();
                    inner.binding = Some(binding);
                    inner.state = ServiceState::Ready;
                }
                tracing::info!(target: targets::SERVICE, local = ?local, "service transport ready");
                self.shared.ready.emit(());
                Ok(())
            }
            Err(err) => {
                self.shared.stats.record_error();
                tracing::error!(target: targets::SERVICE, error = %err, "service transport initialization failed");
                self.release_reference().await;
                Err(err)
            }
        }
    }

    async fn open_socket(&self) -> Result<Binding> {
        let config = &self.shared.config;
        let options = SocketOptions::new(config.family)
            .reuse_address(true)
            .broadcast(false);
        let socket = self.shared.udp.create_socket(options).await?;

        let weak: Weak<ServiceShared> = Arc::downgrade(&self.shared);
        let message = socket.message.connect(move |datagram| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_inbound(datagram);
            }
        });
        let weak: Weak<ServiceShared> = Arc::downgrade(&self.shared);
        let error = socket.error.connect(move |err| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_socket_error(err);
            }
        });
        let weak: Weak<ServiceShared> = Arc::downgrade(&self.shared);
        let weak_socket = Arc::downgrade(&socket);
        let closed = socket.closed.connect(move |_| {
            if let (Some(shared), Some(socket)) = (weak.upgrade(), weak_socket.upgrade()) {
                shared.handle_socket_closed(&socket);
            }
        });
        let binding = Binding {
            socket,
            connections: [message, error, closed],
        };

        if let Some(port) = config.port {
            if let Err(err) = binding.socket.bind(port, config.host).await {
                self.discard(binding).await;
                return Err(err);
            }
            if config.enable_broadcast_on_bind {
                match binding.socket.set_broadcast(true).await {
                    Ok(()) => {}
                    Err(err) if err.is_unsupported() => {
                        tracing::warn!(target: targets::SERVICE, error = %err, "broadcast not available, continuing without it");
                    }
                    Err(err) => {
                        self.discard(binding).await;
                        return Err(err);
                    }
                }
            }
        }
        Ok(binding)
    }

    async fn discard(&self, binding: Binding) {
        binding.detach();
        if let Err(err) = binding.socket.close().await {
            tracing::warn!(target: targets::SERVICE, error = %err, "error closing socket");
        }
    }

    async fn drop_binding(&self) {
        let binding = {
            let mut inner = self.shared.inner.lock();
            inner.state = ServiceState::Uninitialized;
            inner.binding.take()
        };
        if let Some(binding) = binding {
            self.discard(binding).await;
        }
    }

    /// Whether our UDP reference survives; a teardown since acquiring voids it.
    fn holds_reference(&self) -> bool {
        self.shared.inner.lock().reference_epoch == Some(self.shared.udp.shutdown_count())
    }

    async fn release_reference(&self) {
        let Some(epoch) = self.shared.inner.lock().reference_epoch.take() else {
            return;
        };
        if epoch == self.shared.udp.shutdown_count() {
            self.shared.udp.release().await;
        } else {
            tracing::debug!(
                target: targets::SERVICE,
                epoch,
                "UDP transport was torn down since acquiring, nothing to release"
            );
        }
    }

    /// Send `data` to `address:port`.
    ///
    /// An uninitialized transport is initialized first. If the socket turns
    /// out to be invalidated, the transport is reinitialized and the send is
    /// retried exactly once.
    pub async fn send(&self, data: impl Into<Bytes>, address: IpAddr, port: u16) -> Result<()> {
        let data = data.into();
        if !self.is_initialized() {
            tracing::debug!(target: targets::SERVICE, "send on uninitialized transport, initializing");
            self.init().await?;
        }

        let socket = self.socket().ok_or(NetworkError::NotInitialized)?;
        match self.send_via(&socket, &data, address, port).await {
            Err(err) if err.is_invalidated() => {
                tracing::warn!(target: targets::SERVICE, error = %err, "socket invalidated, reinitializing once");
                self.shared.stats.record_reinitialization();
                self.discard_stale(&socket).await;
                self.init().await?;
                let socket = self.socket().ok_or(NetworkError::NotInitialized)?;
                self.send_via(&socket, &data, address, port).await
            }
            result => result,
        }
    }

    async fn send_via(
        &self,
        socket: &PacketSocket,
        data: &Bytes,
        address: IpAddr,
        port: u16,
    ) -> Result<()> {
        match socket.send(data.clone(), port, address).await {
            Ok(()) => {
                self.shared.stats.record_sent(data.len());
                Ok(())
            }
            Err(err) => {
                self.shared.stats.record_error();
                Err(err)
            }
        }
    }

    /// Drop the binding only if it still holds `stale`; another task may
    /// already have rebuilt it.
    async fn discard_stale(&self, stale: &Arc<PacketSocket>) {
        let _serialized = self.shared.init_lock.lock().await;
        let binding = {
            let mut inner = self.shared.inner.lock();
            let current = inner
                .binding
                .as_ref()
                .is_some_and(|binding| Arc::ptr_eq(&binding.socket, stale));
            if current {
                inner.state = ServiceState::Uninitialized;
                inner.binding.take()
            } else {
                None
            }
        };
        match binding {
            Some(binding) => self.discard(binding).await,
            None => tracing::debug!(
                target: targets::SERVICE,
                socket_id = %stale.id(),
                "binding already replaced, keeping it"
            ),
        }
    }

    /// Close the socket, drop every handler and release the UDP transport.
    pub async fn close(&self) {
        let _serialized = self.shared.init_lock.lock().await;
        self.drop_binding().await;
        self.clear_services();
        self.release_reference().await;
        tracing::info!(target: targets::SERVICE, "service transport closed");
        self.shared.close.emit(());
    }

    /// The bound local endpoint, if any.
    pub fn get_info(&self) -> Option<LocalInfo> {
        self.socket()?.address().map(|addr| LocalInfo {
            host: addr.ip(),
            port: addr.port(),
        })
    }

    /// A human-readable snapshot for operational visibility.
    pub fn run_diagnostics(&self) -> String {
        let stats = self.stats();
        let socket = self.socket();
        let mut tags: Vec<u8> = self.shared.services.read().keys().copied().collect();
        tags.sort_unstable();

        let mut out = String::new();
        let _ = writeln!(out, "Service transport diagnostics");
        let _ = writeln!(out, "  initialized: {}", self.is_initialized());
        match &socket {
            Some(socket) => {
                let _ = writeln!(
                    out,
                    "  socket: {} ({}, generation {})",
                    socket.id(),
                    socket.state(),
                    socket.generation()
                );
                match socket.address() {
                    Some(addr) => {
                        let _ = writeln!(out, "  local address: {addr}");
                    }
                    None => {
                        let _ = writeln!(out, "  local address: unbound");
                    }
                }
            }
            None => {
                let _ = writeln!(out, "  socket: none");
            }
        }
        let _ = writeln!(out, "  services: {} {:?}", tags.len(), tags);
        let _ = writeln!(
            out,
            "  udp transport: {} ({} references)",
            self.shared.udp.state(),
            self.shared.udp.ref_count()
        );
        let _ = writeln!(
            out,
            "  sent: {} packets, {} bytes",
            stats.packets_sent, stats.bytes_sent
        );
        let _ = writeln!(
            out,
            "  received: {} packets, {} bytes",
            stats.packets_received, stats.bytes_received
        );
        let _ = writeln!(out, "  errors: {}", stats.errors);
        let _ = write!(out, "  reinitializations: {}", stats.reinitializations);
        out
    }
}

impl std::fmt::Debug for ServiceTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTransport")
            .field("state", &self.state())
            .field("services", &self.service_count())
            .field("local", &self.get_info())
            .finish()
    }
}

#[async_trait]
impl Transport for ServiceTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn init(&self) -> Result<()> {
        ServiceTransport::init(self).await
    }

    async fn send(&self, data: Bytes, target: SocketAddr) -> Result<()> {
        ServiceTransport::send(self, data, target.ip(), target.port()).await
    }

    async fn close(&self) -> Result<()> {
        ServiceTransport::close(self).await;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.is_initialized()
    }

    fn forward_events(&self, forwarder: EventForwarder) -> EventForwarding {
        let shared = &self.shared;
        let mut forwarding = EventForwarding::new();

        let fwd = forwarder.clone();
        let id = shared.ready.connect(move |_| fwd(TransportEvent::Ready));
        let weak = Arc::downgrade(shared);
        forwarding.on_detach(move || {
            if let Some(shared) = weak.upgrade() {
                shared.ready.disconnect(id);
            }
        });

        let fwd = forwarder.clone();
        let id = shared.close.connect(move |_| fwd(TransportEvent::Closed));
        let weak = Arc::downgrade(shared);
        forwarding.on_detach(move || {
            if let Some(shared) = weak.upgrade() {
                shared.close.disconnect(id);
            }
        });

        let fwd = forwarder.clone();
        let id = shared
            .error
            .connect(move |err| fwd(TransportEvent::Error(err.clone())));
        let weak = Arc::downgrade(shared);
        forwarding.on_detach(move || {
            if let Some(shared) = weak.upgrade() {
                shared.error.disconnect(id);
            }
        });

        let id = shared
            .message
            .connect(move |message| forwarder(TransportEvent::Message(message.clone())));
        let weak = Arc::downgrade(shared);
        forwarding.on_detach(move || {
            if let Some(shared) = weak.upgrade() {
                shared.message.disconnect(id);
            }
        });

        forwarding
    }
}
