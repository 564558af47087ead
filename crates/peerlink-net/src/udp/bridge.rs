//! The native UDP bridge contract.
//!
//! The platform module that owns the real sockets is reached through the
//! [`NativeBridge`] trait. What the module can actually do is captured once,
//! at transport initialization, as a [`BridgeCapabilities`] descriptor; every
//! socket operation consults the descriptor instead of probing the bridge.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use super::config::SocketOptions;
use crate::error::NetworkError;

/// The id the native layer assigns to the first socket of a module generation.
pub const FIRST_SOCKET_ID: u64 = 1;

/// Identifier of one native socket.
///
/// Ids are monotonic within one [`ModuleGeneration`] only; after the native
/// module is reloaded the same numbers are handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Wrap a raw native id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw native id.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the first id a freshly loaded module hands out.
    pub const fn is_first(self) -> bool {
        self.0 == FIRST_SOCKET_ID
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker distinguishing successive loads of the native module.
///
/// Native modules report the millisecond timestamp at which they were loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleGeneration(u64);

impl ModuleGeneration {
    /// Wrap a raw generation value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// A generation stamped with the current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }

    /// The raw generation value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Absolute distance between two generations.
    pub fn distance(self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for ModuleGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response of a successful native `createSocket`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedSocket {
    /// The id assigned by the native layer.
    pub socket_id: SocketId,
    /// The generation of the module that created the socket.
    pub module_generation: ModuleGeneration,
}

/// Classification of native failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// The native layer does not know the socket id.
    SocketNotFound,
    /// The requested address/port is taken.
    AddressInUse,
    /// The primitive is not exposed by this module.
    Unsupported,
    /// Anything else.
    Other,
}

/// An error reported by the native layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BridgeError {
    /// What kind of failure this is.
    pub kind: BridgeErrorKind,
    /// The native message.
    pub message: String,
}

impl BridgeError {
    /// Create an error of the given kind.
    pub fn new(kind: BridgeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The native layer does not know `socket_id`.
    pub fn socket_not_found(socket_id: SocketId) -> Self {
        Self::new(
            BridgeErrorKind::SocketNotFound,
            format!("Socket {socket_id} not found"),
        )
    }

    /// The primitive `operation` is not available.
    pub fn unsupported(operation: &str) -> Self {
        Self::new(
            BridgeErrorKind::Unsupported,
            format!("{operation} is not implemented by the native module"),
        )
    }

    /// A generic native failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::Other, message)
    }

    /// Wrap this native error with the socket and operation it occurred on.
    pub fn into_network_error(self, socket_id: SocketId, operation: &'static str) -> NetworkError {
        match self.kind {
            BridgeErrorKind::SocketNotFound => NetworkError::SocketInvalidated {
                socket_id,
                operation,
            },
            BridgeErrorKind::Unsupported => NetworkError::Unsupported { operation },
            BridgeErrorKind::AddressInUse | BridgeErrorKind::Other => NetworkError::Native {
                socket_id,
                operation,
                message: self.message,
            },
        }
    }
}

/// Payload encoding of an inbound message as delivered by the native layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawPayload {
    /// Bytes handed over without copying.
    Bytes(Bytes),
    /// Base64 text, used by the process-wide channel on some platforms.
    Base64(String),
}

/// An inbound message as delivered by the native layer, before normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    /// The receiving socket.
    pub socket_id: SocketId,
    /// The datagram payload.
    pub payload: RawPayload,
    /// Sender address in textual form.
    pub address: String,
    /// Sender port.
    pub port: u16,
    /// Sender family (`"IPv4"` / `"IPv6"`), when reported.
    pub family: Option<String>,
}

/// An event emitted by the native layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A datagram arrived.
    Message(RawMessage),
    /// A socket reported an error.
    Error {
        /// The failing socket.
        socket_id: SocketId,
        /// The native message.
        message: String,
    },
    /// A socket was closed by the native layer.
    Close {
        /// The closed socket.
        socket_id: SocketId,
    },
}

impl BridgeEvent {
    /// The socket the event belongs to.
    pub fn socket_id(&self) -> SocketId {
        match self {
            Self::Message(message) => message.socket_id,
            Self::Error { socket_id, .. } | Self::Close { socket_id } => *socket_id,
        }
    }
}

/// Callback receiving native events.
pub type EventSink = Arc<dyn Fn(BridgeEvent) + Send + Sync>;

/// Which native entry points a bridge exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeCapabilities {
    /// `createSocket`.
    pub create_socket: bool,
    /// `bind`.
    pub bind: bool,
    /// Zero-copy `send(buffer, offset, length)`.
    pub send_zero_copy: bool,
    /// Base64 encoded send fallback.
    pub send_encoded: bool,
    /// `close`.
    pub close: bool,
    /// `closeAllSockets`.
    pub close_all: bool,
    /// `setBroadcast`.
    pub set_broadcast: bool,
    /// `setTTL`.
    pub set_ttl: bool,
    /// `setMulticastTTL`.
    pub set_multicast_ttl: bool,
    /// `setMulticastLoopback`.
    pub set_multicast_loopback: bool,
    /// `addMembership`.
    pub add_membership: bool,
    /// `dropMembership`.
    pub drop_membership: bool,
    /// Per-socket event delivery; otherwise only the process-wide channel.
    pub per_socket_events: bool,
}

impl BridgeCapabilities {
    /// A bridge exposing every entry point.
    pub const fn full() -> Self {
        Self {
            create_socket: true,
            bind: true,
            send_zero_copy: true,
            send_encoded: true,
            close: true,
            close_all: true,
            set_broadcast: true,
            set_ttl: true,
            set_multicast_ttl: true,
            set_multicast_loopback: true,
            add_membership: true,
            drop_membership: true,
            per_socket_events: true,
        }
    }

    /// A bridge exposing only the required entry points.
    pub const fn minimal() -> Self {
        Self {
            create_socket: true,
            bind: true,
            send_zero_copy: true,
            send_encoded: false,
            close: true,
            close_all: false,
            set_broadcast: false,
            set_ttl: false,
            set_multicast_ttl: false,
            set_multicast_loopback: false,
            add_membership: false,
            drop_membership: false,
            per_socket_events: false,
        }
    }

    /// Whether any send primitive exists.
    pub fn can_send(&self) -> bool {
        self.send_zero_copy || self.send_encoded
    }

    /// Names of required entry points the bridge lacks.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.create_socket {
            missing.push("createSocket");
        }
        if !self.bind {
            missing.push("bind");
        }
        if !self.can_send() {
            missing.push("send");
        }
        if !self.close {
            missing.push("close");
        }
        missing
    }

    /// Check that every required entry point is present.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let missing = self.missing_required();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::NativeModuleMissing(format!(
                "missing required entry points: {}",
                missing.join(", ")
            )))
        }
    }
}

impl Default for BridgeCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

/// The native UDP module.
///
/// Optional primitives have default bodies reporting
/// [`BridgeErrorKind::Unsupported`]; a bridge that implements one must also
/// advertise it in [`capabilities`](Self::capabilities).
///
/// Events for a socket that has a per-socket sink are delivered only to that
/// sink; all other events go to the process-wide sink.
#[async_trait]
pub trait NativeBridge: Send + Sync {
    /// The entry points this module exposes.
    fn capabilities(&self) -> BridgeCapabilities;

    /// One-time module bring-up.
    async fn initialize(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Install or remove the process-wide event sink.
    fn set_event_sink(&self, sink: Option<EventSink>);

    /// Install or remove a per-socket event sink.
    ///
    /// Returns `false` when per-socket delivery is not available.
    fn set_socket_event_sink(&self, _socket_id: SocketId, _sink: Option<EventSink>) -> bool {
        false
    }

    /// Create a socket.
    async fn create_socket(&self, options: &SocketOptions) -> Result<CreatedSocket, BridgeError>;

    /// Bind a socket, returning the bound address.
    async fn bind(&self, socket_id: SocketId, address: SocketAddr)
    -> Result<SocketAddr, BridgeError>;

    /// Zero-copy send of `buffer[offset..offset + length]`.
    async fn send(
        &self,
        _socket_id: SocketId,
        _buffer: Bytes,
        _offset: usize,
        _length: usize,
        _target: SocketAddr,
    ) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("send"))
    }

    /// Send a base64 encoded payload.
    async fn send_encoded(
        &self,
        _socket_id: SocketId,
        _payload: String,
        _target: SocketAddr,
    ) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("sendEncoded"))
    }

    /// Close a socket.
    async fn close(&self, socket_id: SocketId) -> Result<(), BridgeError>;

    /// Close every socket the module owns.
    async fn close_all_sockets(&self) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("closeAllSockets"))
    }

    /// Enable or disable broadcast.
    async fn set_broadcast(&self, _socket_id: SocketId, _enabled: bool) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("setBroadcast"))
    }

    /// Set the unicast TTL.
    async fn set_ttl(&self, _socket_id: SocketId, _ttl: u32) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("setTTL"))
    }

    /// Set the multicast TTL.
    async fn set_multicast_ttl(&self, _socket_id: SocketId, _ttl: u32) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("setMulticastTTL"))
    }

    /// Enable or disable multicast loopback.
    async fn set_multicast_loopback(
        &self,
        _socket_id: SocketId,
        _enabled: bool,
    ) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("setMulticastLoopback"))
    }

    /// Join a multicast group.
    async fn add_membership(
        &self,
        _socket_id: SocketId,
        _group: IpAddr,
        _interface: Option<IpAddr>,
    ) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("addMembership"))
    }

    /// Leave a multicast group.
    async fn drop_membership(
        &self,
        _socket_id: SocketId,
        _group: IpAddr,
        _interface: Option<IpAddr>,
    ) -> Result<(), BridgeError> {
        Err(BridgeError::unsupported("dropMembership"))
    }
}

/// Obtains the native module handle; `None` means no module is available.
pub type BridgeLoader = Arc<dyn Fn() -> Option<Arc<dyn NativeBridge>> + Send + Sync>;

/// A loader that always yields `bridge`.
pub fn static_loader(bridge: Arc<dyn NativeBridge>) -> BridgeLoader {
    Arc::new(move || Some(bridge.clone()))
}
