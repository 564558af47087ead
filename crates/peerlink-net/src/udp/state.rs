//! State enumerations for packet sockets and the UDP transport.

/// State of a packet socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PacketSocketState {
    /// Socket is created but not bound.
    #[default]
    Unbound,
    /// Socket is bound and delivering events.
    Bound,
    /// Socket was closed locally or by the native layer.
    Closed,
    /// Socket belongs to a previous native module generation.
    Invalidated,
}

impl PacketSocketState {
    /// Whether the socket can still be used.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Unbound | Self::Bound)
    }
}

impl std::fmt::Display for PacketSocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketSocketState::Unbound => write!(f, "Unbound"),
            PacketSocketState::Bound => write!(f, "Bound"),
            PacketSocketState::Closed => write!(f, "Closed"),
            PacketSocketState::Invalidated => write!(f, "Invalidated"),
        }
    }
}

/// Lifecycle state of the shared UDP transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransportState {
    /// No native resources are held.
    #[default]
    Uninitialized,
    /// The native module is being brought up.
    Initializing,
    /// Sockets may be created and used.
    Ready,
    /// All sockets are being closed.
    ShuttingDown,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Uninitialized => write!(f, "Uninitialized"),
            TransportState::Initializing => write!(f, "Initializing"),
            TransportState::Ready => write!(f, "Ready"),
            TransportState::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}
