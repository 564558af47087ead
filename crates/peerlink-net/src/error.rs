//! Error types for the networking module.

use crate::udp::SocketId;

/// Network-specific errors.
///
/// Errors are `Clone` so they can be delivered through `error` signals as
/// well as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// A socket option is not backed by the current native module.
    #[error("{operation} is unsupported on this platform")]
    Unsupported {
        /// The bridge operation that is missing.
        operation: &'static str,
    },

    /// The native layer rejected a bind request.
    #[error("bind failed on socket {socket_id} [{code}]: {message}")]
    Bind {
        /// The socket that failed to bind.
        socket_id: SocketId,
        /// Wrapper error code.
        code: &'static str,
        /// The native error message, verbatim.
        message: String,
    },

    /// The socket was already bound; re-create it instead of rebinding.
    #[error("socket {socket_id} is already bound")]
    AlreadyBound {
        /// The socket that was already bound.
        socket_id: SocketId,
    },

    /// The socket handle is no longer recognized (native module reset or
    /// closed elsewhere).
    #[error("socket {socket_id} was invalidated during {operation}")]
    SocketInvalidated {
        /// The stale socket id.
        socket_id: SocketId,
        /// The operation that observed the invalidation.
        operation: &'static str,
    },

    /// The socket has been closed locally.
    #[error("socket {socket_id} is closed")]
    SocketClosed {
        /// The closed socket id.
        socket_id: SocketId,
    },

    /// A send was attempted while another send on the same socket was in progress.
    #[error("recursive send on socket {socket_id}: a send is already in progress")]
    ReentrantSend {
        /// The socket that is mid-send.
        socket_id: SocketId,
    },

    /// No native UDP module is available, or it lacks required entry points.
    #[error("native UDP module unavailable: {0}")]
    NativeModuleMissing(String),

    /// Any other native failure, wrapped with context.
    #[error("native {operation} failed on socket {socket_id}: {message}")]
    Native {
        /// The socket the operation targeted.
        socket_id: SocketId,
        /// The bridge operation.
        operation: &'static str,
        /// The native error message.
        message: String,
    },

    /// The native layer failed to create a socket.
    #[error("socket creation failed: {0}")]
    CreateSocket(String),

    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transport is not initialized.
    #[error("transport is not initialized")]
    NotInitialized,

    /// A service registration or envelope problem.
    #[error("invalid service payload: {0}")]
    InvalidService(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A transport manager routing error.
    #[error("{kind} transport error: {message}")]
    Transport {
        /// The transport kind.
        kind: String,
        /// Description of the failure.
        message: String,
    },
}

impl NetworkError {
    /// Whether this error means the socket handle went stale.
    ///
    /// The service transport uses this to decide on its single
    /// reinitialize-and-retry attempt.
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::SocketInvalidated { .. })
    }

    /// Whether this error reports a missing native primitive.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Create a transport manager error.
    pub fn transport(kind: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Transport {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for NetworkError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
