//! UDP sockets over a native bridge.
//!
//! This module provides the datagram layer:
//! - **NativeBridge**: The contract a platform UDP module implements
//! - **UdpTransport**: Shared, reference-counted owner of the bridge
//! - **PacketSocket**: One socket with signal-based event delivery
//! - **SocketRegistry**: Id-to-socket routing and module reload detection
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use peerlink_net::udp::{SocketOptions, TokioBridge, UdpTransport};
//!
//! let transport = UdpTransport::with_bridge(Arc::new(TokioBridge::new()));
//! transport.acquire().await?;
//!
//! let socket = transport.create_socket(SocketOptions::default()).await?;
//!
//! // Connect to events
//! socket.message.connect(|datagram| {
//!     println!("Received {} bytes from {}", datagram.data.len(), datagram.source);
//! });
//!
//! // Bind and send data
//! socket.bind(0, None).await?;
//! socket.send(&b"Hello!"[..], 9000, "127.0.0.1".parse()?).await?;
//! ```
//!
//! # Broadcast Example
//!
//! ```ignore
//! let socket = transport
//!     .create_socket(SocketOptions::default().reuse_address(true))
//!     .await?;
//! socket.bind(49497, None).await?;
//! socket.set_broadcast(true).await?;
//!
//! socket.send(&b"Discovery"[..], 49497, "255.255.255.255".parse()?).await?;
//! ```

mod bridge;
mod config;
mod registry;
mod socket;
mod state;
#[cfg(feature = "tokio-bridge")]
mod tokio_bridge;
mod transport;

pub use bridge::{
    BridgeCapabilities, BridgeError, BridgeErrorKind, BridgeEvent, BridgeLoader, CreatedSocket,
    EventSink, FIRST_SOCKET_ID, ModuleGeneration, NativeBridge, RawMessage, RawPayload, SocketId,
    static_loader,
};
pub use config::{Datagram, SocketFamily, SocketOptions};
pub use registry::{GENERATION_TOLERANCE, GenerationCheck, SocketRegistry};
pub use socket::{EventPath, PacketSocket};
pub use state::{PacketSocketState, TransportState};
#[cfg(feature = "tokio-bridge")]
pub use tokio_bridge::{TokioBridge, TokioBridgeConfig};
pub use transport::UdpTransport;
