//! UDP transport for peerlink.
//!
//! This crate carries peerlink's peer-to-peer traffic over UDP:
//!
//! - **Native bridge**: The [`udp::NativeBridge`] contract a platform UDP
//!   module implements, plus a tokio-backed implementation
//! - **UDP transport**: A reference-counted owner of the bridge that creates
//!   [`udp::PacketSocket`]s and detects native module reloads
//! - **Service transport**: One socket shared by several sub-protocols,
//!   routed by a leading service tag
//! - **Transport manager**: Registration and event fan-in for every
//!   transport the application runs
//!
//! # Service Transport
//!
//! ```ignore
//! use std::sync::Arc;
//! use peerlink_net::service::{ServiceTransport, ServiceTransportConfig, ServiceType, DEFAULT_SERVICE_PORT};
//! use peerlink_net::udp::{TokioBridge, TokioBridgeConfig, UdpTransport};
//!
//! let udp = UdpTransport::new(TokioBridge::loader(TokioBridgeConfig::default()));
//! let service = ServiceTransport::new(udp, ServiceTransportConfig::new().port(DEFAULT_SERVICE_PORT));
//!
//! service.add_service(ServiceType::Heartbeat, |packet, remote| {
//!     println!("heartbeat from {}", remote.socket_addr());
//! });
//!
//! service.init().await?;
//! service.send(&[8u8][..], "255.255.255.255".parse()?, DEFAULT_SERVICE_PORT).await?;
//! ```
//!
//! # Transport Manager
//!
//! ```ignore
//! use peerlink_net::{TransportKind, TransportManager};
//!
//! let manager = TransportManager::new();
//! manager.register(Arc::new(service));
//!
//! manager.events.connect(|(kind, event)| {
//!     println!("{kind}: {event:?}");
//! });
//!
//! // Transports that fail to start are reported and skipped.
//! for (kind, err) in manager.init_all().await {
//!     eprintln!("{kind} unavailable: {err}");
//! }
//! ```
//!
//! # Signal-Based Events
//!
//! Sockets and transports report events through
//! [`peerlink_core::Signal`]s. Slots run synchronously on the task that
//! delivers the native event.

mod error;
pub mod manager;
pub mod service;
pub mod udp;

pub use error::{NetworkError, Result};

// Re-export commonly used types at the crate root
pub use manager::{
    EventForwarder, EventForwarding, Transport, TransportEvent, TransportKind, TransportManager,
};
pub use service::{
    DEFAULT_SERVICE_PORT, InboundMessage, LocalInfo, RemoteInfo, ServicePacket, ServiceTransport,
    ServiceTransportConfig, ServiceType, TransportStats,
};
pub use udp::{
    BridgeCapabilities, Datagram, NativeBridge, PacketSocket, SocketFamily, SocketId,
    SocketOptions, UdpTransport,
};
