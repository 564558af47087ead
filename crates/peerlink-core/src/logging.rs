//! Logging facilities for peerlink.
//!
//! peerlink uses the `tracing` crate for instrumentation. Library code never
//! installs a subscriber; applications choose one:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt::init();
//!     // ...
//! }
//! ```
//!
//! Every subsystem logs under one of the [`targets`], so a directive such as
//! `peerlink_net::registry=debug` isolates socket-handle bookkeeping.

/// Span names used throughout peerlink for tracing.
pub mod span_names {
    /// Native bridge initialization.
    pub const BRIDGE_INIT: &str = "peerlink::bridge_init";
    /// Transport teardown.
    pub const SHUTDOWN: &str = "peerlink::shutdown";
    /// Service transport (re)initialization.
    pub const SERVICE_INIT: &str = "peerlink::service_init";
    /// Inbound datagram demultiplexing.
    pub const DEMUX: &str = "peerlink::demux";
}

/// Target names for log filtering.
pub mod targets {
    /// Core target.
    pub const CORE: &str = "peerlink_core";
    /// Signal/slot system target.
    pub const SIGNAL: &str = "peerlink_core::signal";
    /// UDP transport lifecycle and packet sockets.
    pub const UDP: &str = "peerlink_net::udp";
    /// Socket handle registry and module generation tracking.
    pub const REGISTRY: &str = "peerlink_net::registry";
    /// Native bridge implementations.
    pub const BRIDGE: &str = "peerlink_net::bridge";
    /// Service-multiplexing transport.
    pub const SERVICE: &str = "peerlink_net::service";
    /// Transport manager.
    pub const MANAGER: &str = "peerlink_net::manager";
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Useful for timing lifecycle operations such as initialization and teardown.
#[derive(Debug)]
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Create and enter a new performance span.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "peerlink::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}
