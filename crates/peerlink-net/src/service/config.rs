//! Configuration and well-known tags for the service transport.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::NetworkError;
use crate::udp::SocketFamily;

/// The unified port every peer listens on for service traffic.
pub const DEFAULT_SERVICE_PORT: u16 = 49497;

/// Service tags spoken on the unified service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServiceType {
    /// Peer discovery announcements.
    Discovery = 1,
    /// Credential provisioning.
    Credentials = 2,
    /// Device LED control.
    LedControl = 3,
    /// Device data exchange.
    DeviceData = 4,
    /// Journal synchronization.
    JournalSync = 5,
    /// Device attestation.
    Attestation = 6,
    /// Verifiable credential exchange.
    VcExchange = 7,
    /// Liveness heartbeat.
    Heartbeat = 8,
}

impl ServiceType {
    /// All well-known tags, in tag order.
    pub const ALL: [ServiceType; 8] = [
        ServiceType::Discovery,
        ServiceType::Credentials,
        ServiceType::LedControl,
        ServiceType::DeviceData,
        ServiceType::JournalSync,
        ServiceType::Attestation,
        ServiceType::VcExchange,
        ServiceType::Heartbeat,
    ];

    /// The wire tag.
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl From<ServiceType> for u8 {
    fn from(service: ServiceType) -> Self {
        service.tag()
    }
}

impl TryFrom<u8> for ServiceType {
    type Error = NetworkError;

    fn try_from(tag: u8) -> Result<Self> {
        ServiceType::ALL
            .into_iter()
            .find(|service| service.tag() == tag)
            .ok_or_else(|| NetworkError::InvalidService(format!("unknown service tag {tag}")))
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceType::Discovery => "discovery",
            ServiceType::Credentials => "credentials",
            ServiceType::LedControl => "led-control",
            ServiceType::DeviceData => "device-data",
            ServiceType::JournalSync => "journal-sync",
            ServiceType::Attestation => "attestation",
            ServiceType::VcExchange => "vc-exchange",
            ServiceType::Heartbeat => "heartbeat",
        };
        write!(f, "{name}")
    }
}

/// How framed protocol packets are told apart from service-tagged payloads.
///
/// A payload is framed when its first byte has any bit of `header_mask` set
/// and it is strictly longer than `min_len` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingPolicy {
    /// Bits of the first byte that mark a long-header packet.
    pub header_mask: u8,
    /// Payloads of this length or shorter are never framed.
    pub min_len: usize,
}

impl Default for FramingPolicy {
    fn default() -> Self {
        Self {
            header_mask: 0x80,
            min_len: 20,
        }
    }
}

impl FramingPolicy {
    /// Whether `data` is a framed protocol packet.
    pub fn is_framed(&self, data: &[u8]) -> bool {
        data.len() > self.min_len && data.first().is_some_and(|b| b & self.header_mask != 0)
    }
}

/// Configuration for a [`ServiceTransport`](super::ServiceTransport).
///
/// # Example
///
/// ```
/// use peerlink_net::service::{ServiceTransportConfig, DEFAULT_SERVICE_PORT};
///
/// let config = ServiceTransportConfig::new().port(DEFAULT_SERVICE_PORT);
/// assert_eq!(config.port, Some(49497));
///
/// let config = ServiceTransportConfig::from_toml_str("port = 5000\nenable_broadcast_on_bind = false").unwrap();
/// assert_eq!(config.port, Some(5000));
/// assert!(!config.enable_broadcast_on_bind);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTransportConfig {
    /// Port to bind; `None` leaves the socket unbound until first send.
    pub port: Option<u16>,
    /// Address to bind; `None` binds the wildcard address.
    pub host: Option<IpAddr>,
    /// Socket family.
    pub family: SocketFamily,
    /// Enable broadcast right after binding.
    pub enable_broadcast_on_bind: bool,
    /// Framed packet detection.
    pub framing: FramingPolicy,
}

impl Default for ServiceTransportConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: None,
            family: SocketFamily::V4,
            enable_broadcast_on_bind: true,
            framing: FramingPolicy::default(),
        }
    }
}

impl ServiceTransportConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Set the port to bind.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the address to bind.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the socket family.
    pub fn family(mut self, family: SocketFamily) -> Self {
        self.family = family;
        self
    }

    /// Enable or disable broadcast after binding.
    pub fn enable_broadcast_on_bind(mut self, enabled: bool) -> Self {
        self.enable_broadcast_on_bind = enabled;
        self
    }

    /// Set the framing policy.
    pub fn framing(mut self, framing: FramingPolicy) -> Self {
        self.framing = framing;
        self
    }
}
