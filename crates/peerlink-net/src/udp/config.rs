//! Configuration types for packet sockets.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Address family of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketFamily {
    /// `udp4`.
    #[default]
    V4,
    /// `udp6`.
    V6,
}

impl SocketFamily {
    /// The family of an address.
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// The wildcard address of this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Parse the family names native layers report (`"IPv4"`, `"udp6"`, ...).
    pub fn from_native(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ipv4" | "udp4" | "v4" | "4" => Some(Self::V4),
            "ipv6" | "udp6" | "v6" | "6" => Some(Self::V6),
            _ => None,
        }
    }
}

impl fmt::Display for SocketFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketFamily::V4 => write!(f, "udp4"),
            SocketFamily::V6 => write!(f, "udp6"),
        }
    }
}

/// Options passed to the native `createSocket`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Address family.
    pub family: SocketFamily,
    /// Allow several sockets in this process to bind the same address/port.
    pub reuse_address: bool,
    /// Enable broadcast at creation.
    pub broadcast: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            family: SocketFamily::V4,
            reuse_address: false,
            broadcast: false,
        }
    }
}

impl SocketOptions {
    /// Options for a socket of the given family.
    pub fn new(family: SocketFamily) -> Self {
        Self {
            family,
            ..Default::default()
        }
    }

    /// Enable or disable address reuse.
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    /// Enable or disable broadcast at creation.
    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }
}

/// A received datagram, normalized regardless of the native delivery path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// The datagram payload.
    pub data: Bytes,
    /// The source address of the datagram.
    pub source: SocketAddr,
    /// The source address family.
    pub family: SocketFamily,
}

impl Datagram {
    /// Create a new datagram; the family is taken from `source`.
    pub fn new(data: impl Into<Bytes>, source: SocketAddr) -> Self {
        Self {
            data: data.into(),
            family: SocketFamily::of(&source.ip()),
            source,
        }
    }
}
