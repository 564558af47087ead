//! A [`NativeBridge`] backed by tokio sockets.
//!
//! Sockets are created unbound through `socket2` so address reuse and
//! broadcast can be applied before the bind, then handed to tokio once bound.
//! Each bound socket runs a receive task that delivers datagrams to the
//! socket's own sink when one is installed, or to the process-wide sink.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::logging::targets;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::bridge::{
    BridgeCapabilities, BridgeError, BridgeErrorKind, BridgeEvent, BridgeLoader, CreatedSocket,
    EventSink, ModuleGeneration, NativeBridge, RawMessage, RawPayload, SocketId,
};
use super::config::{SocketFamily, SocketOptions};

/// Configuration for [`TokioBridge`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokioBridgeConfig {
    /// Receive buffer size per socket; longer datagrams are truncated.
    pub recv_buffer_size: usize,
}

impl Default for TokioBridgeConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 65536,
        }
    }
}

impl TokioBridgeConfig {
    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }
}

enum Handle {
    Pending(Socket),
    Bound {
        socket: Arc<UdpSocket>,
        recv_task: JoinHandle<()>,
    },
}

struct Entry {
    family: SocketFamily,
    handle: Handle,
}

impl Entry {
    fn shutdown(self) {
        if let Handle::Bound { recv_task, .. } = self.handle {
            recv_task.abort();
        }
    }
}

#[derive(Default)]
struct Sinks {
    global: Option<EventSink>,
    per_socket: HashMap<SocketId, EventSink>,
}

fn deliver(sinks: &Mutex<Sinks>, event: BridgeEvent) {
    let sink = {
        let sinks = sinks.lock();
        sinks
            .per_socket
            .get(&event.socket_id())
            .or(sinks.global.as_ref())
            .cloned()
    };
    match sink {
        Some(sink) => sink(event),
        None => tracing::trace!(target: targets::BRIDGE, socket_id = %event.socket_id(), "no sink installed, dropping event"),
    }
}

fn io_error(err: io::Error) -> BridgeError {
    let kind = match err.kind() {
        io::ErrorKind::AddrInUse => BridgeErrorKind::AddressInUse,
        _ => BridgeErrorKind::Other,
    };
    BridgeError::new(kind, err.to_string())
}

/// Native UDP module implemented on tokio.
pub struct TokioBridge {
    generation: ModuleGeneration,
    config: TokioBridgeConfig,
    next_id: Mutex<u64>,
    sockets: Mutex<HashMap<SocketId, Entry>>,
    sinks: Arc<Mutex<Sinks>>,
}

impl Default for TokioBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioBridge {
    /// Create a bridge with default configuration.
    pub fn new() -> Self {
        Self::with_config(TokioBridgeConfig::default())
    }

    /// Create a bridge with the given configuration.
    pub fn with_config(config: TokioBridgeConfig) -> Self {
        Self {
            generation: ModuleGeneration::now(),
            config,
            next_id: Mutex::new(super::bridge::FIRST_SOCKET_ID),
            sockets: Mutex::new(HashMap::new()),
            sinks: Arc::new(Mutex::new(Sinks::default())),
        }
    }

    /// A loader that creates a fresh bridge, and so a fresh generation, on
    /// every transport initialization.
    pub fn loader(config: TokioBridgeConfig) -> BridgeLoader {
        Arc::new(move || Some(Arc::new(TokioBridge::with_config(config.clone())) as Arc<dyn NativeBridge>))
    }

    /// The generation stamped when this bridge was created.
    pub fn generation(&self) -> ModuleGeneration {
        self.generation
    }

    /// Number of open sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    fn with_socket<T>(
        &self,
        socket_id: SocketId,
        op: impl FnOnce(SockRef<'_>, SocketFamily) -> io::Result<T>,
    ) -> Result<T, BridgeError> {
        let sockets = self.sockets.lock();
        let entry = sockets
            .get(&socket_id)
            .ok_or_else(|| BridgeError::socket_not_found(socket_id))?;
        let result = match &entry.handle {
            Handle::Pending(socket) => op(SockRef::from(socket), entry.family),
            Handle::Bound { socket, .. } => op(SockRef::from(socket.as_ref()), entry.family),
        };
        result.map_err(io_error)
    }

    fn bound_socket(&self, socket_id: SocketId) -> Result<Option<Arc<UdpSocket>>, BridgeError> {
        match self.sockets.lock().get(&socket_id) {
            Some(Entry {
                handle: Handle::Bound { socket, .. },
                ..
            }) => Ok(Some(socket.clone())),
            Some(_) => Ok(None),
            None => Err(BridgeError::socket_not_found(socket_id)),
        }
    }

    /// The bound tokio socket, binding to the wildcard address first if needed.
    async fn ready_socket(&self, socket_id: SocketId) -> Result<Arc<UdpSocket>, BridgeError> {
        if let Some(socket) = self.bound_socket(socket_id)? {
            return Ok(socket);
        }
        let family = self
            .sockets
            .lock()
            .get(&socket_id)
            .map(|entry| entry.family)
            .ok_or_else(|| BridgeError::socket_not_found(socket_id))?;
        self.bind(socket_id, SocketAddr::new(family.unspecified(), 0))
            .await?;
        self.bound_socket(socket_id)?
            .ok_or_else(|| BridgeError::other("socket did not bind"))
    }

    async fn send_slice(
        &self,
        socket_id: SocketId,
        data: &[u8],
        target: SocketAddr,
    ) -> Result<(), BridgeError> {
        let socket = self.ready_socket(socket_id).await?;
        let sent = socket.send_to(data, target).await.map_err(io_error)?;
        tracing::trace!(target: targets::BRIDGE, %socket_id, %target, sent, "datagram sent");
        Ok(())
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    socket_id: SocketId,
    sinks: Arc<Mutex<Sinks>>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((n, source)) => {
                let family = match source.ip() {
                    IpAddr::V4(_) => "IPv4",
                    IpAddr::V6(_) => "IPv6",
                };
                deliver(
                    &sinks,
                    BridgeEvent::Message(RawMessage {
                        socket_id,
                        payload: RawPayload::Bytes(Bytes::copy_from_slice(&buffer[..n])),
                        address: source.ip().to_string(),
                        port: source.port(),
                        family: Some(family.to_string()),
                    }),
                );
            }
            Err(e) => {
                let transient = matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::Interrupted
                );
                deliver(
                    &sinks,
                    BridgeEvent::Error {
                        socket_id,
                        message: format!("Receive error: {e}"),
                    },
                );
                if !transient {
                    tracing::warn!(target: targets::BRIDGE, %socket_id, error = %e, "receive loop stopped");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl NativeBridge for TokioBridge {
    fn capabilities(&self) -> BridgeCapabilities {
        BridgeCapabilities::full()
    }

    fn set_event_sink(&self, sink: Option<EventSink>) {
        self.sinks.lock().global = sink;
    }

    fn set_socket_event_sink(&self, socket_id: SocketId, sink: Option<EventSink>) -> bool {
        let mut sinks = self.sinks.lock();
        match sink {
            Some(sink) => {
                sinks.per_socket.insert(socket_id, sink);
            }
            None => {
                sinks.per_socket.remove(&socket_id);
            }
        }
        true
    }

    async fn create_socket(&self, options: &SocketOptions) -> Result<CreatedSocket, BridgeError> {
        let domain = match options.family {
            SocketFamily::V4 => Domain::IPV4,
            SocketFamily::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(io_error)?;
        socket
            .set_reuse_address(options.reuse_address)
            .map_err(io_error)?;
        socket.set_broadcast(options.broadcast).map_err(io_error)?;
        socket.set_nonblocking(true).map_err(io_error)?;

        let socket_id = {
            let mut next = self.next_id.lock();
            let id = SocketId::new(*next);
            *next += 1;
            id
        };
        self.sockets.lock().insert(
            socket_id,
            Entry {
                family: options.family,
                handle: Handle::Pending(socket),
            },
        );
        tracing::debug!(target: targets::BRIDGE, %socket_id, family = %options.family, "native socket created");
        Ok(CreatedSocket {
            socket_id,
            module_generation: self.generation,
        })
    }

    async fn bind(
        &self,
        socket_id: SocketId,
        address: SocketAddr,
    ) -> Result<SocketAddr, BridgeError> {
        let entry = self
            .sockets
            .lock()
            .remove(&socket_id)
            .ok_or_else(|| BridgeError::socket_not_found(socket_id))?;
        let family = entry.family;
        let socket = match entry.handle {
            Handle::Pending(socket) => socket,
            handle @ Handle::Bound { .. } => {
                self.sockets.lock().insert(socket_id, Entry { family, handle });
                return Err(BridgeError::other(format!("socket {socket_id} is already bound")));
            }
        };

        if let Err(e) = socket.bind(&address.into()) {
            self.sockets.lock().insert(
                socket_id,
                Entry {
                    family,
                    handle: Handle::Pending(socket),
                },
            );
            return Err(io_error(e));
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(io_error)?);
        let local_addr = socket.local_addr().map_err(io_error)?;

        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            socket_id,
            self.sinks.clone(),
            self.config.recv_buffer_size,
        ));
        self.sockets.lock().insert(
            socket_id,
            Entry {
                family,
                handle: Handle::Bound { socket, recv_task },
            },
        );
        tracing::debug!(target: targets::BRIDGE, %socket_id, %local_addr, "native socket bound");
        Ok(local_addr)
    }

    async fn send(
        &self,
        socket_id: SocketId,
        buffer: Bytes,
        offset: usize,
        length: usize,
        target: SocketAddr,
    ) -> Result<(), BridgeError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| BridgeError::other("send range exceeds buffer"))?;
        self.send_slice(socket_id, &buffer[offset..end], target)
            .await
    }

    async fn send_encoded(
        &self,
        socket_id: SocketId,
        payload: String,
        target: SocketAddr,
    ) -> Result<(), BridgeError> {
        let data = BASE64
            .decode(payload.as_bytes())
            .map_err(|e| BridgeError::other(format!("invalid base64 payload: {e}")))?;
        self.send_slice(socket_id, &data, target).await
    }

    async fn close(&self, socket_id: SocketId) -> Result<(), BridgeError> {
        let entry = self
            .sockets
            .lock()
            .remove(&socket_id)
            .ok_or_else(|| BridgeError::socket_not_found(socket_id))?;
        self.sinks.lock().per_socket.remove(&socket_id);
        entry.shutdown();
        tracing::debug!(target: targets::BRIDGE, %socket_id, "native socket closed");
        Ok(())
    }

    async fn close_all_sockets(&self) -> Result<(), BridgeError> {
        let entries: Vec<_> = self.sockets.lock().drain().collect();
        self.sinks.lock().per_socket.clear();
        let count = entries.len();
        for (_, entry) in entries {
            entry.shutdown();
        }
        tracing::debug!(target: targets::BRIDGE, count, "closed all native sockets");
        Ok(())
    }

    async fn set_broadcast(&self, socket_id: SocketId, enabled: bool) -> Result<(), BridgeError> {
        self.with_socket(socket_id, |socket, _| socket.set_broadcast(enabled))
    }

    async fn set_ttl(&self, socket_id: SocketId, ttl: u32) -> Result<(), BridgeError> {
        self.with_socket(socket_id, |socket, family| match family {
            SocketFamily::V4 => socket.set_ttl(ttl),
            SocketFamily::V6 => socket.set_unicast_hops_v6(ttl),
        })
    }

    async fn set_multicast_ttl(&self, socket_id: SocketId, ttl: u32) -> Result<(), BridgeError> {
        self.with_socket(socket_id, |socket, family| match family {
            SocketFamily::V4 => socket.set_multicast_ttl_v4(ttl),
            SocketFamily::V6 => socket.set_multicast_hops_v6(ttl),
        })
    }

    async fn set_multicast_loopback(
        &self,
        socket_id: SocketId,
        enabled: bool,
    ) -> Result<(), BridgeError> {
        self.with_socket(socket_id, |socket, family| match family {
            SocketFamily::V4 => socket.set_multicast_loop_v4(enabled),
            SocketFamily::V6 => socket.set_multicast_loop_v6(enabled),
        })
    }

    async fn add_membership(
        &self,
        socket_id: SocketId,
        group: IpAddr,
        interface: Option<IpAddr>,
    ) -> Result<(), BridgeError> {
        self.with_socket(socket_id, |socket, _| match group {
            IpAddr::V4(group) => socket.join_multicast_v4(&group, &ipv4_interface(interface)),
            IpAddr::V6(group) => socket.join_multicast_v6(&group, 0),
        })
    }

    async fn drop_membership(
        &self,
        socket_id: SocketId,
        group: IpAddr,
        interface: Option<IpAddr>,
    ) -> Result<(), BridgeError> {
        self.with_socket(socket_id, |socket, _| match group {
            IpAddr::V4(group) => socket.leave_multicast_v4(&group, &ipv4_interface(interface)),
            IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0),
        })
    }
}

fn ipv4_interface(interface: Option<IpAddr>) -> Ipv4Addr {
    match interface {
        Some(IpAddr::V4(addr)) => addr,
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

impl Drop for TokioBridge {
    fn drop(&mut self) {
        for (_, entry) in self.sockets.get_mut().drain() {
            entry.shutdown();
        }
    }
}

impl std::fmt::Debug for TokioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioBridge")
            .field("generation", &self.generation)
            .field("sockets", &self.socket_count())
            .field("config", &self.config)
            .finish()
    }
}
