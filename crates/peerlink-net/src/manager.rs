//! Transport registration and event fan-in.
//!
//! The [`TransportManager`] holds one transport per [`TransportKind`] (the
//! UDP service transport, a comm-server relay, ...), brings them up
//! together and forwards their events on a single signal. A transport that
//! fails to initialize is reported and skipped; the others keep running.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use peerlink_core::Signal;
use peerlink_core::logging::targets;

use crate::Result;
use crate::error::NetworkError;
use crate::service::InboundMessage;

/// Kind of a registered transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// The UDP service transport.
    Udp,
    /// A relay through the comm server.
    CommServer,
    /// Any other transport.
    Other(String),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::CommServer => write!(f, "comm-server"),
            TransportKind::Other(name) => write!(f, "{name}"),
        }
    }
}

/// An event forwarded from a transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The transport became ready.
    Ready,
    /// The transport closed.
    Closed,
    /// The transport reported an error.
    Error(NetworkError),
    /// A datagram arrived.
    Message(InboundMessage),
}

/// Callback receiving a transport's events.
pub type EventForwarder = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Keeps a transport's events forwarded; dropping it stops forwarding.
#[derive(Default)]
pub struct EventForwarding {
    detach: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl EventForwarding {
    /// An empty forwarding with nothing to detach.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `detach` when forwarding stops.
    pub fn on_detach(&mut self, detach: impl FnOnce() + Send + 'static) {
        self.detach.get_mut().push(Box::new(detach));
    }

    /// Stop forwarding now.
    pub fn detach(&self) {
        let detach: Vec<_> = self.detach.lock().drain(..).collect();
        for f in detach {
            f();
        }
    }
}

impl Drop for EventForwarding {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for EventForwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventForwarding")
            .field("connections", &self.detach.lock().len())
            .finish()
    }
}

/// A transport the manager can drive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of transport this is.
    fn kind(&self) -> TransportKind;

    /// Bring the transport up.
    async fn init(&self) -> Result<()>;

    /// Send a datagram.
    async fn send(&self, data: Bytes, target: SocketAddr) -> Result<()>;

    /// Shut the transport down.
    async fn close(&self) -> Result<()>;

    /// Whether the transport can send right now.
    fn is_ready(&self) -> bool;

    /// Forward this transport's events to `forwarder` until the returned
    /// handle is dropped.
    fn forward_events(&self, forwarder: EventForwarder) -> EventForwarding;
}

struct Registered {
    transport: Arc<dyn Transport>,
    _forwarding: EventForwarding,
}

/// Owns the application's transports.
///
/// # Signals
///
/// - [`events`](Self::events): Every event of every registered transport,
///   tagged with its kind
pub struct TransportManager {
    transports: RwLock<HashMap<TransportKind, Registered>>,

    /// Signal emitted for every forwarded transport event.
    pub events: Arc<Signal<(TransportKind, TransportEvent)>>,
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportManager {
    /// Create a manager with no transports.
    pub fn new() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            events: Arc::new(Signal::new()),
        }
    }

    /// Register `transport`, replacing any transport of the same kind.
    ///
    /// The replaced transport stops forwarding events and is returned.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let kind = transport.kind();
        let events = Arc::downgrade(&self.events);
        let forward_kind = kind.clone();
        let forwarding = transport.forward_events(Arc::new(move |event| {
            if let Some(events) = events.upgrade() {
                events.emit((forward_kind.clone(), event));
            }
        }));

        let previous = self.transports.write().insert(
            kind.clone(),
            Registered {
                transport,
                _forwarding: forwarding,
            },
        );
        tracing::debug!(target: targets::MANAGER, %kind, replaced = previous.is_some(), "transport registered");
        previous.map(|registered| registered.transport)
    }

    /// Remove the transport of `kind`; it stops forwarding events.
    pub fn unregister(&self, kind: &TransportKind) -> Option<Arc<dyn Transport>> {
        let removed = self.transports.write().remove(kind);
        if removed.is_some() {
            tracing::debug!(target: targets::MANAGER, %kind, "transport unregistered");
        }
        removed.map(|registered| registered.transport)
    }

    /// The transport of `kind`.
    pub fn get(&self, kind: &TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports
            .read()
            .get(kind)
            .map(|registered| registered.transport.clone())
    }

    /// Kinds of all registered transports.
    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<_> = self.transports.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Kinds of the transports that are ready.
    pub fn ready_kinds(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<_> = self
            .transports
            .read()
            .iter()
            .filter(|(_, registered)| registered.transport.is_ready())
            .map(|(kind, _)| kind.clone())
            .collect();
        kinds.sort();
        kinds
    }

    fn snapshot(&self) -> Vec<(TransportKind, Arc<dyn Transport>)> {
        let mut transports: Vec<_> = self
            .transports
            .read()
            .iter()
            .map(|(kind, registered)| (kind.clone(), registered.transport.clone()))
            .collect();
        transports.sort_by(|a, b| a.0.cmp(&b.0));
        transports
    }

    /// Initialize every registered transport.
    ///
    /// Failures are logged, emitted on [`events`](Self::events) and
    /// returned; they do not stop the remaining transports.
    pub async fn init_all(&self) -> Vec<(TransportKind, NetworkError)> {
        let mut failures = Vec::new();
        for (kind, transport) in self.snapshot() {
            match transport.init().await {
                Ok(()) => tracing::info!(target: targets::MANAGER, %kind, "transport initialized"),
                Err(err) => {
                    tracing::warn!(target: targets::MANAGER, %kind, error = %err, "transport failed to initialize, continuing without it");
                    self.events
                        .emit((kind.clone(), TransportEvent::Error(err.clone())));
                    failures.push((kind, err));
                }
            }
        }
        failures
    }

    /// Send through the transport of `kind`.
    pub async fn send(
        &self,
        kind: &TransportKind,
        data: impl Into<Bytes>,
        target: SocketAddr,
    ) -> Result<()> {
        let transport = self
            .get(kind)
            .ok_or_else(|| NetworkError::transport(kind, "no transport registered"))?;
        transport.send(data.into(), target).await
    }

    /// Close every registered transport, continuing past failures.
    pub async fn close_all(&self) -> Vec<(TransportKind, NetworkError)> {
        let mut failures = Vec::new();
        for (kind, transport) in self.snapshot() {
            if let Err(err) = transport.close().await {
                tracing::warn!(target: targets::MANAGER, %kind, error = %err, "error closing transport");
                failures.push((kind, err));
            }
        }
        failures
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager")
            .field("kinds", &self.kinds())
            .finish()
    }
}
