//! Socket registry keyed by native socket id.
//!
//! The registry is the only place that maps a [`SocketId`] to the live
//! [`PacketSocket`] wrapper. Native events arriving on the process-wide
//! channel are routed through it, and it is where a reload of the native
//! module is detected and the stale wrappers are invalidated.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use peerlink_core::PerfSpan;
use peerlink_core::logging::targets;

use super::bridge::{ModuleGeneration, SocketId};
use super::socket::PacketSocket;

/// Generations closer than this (in milliseconds) are treated as the same load.
pub const GENERATION_TOLERANCE: u64 = 1;

/// Outcome of [`SocketRegistry::record_generation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationCheck {
    /// No generation was known before; this one becomes the baseline.
    Baseline,
    /// The generation matches the recorded one.
    Unchanged,
    /// The native module was reloaded and every tracked socket was invalidated.
    Reset {
        /// The generation that was replaced.
        previous: ModuleGeneration,
        /// The new generation.
        current: ModuleGeneration,
        /// How many wrappers were invalidated.
        invalidated: usize,
    },
}

struct RegistryInner {
    sockets: HashMap<SocketId, Arc<PacketSocket>>,
    generation: Option<ModuleGeneration>,
    highest_issued: Option<SocketId>,
}

/// Maps native socket ids to their wrappers.
pub struct SocketRegistry {
    inner: Mutex<RegistryInner>,
    tolerance: u64,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketRegistry {
    /// Create an empty registry with the default generation tolerance.
    pub fn new() -> Self {
        Self::with_tolerance(GENERATION_TOLERANCE)
    }

    /// Create an empty registry with a custom generation tolerance.
    pub fn with_tolerance(tolerance: u64) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sockets: HashMap::new(),
                generation: None,
                highest_issued: None,
            }),
            tolerance,
        }
    }

    /// Track `socket` under `socket_id`.
    ///
    /// A later registration for the same id replaces the earlier one; the
    /// replaced wrapper is returned.
    pub fn register_socket(
        &self,
        socket_id: SocketId,
        socket: Arc<PacketSocket>,
    ) -> Option<Arc<PacketSocket>> {
        let previous = self.inner.lock().sockets.insert(socket_id, socket);
        if previous.is_some() {
            tracing::debug!(target: targets::REGISTRY, %socket_id, "replacing registered socket");
        }
        previous
    }

    /// Look up the wrapper for `socket_id`.
    pub fn resolve(&self, socket_id: SocketId) -> Option<Arc<PacketSocket>> {
        self.inner.lock().sockets.get(&socket_id).cloned()
    }

    /// Whether `socket_id` is tracked.
    pub fn contains(&self, socket_id: SocketId) -> bool {
        self.inner.lock().sockets.contains_key(&socket_id)
    }

    /// Whether `socket` is the wrapper currently tracked under its id.
    pub fn is_current(&self, socket: &PacketSocket) -> bool {
        self.inner
            .lock()
            .sockets
            .get(&socket.id())
            .is_some_and(|tracked| std::ptr::eq(Arc::as_ptr(tracked), socket))
    }

    /// Stop tracking `socket`.
    ///
    /// Only removes the entry if it still points at this wrapper, so a closing
    /// socket from an old generation never evicts a newer socket that reuses
    /// its id.
    pub fn unregister(&self, socket: &PacketSocket) -> bool {
        let mut inner = self.inner.lock();
        let id = socket.id();
        let same = inner
            .sockets
            .get(&id)
            .is_some_and(|tracked| std::ptr::eq(Arc::as_ptr(tracked), socket));
        if same {
            inner.sockets.remove(&id);
        }
        same
    }

    /// Number of tracked sockets.
    pub fn len(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    /// Whether no sockets are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sockets.is_empty()
    }

    /// The recorded module generation.
    pub fn current_generation(&self) -> Option<ModuleGeneration> {
        self.inner.lock().generation
    }

    /// Remove and return every tracked wrapper without touching their state.
    pub fn drain(&self) -> Vec<Arc<PacketSocket>> {
        self.inner.lock().sockets.drain().map(|(_, socket)| socket).collect()
    }

    /// Invalidate every tracked wrapper and forget them.
    ///
    /// Returns the number of wrappers invalidated.
    pub fn invalidate_all(&self) -> usize {
        let _span = PerfSpan::new("registry.invalidate_all");
        let sockets = {
            let mut inner = self.inner.lock();
            inner.highest_issued = None;
            inner.sockets.drain().map(|(_, socket)| socket).collect::<Vec<_>>()
        };
        for socket in &sockets {
            socket.invalidate();
        }
        sockets.len()
    }

    /// Compare `generation` with the recorded one.
    ///
    /// When it differs by more than the tolerance, every tracked wrapper is
    /// invalidated and the new generation becomes current.
    pub fn record_generation(&self, generation: ModuleGeneration) -> GenerationCheck {
        let (previous, stale) = {
            let mut inner = self.inner.lock();
            match inner.generation {
                None => {
                    inner.generation = Some(generation);
                    tracing::debug!(target: targets::REGISTRY, %generation, "recorded module generation");
                    return GenerationCheck::Baseline;
                }
                Some(previous) if previous.distance(generation) <= self.tolerance => {
                    return GenerationCheck::Unchanged;
                }
                Some(previous) => {
                    inner.generation = Some(generation);
                    inner.highest_issued = None;
                    let stale: Vec<_> = inner.sockets.drain().map(|(_, socket)| socket).collect();
                    (previous, stale)
                }
            }
        };

        for socket in &stale {
            socket.invalidate();
        }
        tracing::warn!(
            target: targets::REGISTRY,
            %previous,
            current = %generation,
            invalidated = stale.len(),
            "native module generation changed, invalidated stale sockets"
        );
        GenerationCheck::Reset {
            previous,
            current: generation,
            invalidated: stale.len(),
        }
    }

    /// Note that the native layer issued `socket_id`.
    ///
    /// Returns `true` when the first id of a generation is handed out again
    /// after higher ids were seen without a generation change, which usually
    /// means the module restarted without reporting it.
    pub fn record_issued(&self, socket_id: SocketId) -> bool {
        let mut inner = self.inner.lock();
        let restarted = socket_id.is_first()
            && inner
                .highest_issued
                .is_some_and(|highest| highest > socket_id);
        inner.highest_issued = match inner.highest_issued {
            Some(highest) if !restarted => Some(highest.max(socket_id)),
            _ => Some(socket_id),
        };
        restarted
    }
}

impl std::fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SocketRegistry")
            .field("sockets", &inner.sockets.len())
            .field("generation", &inner.generation)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}
