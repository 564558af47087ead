//! The shared UDP transport.
//!
//! One [`UdpTransport`] owns the native bridge, the socket registry and the
//! process-wide event sink. Handles are cheap clones of the same shared
//! state; consumers that need the native module to stay up take a
//! reference with [`UdpTransport::acquire`] and give it back with
//! [`UdpTransport::release`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use peerlink_core::Signal;
use peerlink_core::logging::{span_names, targets};
use tracing::Instrument;

use super::bridge::{BridgeCapabilities, BridgeEvent, BridgeLoader, NativeBridge, static_loader};
use super::config::SocketOptions;
use super::registry::{GenerationCheck, SocketRegistry};
use super::socket::PacketSocket;
use super::state::TransportState;
use crate::Result;
use crate::error::NetworkError;

type InitFuture = Shared<BoxFuture<'static, Result<()>>>;
type TeardownFuture = Shared<BoxFuture<'static, ()>>;

struct Lifecycle {
    state: TransportState,
    ref_count: usize,
    bridge: Option<Arc<dyn NativeBridge>>,
    capabilities: Option<BridgeCapabilities>,
    init: Option<InitFuture>,
    teardown: Option<TeardownFuture>,
}

struct TransportShared {
    loader: BridgeLoader,
    registry: Arc<SocketRegistry>,
    lifecycle: Mutex<Lifecycle>,
    shutdown_count: AtomicU64,
    state_changed: Signal<TransportState>,
}

impl TransportShared {
    fn set_state(&self, lifecycle: &mut Lifecycle, state: TransportState) {
        tracing::trace!(target: targets::UDP, from = %lifecycle.state, to = %state, "transport state change");
        lifecycle.state = state;
    }
}

enum InitStep {
    Ready,
    Start(InitFuture),
    Join(InitFuture),
    WaitTeardown(TeardownFuture),
}

enum ShutdownStep {
    Done,
    Join(TeardownFuture),
    WaitInit(InitFuture),
}

/// The shared UDP transport.
///
/// # Lifecycle
///
/// `Uninitialized → Initializing → Ready → ShuttingDown → Uninitialized`.
/// Concurrent initialization requests share one in-flight bring-up, and
/// concurrent shutdown requests share one teardown.
///
/// # Signals
///
/// - [`state_changed`](Self::state_changed): Emitted on every lifecycle transition
///
/// # Example
///
/// ```ignore
/// let transport = UdpTransport::with_bridge(Arc::new(TokioBridge::new()));
/// let handle = transport.acquire().await?;
///
/// let socket = handle.create_socket(SocketOptions::default()).await?;
/// socket.bind(0, None).await?;
///
/// handle.release().await;
/// ```
#[derive(Clone)]
pub struct UdpTransport {
    shared: Arc<TransportShared>,
}

impl UdpTransport {
    /// Create a transport that obtains the native module from `loader`.
    pub fn new(loader: BridgeLoader) -> Self {
        Self {
            shared: Arc::new(TransportShared {
                loader,
                registry: Arc::new(SocketRegistry::new()),
                lifecycle: Mutex::new(Lifecycle {
                    state: TransportState::Uninitialized,
                    ref_count: 0,
                    bridge: None,
                    capabilities: None,
                    init: None,
                    teardown: None,
                }),
                shutdown_count: AtomicU64::new(0),
                state_changed: Signal::new(),
            }),
        }
    }

    /// Create a transport over a fixed bridge.
    pub fn with_bridge(bridge: Arc<dyn NativeBridge>) -> Self {
        Self::new(static_loader(bridge))
    }

    /// Signal emitted on every lifecycle transition.
    pub fn state_changed(&self) -> &Signal<TransportState> {
        &self.shared.state_changed
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.shared.lifecycle.lock().state
    }

    /// Whether sockets can be created.
    pub fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    /// Outstanding references taken with [`acquire`](Self::acquire).
    pub fn ref_count(&self) -> usize {
        self.shared.lifecycle.lock().ref_count
    }

    /// Capabilities of the native module, once initialized.
    pub fn capabilities(&self) -> Option<BridgeCapabilities> {
        self.shared.lifecycle.lock().capabilities
    }

    /// Number of tracked sockets.
    pub fn socket_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// How many teardowns have completed.
    pub fn shutdown_count(&self) -> u64 {
        self.shared.shutdown_count.load(Ordering::SeqCst)
    }

    /// The socket registry.
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.shared.registry
    }

    /// Whether two handles refer to the same transport.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Bring the native module up if it is not already.
    ///
    /// Callers that arrive while a bring-up is in flight wait for it and get
    /// its result. Callers that arrive during a teardown wait for the
    /// teardown and then start a fresh bring-up.
    pub async fn initialize(&self) -> Result<()> {
        loop {
            let step = {
                let mut lifecycle = self.shared.lifecycle.lock();
                match (lifecycle.state, lifecycle.init.clone(), lifecycle.teardown.clone()) {
                    (TransportState::Ready, _, _) => InitStep::Ready,
                    (TransportState::Initializing, Some(init), _) => InitStep::Join(init),
                    (TransportState::ShuttingDown, _, Some(teardown)) => {
                        InitStep::WaitTeardown(teardown)
                    }
                    _ => {
                        let init = bring_up(self.shared.clone())
                            .instrument(tracing::info_span!(
                                target: targets::UDP,
                                span_names::BRIDGE_INIT
                            ))
                            .boxed()
                            .shared();
                        self.shared.set_state(&mut lifecycle, TransportState::Initializing);
                        lifecycle.init = Some(init.clone());
                        InitStep::Start(init)
                    }
                }
            };

            match step {
                InitStep::Ready => return Ok(()),
                InitStep::Start(init) => {
                    self.shared.state_changed.emit(TransportState::Initializing);
                    return init.await;
                }
                InitStep::Join(init) => return init.await,
                InitStep::WaitTeardown(teardown) => teardown.await,
            }
        }
    }

    /// Initialize if needed and take a reference.
    pub async fn acquire(&self) -> Result<UdpTransport> {
        loop {
            self.initialize().await?;
            {
                let mut lifecycle = self.shared.lifecycle.lock();
                if lifecycle.state == TransportState::Ready {
                    lifecycle.ref_count += 1;
                    tracing::debug!(target: targets::UDP, references = lifecycle.ref_count, "transport acquired");
                    return Ok(self.clone());
                }
            }
        }
    }

    /// Give back a reference; the last release shuts the transport down.
    ///
    /// Releasing with no outstanding references only logs a warning.
    pub async fn release(&self) {
        let last = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.ref_count == 0 {
                tracing::warn!(target: targets::UDP, "release called with no outstanding references");
                return;
            }
            lifecycle.ref_count -= 1;
            tracing::debug!(target: targets::UDP, references = lifecycle.ref_count, "transport released");
            lifecycle.ref_count == 0
        };
        if last {
            self.shutdown().await;
        }
    }

    /// Shut down once no references are outstanding.
    ///
    /// While references remain this only logs; the last
    /// [`release`](Self::release) performs the teardown.
    pub async fn shutdown(&self) {
        self.shutdown_inner(false).await;
    }

    /// Shut down regardless of outstanding references.
    pub async fn force_shutdown(&self) {
        self.shutdown_inner(true).await;
    }

    async fn shutdown_inner(&self, force: bool) {
        loop {
            let step = {
                let mut lifecycle = self.shared.lifecycle.lock();
                match (lifecycle.state, lifecycle.init.clone(), lifecycle.teardown.clone()) {
                    (TransportState::ShuttingDown, _, Some(teardown)) => ShutdownStep::Join(teardown),
                    (TransportState::Initializing, Some(init), _) => ShutdownStep::WaitInit(init),
                    (TransportState::Ready, _, _) => {
                        if lifecycle.ref_count > 0 && !force {
                            tracing::debug!(
                                target: targets::UDP,
                                references = lifecycle.ref_count,
                                "shutdown deferred until the last reference is released"
                            );
                            ShutdownStep::Done
                        } else {
                            if lifecycle.ref_count > 0 {
                                tracing::warn!(
                                    target: targets::UDP,
                                    bypassed_references = lifecycle.ref_count,
                                    "forcing transport shutdown with outstanding references"
                                );
                            }
                            let teardown = tear_down(self.shared.clone())
                                .instrument(tracing::info_span!(
                                    target: targets::UDP,
                                    span_names::SHUTDOWN
                                ))
                                .boxed()
                                .shared();
                            self.shared.set_state(&mut lifecycle, TransportState::ShuttingDown);
                            lifecycle.teardown = Some(teardown.clone());
                            ShutdownStep::Join(teardown)
                        }
                    }
                    _ => {
                        lifecycle.ref_count = 0;
                        ShutdownStep::Done
                    }
                }
            };

            match step {
                ShutdownStep::Done => return,
                ShutdownStep::Join(teardown) => {
                    teardown.await;
                    return;
                }
                ShutdownStep::WaitInit(init) => {
                    let _ = init.await;
                }
            }
        }
    }

    /// Create a socket through the native module.
    ///
    /// Fails with [`NetworkError::NotInitialized`] unless the transport is
    /// ready.
    pub async fn create_socket(&self, options: SocketOptions) -> Result<Arc<PacketSocket>> {
        let (bridge, capabilities) = {
            let lifecycle = self.shared.lifecycle.lock();
            match (lifecycle.state, &lifecycle.bridge, lifecycle.capabilities) {
                (TransportState::Ready, Some(bridge), Some(capabilities)) => {
                    (bridge.clone(), capabilities)
                }
                _ => return Err(NetworkError::NotInitialized),
            }
        };

        let created = bridge
            .create_socket(&options)
            .await
            .map_err(|e| NetworkError::CreateSocket(e.message))?;

        let registry = &self.shared.registry;
        let generation_reset = matches!(
            registry.record_generation(created.module_generation),
            GenerationCheck::Reset { .. }
        );
        if registry.record_issued(created.socket_id) && !generation_reset {
            tracing::warn!(
                target: targets::UDP,
                socket_id = %created.socket_id,
                generation = %created.module_generation,
                "first socket id reissued without a generation change, rechecking native module"
            );
            let current = bridge.capabilities();
            if let Err(err) = current.validate() {
                tracing::error!(target: targets::UDP, error = %err, "native module failed the capability check");
                registry.invalidate_all();
                return Err(err);
            }
        }

        let socket = PacketSocket::new(created, &options, bridge, capabilities, registry.clone());
        registry.register_socket(created.socket_id, socket.clone());
        tracing::debug!(
            target: targets::UDP,
            socket_id = %created.socket_id,
            family = %options.family,
            "socket created"
        );
        Ok(socket)
    }
}

async fn bring_up(shared: Arc<TransportShared>) -> Result<()> {
    let result = async {
        let bridge = (shared.loader)().ok_or_else(|| {
            NetworkError::NativeModuleMissing("no native UDP module is linked into this build".into())
        })?;
        let capabilities = bridge.capabilities();
        capabilities.validate()?;
        bridge
            .initialize()
            .await
            .map_err(|e| NetworkError::NativeModuleMissing(format!("initialization failed: {e}")))?;

        let registry = shared.registry.clone();
        bridge.set_event_sink(Some(Arc::new(move |event| route_event(&registry, event))));
        Ok((bridge, capabilities))
    }
    .await;

    let mut lifecycle = shared.lifecycle.lock();
    lifecycle.init = None;
    match result {
        Ok((bridge, capabilities)) => {
            lifecycle.bridge = Some(bridge);
            lifecycle.capabilities = Some(capabilities);
            shared.set_state(&mut lifecycle, TransportState::Ready);
            drop(lifecycle);
            tracing::info!(
                target: targets::UDP,
                per_socket_events = capabilities.per_socket_events,
                zero_copy = capabilities.send_zero_copy,
                "UDP transport ready"
            );
            shared.state_changed.emit(TransportState::Ready);
            Ok(())
        }
        Err(err) => {
            shared.set_state(&mut lifecycle, TransportState::Uninitialized);
            drop(lifecycle);
            tracing::error!(target: targets::UDP, error = %err, "UDP transport initialization failed");
            Err(err)
        }
    }
}

async fn tear_down(shared: Arc<TransportShared>) {
    let (bridge, capabilities) = {
        let lifecycle = shared.lifecycle.lock();
        (lifecycle.bridge.clone(), lifecycle.capabilities)
    };
    shared.state_changed.emit(TransportState::ShuttingDown);

    let sockets = shared.registry.drain();
    tracing::info!(target: targets::UDP, sockets = sockets.len(), "shutting down UDP transport");
    for socket in sockets {
        if let Err(err) = socket.close().await {
            tracing::warn!(target: targets::UDP, socket_id = %socket.id(), error = %err, "error closing socket");
        }
    }

    if let Some(bridge) = bridge {
        if capabilities.is_some_and(|caps| caps.close_all)
            && let Err(err) = bridge.close_all_sockets().await
        {
            tracing::warn!(target: targets::UDP, error = %err, "closeAllSockets failed");
        }
        bridge.set_event_sink(None);
    }

    {
        let mut lifecycle = shared.lifecycle.lock();
        lifecycle.ref_count = 0;
        lifecycle.bridge = None;
        lifecycle.capabilities = None;
        lifecycle.teardown = None;
        shared.set_state(&mut lifecycle, TransportState::Uninitialized);
    }
    let completed = shared.shutdown_count.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(target: targets::UDP, shutdowns = completed, "UDP transport shut down");
    shared.state_changed.emit(TransportState::Uninitialized);
}

/// Process-wide sink: route an event to the socket that owns it.
fn route_event(registry: &SocketRegistry, event: BridgeEvent) {
    match registry.resolve(event.socket_id()) {
        Some(socket) => socket.dispatch(event),
        None => tracing::trace!(
            target: targets::REGISTRY,
            socket_id = %event.socket_id(),
            "dropping event for unknown socket"
        ),
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.shared.lifecycle.lock();
        f.debug_struct("UdpTransport")
            .field("state", &lifecycle.state)
            .field("ref_count", &lifecycle.ref_count)
            .field("sockets", &self.shared.registry.len())
            .finish()
    }
}
