//! Core systems for peerlink.
//!
//! This crate provides the foundational pieces shared by the peerlink
//! networking crates:
//!
//! - **Signal/Slot System**: Type-safe event emission used by sockets and
//!   transports for their `message`, `error`, `close` and `ready` events
//! - **Logging**: `tracing` targets, span names and a performance span guard
//!
//! # Signal/Slot Example
//!
//! ```
//! use peerlink_core::Signal;
//!
//! let closed = Signal::<()>::new();
//!
//! let conn_id = closed.connect(|_| {
//!     println!("socket closed");
//! });
//!
//! closed.emit(());
//! closed.disconnect(conn_id);
//! ```

pub mod logging;
pub mod signal;

pub use logging::PerfSpan;
pub use signal::{ConnectionId, Signal};
