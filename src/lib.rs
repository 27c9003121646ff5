//! A multi-threaded, readiness-driven socket I/O engine.
//!
//! `sockio` multiplexes many UDP and TCP endpoints over a single OS-level
//! readiness loop ([`watcher`]) and delivers I/O completions through a
//! task-dispatched [`CompletionEvent`] system. Clients submit non-blocking
//! operations (connect, accept, send, receive, marker) bound to a task; the
//! engine drives the kernel descriptors, performs scatter/gather transfers,
//! attaches optional per-datagram metadata, and hands results back as
//! completion events whose ordering per-socket-per-direction matches
//! submission.
//!
//! The engine itself does not know how its completions are scheduled: it
//! depends only on the [`TaskDispatcher`]/[`TaskHandle`] seam in [`task`].
//! Callers that have no richer scheduler of their own can use
//! [`task::ChannelDispatcher`], a minimal channel-backed reference
//! implementation good enough to drive the engine's own test suite.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sockio::{Family, SocketKind, SocketManager};
//! use sockio::task::{ChannelDispatcher, TaskHandle};
//!
//! let dispatcher = ChannelDispatcher::new();
//! let manager = SocketManager::new(Default::default(), dispatcher.clone()).unwrap();
//! let (task, _completions) = dispatcher.spawn_task();
//! let task: Arc<dyn TaskHandle> = Arc::new(task);
//! let sock = manager.create(SocketKind::Udp, Family::Inet).unwrap();
//! sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
//! ```

#[cfg(not(unix))]
compile_error!("sockio currently only supports unix-family targets");

mod buffer;
mod config;
mod dispatch;
mod error;
mod io_ops;
mod manager;
mod message;
mod request;
mod selector;
mod socket;
pub mod task;
mod watcher;

pub use buffer::{ByteSource, OwnedBuffer};
pub use config::ManagerConfig;
pub use error::{ErrorKind, Result, SocketError};
pub use manager::{Family, SocketManager};
pub use request::{CancelMask, CompletionAttrs, CompletionEvent, EventKind, PacketInfo, Timestamp};
pub use socket::{SocketHandle, SocketKind};
pub use task::{TaskDispatcher, TaskHandle};
