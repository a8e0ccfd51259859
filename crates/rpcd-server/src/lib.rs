//! # rpcd-server: connection admission and dispatch
//!
//! This crate owns the listening socket, accepts clients under a
//! single-threaded `poll(2)` loop and hands every accepted connection to
//! the dispatcher as an independent event source.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Server (composition root)                              │
//! │    MethodRegistry ── Introspection                      │
//! │    listen::open_listener   (create → … → listen, rollback)
//! │    Acceptor                (accept → budget → nonblock)  │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ add_source(Box<dyn Source>)
//!                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  Dispatcher                                             │
//! │    Poller::poll(fds, timeout)  ← only suspension point  │
//! │    handle_event → ContinueMonitoring | StopMonitoring   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use rpcd_server::{Server, EventMask};
//!
//! let mut server = Server::new(|fd, methods| my_connection(fd, methods));
//! server.add_method(Rc::new(MyMethod));
//! server.enable_introspection(true);
//! let port = server.bind(0)?;
//!
//! loop {
//!     server.work(Some(Duration::from_millis(250)));
//! }
//! ```
//!
//! ## Design Decisions
//!
//! - **Single owner**: connections are moved into the dispatcher as
//!   `Box<dyn Source>`; the server keeps no reference to them.
//! - **Explicit interest**: handlers return `Interest`, not a magic mask.
//! - **Injectable collaborators**: sockets, poller and clock are traits so
//!   rollback and backoff are testable without a network.
//! - **`Rc`, not `Arc`**: the server is `!Send` by construction.

pub mod accept;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod listen;
pub mod server;
pub mod socket;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the main types
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::ServerConfig;
pub use connection::ConnectionFactory;
pub use dispatch::{Context, Dispatcher, EventMask, ExitHandle, Interest, PollFd, Poller, Source, SysPoller};
pub use error::{ConfigError, SetupError, SetupStep};
pub use server::{Server, ServerBuilder};
pub use socket::{SocketApi, SysSocket};

pub use rpcd_core::{Fault, Method, MethodRegistry, Value};
