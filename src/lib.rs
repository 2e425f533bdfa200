//! # Pulsenet
//! A tick-driven, non-blocking TCP client/server library for hosts that own
//! their main loop — game servers, simulations, embedded control planes —
//! and want networking to happen at a single, predictable point in the frame
//! instead of behind an async runtime or per-connection threads.
//!
//! ## Core model
//! Every client and server registers itself in a [`Breather`]. Once per tick
//! the host calls [`Breather::breathe`], which polls each registered instance
//! in turn: a zero-timeout, edge-triggered readiness check, a full drain of
//! every ready descriptor, and synchronous dispatch of the consumer's
//! callbacks — all on the calling thread. Nothing in that path blocks.
//!
//! - **Clients** ([`TcpClient`]) own one connection, with an optional
//!   background supervisor that re-dials whenever the link drops.
//! - **Servers** ([`TcpServer`]) own a listening socket, a mio `Poll`, and a
//!   table mapping each accepted peer to a [`ConnectionId`] — a stable,
//!   strictly increasing identity decoupled from the descriptor.
//! - **Handlers** ([`ClientHandler`], [`ServerHandler`]) receive connects,
//!   raw byte batches, and closes. No framing is imposed: bytes arrive as
//!   the transport delivered them.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pulsenet::prelude::*;
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_accept(&self, id: ConnectionId, remote: &RemoteInfo) {
//!         println!("{} connected from {}", id, remote);
//!     }
//!
//!     fn on_receive(&self, _id: ConnectionId, data: &[u8]) {
//!         println!("received {} bytes", data.len());
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let breather = Breather::new();
//!     let server = TcpServer::new(&breather, Echo);
//!     server.listen("127.0.0.1", 9000)?;
//!
//!     loop {
//!         breather.breathe();
//!         std::thread::sleep(std::time::Duration::from_millis(1));
//!     }
//! }
//! ```
//!
//! ## Threading
//! The intended model is single-threaded cooperative: whichever thread calls
//! `breathe` does all I/O and callback dispatch. `send`, `broadcast`, `find`,
//! and `is_valid` are additionally safe to call from other threads; the
//! auto-reconnect supervisor is the only thread the crate spawns itself.
//!
//! Writes to a congested peer retry with a short backoff up to a configured
//! budget and then fail with [`NetError::Backpressure`] rather than stalling
//! the tick forever.

pub mod breather;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
mod reconnect;
pub mod server;

pub use breather::{Breathe, Breather};
pub use client::TcpClient;
pub use config::{ClientConfig, ServerConfig};
pub use conn::{Connection, ConnectionId, RemoteInfo};
pub use error::{CloseReason, NetError, Result};
pub use handler::{ClientHandler, ServerHandler};
pub use server::TcpServer;

/// Re-exports of the types almost every consumer needs.
pub mod prelude {
    pub use crate::breather::Breather;
    pub use crate::client::TcpClient;
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::conn::{Connection, ConnectionId, RemoteInfo};
    pub use crate::error::{CloseReason, NetError, Result};
    pub use crate::handler::{ClientHandler, ServerHandler};
    pub use crate::server::TcpServer;
}
