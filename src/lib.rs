//! # mill-conn
//! A connection-task engine for Rust servers built directly on [`mio`], without an async runtime.
//! Sockets are accepted, their readiness events are spread over a fixed pool of worker threads,
//! and every connection is driven through a resumable, protocol-specific state machine:
//! length-prefixed stream frames, HTTP request/response, or a WebSocket upgrade followed by raw
//! byte pumping.
//! ## Core Philosophy
//! - **No coroutines**: each connection keeps its progress in explicit state, so a tick that would
//!   block simply re-arms interest and returns the worker
//! - **Affinity dispatch**: every tick for a connection runs on the same worker, in order
//! - **Bounded resources**: connections come from a pre-built pool; when it is empty new peers are
//!   refused instead of growing memory
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐  accept   ┌──────────────┐  Task{id}  ┌───────────────┐
//! │   Server    │──────────▶│    Engine    │───────────▶│  WorkerPool   │
//! │ (mio poll)  │ readiness │  registry +  │ id % n     │ one FIFO per  │
//! └─────────────┘──────────▶│  conn pool   │            │ worker        │
//!        ▲                  └──────────────┘            └───────┬───────┘
//!        │ rearm(READABLE / WRITABLE)                           │ tick
//!        └──────────────────────────────────────── ProtocolTask::advance
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_conn::prelude::*;
//!
//! struct Hello;
//!
//! impl HttpApp for Hello {
//!     fn process(&self, conn: &mut HttpConnection) -> anyhow::Result<()> {
//!         conn.send(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder()
//!         .address("127.0.0.1:8080".parse()?)
//!         .workers(4)
//!         .build()?;
//!     let mut server = Server::bind(config, HttpProtocol::new(Hello))?;
//!     server.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`engine`]: the tick, teardown, cross-thread `safe_send` and outbound `connect`
//! - [`protocol`]: stream, HTTP and WebSocket state machines
//! - [`registry`]: id → connection directory
//! - [`thread_pool`]: workers with affinity dispatch
//! - [`buffer`] and [`object_pool`]: the bounded building blocks
//! - [`reactor`] and [`poll`]: the mio accept and readiness loop

#![cfg_attr(feature = "unstable-mpmc", feature(mpmc_channel))]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod object_pool;
pub mod poll;
pub mod protocol;
pub mod reactor;
pub mod registry;
pub mod socket;
pub mod task;
pub mod thread_pool;
pub mod tls;

#[cfg(test)]
mod test_util;

pub use buffer::GrowableBuffer;
pub use config::EngineConfig;
pub use connection::{Connection, ConnectionId, Phase};
pub use engine::Engine;
pub use error::{Error, Result};
pub use object_pool::{BoundedObjectPool, PooledObject};
pub use reactor::{Acceptor, PlainAcceptor, Server, ShutdownHandle};
pub use task::{Next, ProtocolKind, ProtocolTask, Task};

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_conn::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::connection::{Connection, ConnectionId};
    pub use crate::engine::Engine;
    pub use crate::protocol::frame::encode_frame;
    pub use crate::protocol::http::{HttpApp, HttpConnection, HttpProtocol, HttpRequest};
    pub use crate::protocol::stream::{StreamConnection, StreamDispatcher, StreamProtocol};
    pub use crate::protocol::websocket::{WebSocketApp, WebSocketConnection, WebSocketProtocol};
    pub use crate::reactor::{Server, ShutdownHandle};
    pub use crate::task::{Next, ProtocolTask};
}
