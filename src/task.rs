use std::fmt;

use crate::{
    config::EngineConfig,
    connection::{Connection, ConnectionId, ConnectionState},
    socket::Socket,
    thread_pool::Affinity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Stream,
    Http,
    WebSocket,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolKind::Stream => "stream",
            ProtocolKind::Http => "http",
            ProtocolKind::WebSocket => "websocket",
        })
    }
}

/// One unit of work: "tick the connection with this id".
///
/// A task carries no state of its own; everything it resumes lives on the
/// connection. Id 0 makes it a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub id: ConnectionId,
    pub kind: ProtocolKind,
}

impl Task {
    pub fn new(id: ConnectionId, kind: ProtocolKind) -> Self {
        Self { id, kind }
    }
}

impl Affinity for Task {
    fn affinity(&self) -> u64 {
        self.id.as_u64()
    }
}

/// What a tick wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait for the socket to become readable.
    Read,
    /// Wait for the socket to become writable.
    Write,
    /// Run another tick right away.
    Reschedule,
    /// Tear the connection down.
    Close,
}

/// A resumable per-protocol state machine.
///
/// `advance` is called once per tick with the connection and its socket
/// and must never block: it does as much receive/process/send work as the
/// socket allows and reports what it is waiting for.
pub trait ProtocolTask: Send + Sync + 'static {
    type State: ConnectionState;

    const KIND: ProtocolKind;

    fn new_state(&self, config: &EngineConfig) -> Self::State;

    /// The connection is accepted (after the TLS handshake, if any).
    fn on_connected(&self, conn: &mut Connection<Self::State>) {
        let _ = conn;
    }

    /// Called once per connection during teardown.
    fn on_destroy(&self, conn: &mut Connection<Self::State>) {
        let _ = conn;
    }

    fn advance(&self, conn: &mut Connection<Self::State>, socket: &mut dyn Socket) -> Next;
}
