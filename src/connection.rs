//! Per-connection state resumed by every tick.
//!
//! A [`Connection`] is pooled: it is built once with its scratch buffer and
//! send buffer, handed to an accepted socket, and reset when the socket goes
//! away. Everything that must survive between ticks lives here rather than on
//! a call stack, which is what lets a tick return on `WouldBlock` and pick up
//! where it left off on the next readiness event.
//!
//! ```text
//! Handshaking ─▶ Receiving ─▶ Processing ─▶ Sending ─▶ Draining ─▶ Closed
//!   (TLS)          recv_end      process_end            everything_end
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    buffer::GrowableBuffer,
    error::Result,
    socket::{self, Sent, Socket},
};

/// Unique identifier for connections.
///
/// Assigned when a socket is accepted and stable for the connection's
/// lifetime. Id 0 never names a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub const INVALID: ConnectionId = ConnectionId(0);

    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a connection is in its lifecycle. Phases only move forward until
/// the connection is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Handshaking,
    Receiving,
    Processing,
    Sending,
    /// Nothing more to do; waiting for teardown.
    Draining,
    Closed,
}

/// Protocol-specific half of a connection.
pub trait ConnectionState: Send + 'static {
    /// Returns the state to what a freshly built one looks like.
    fn reset(&mut self);
}

pub type WriteEndHook<S> = Box<dyn FnMut(&mut Connection<S>) -> anyhow::Result<()> + Send>;
pub type DestroyHook<S> = Box<dyn FnOnce(&mut Connection<S>) + Send>;

/// The part of a connection other threads may touch.
pub(crate) struct Shared {
    pub(crate) send: GrowableBuffer,
    pub(crate) closing: AtomicBool,
}

impl Shared {
    fn new(send_limit: usize) -> Self {
        Self {
            send: GrowableBuffer::new(send_limit),
            closing: AtomicBool::new(false),
        }
    }
}

/// Outcome of draining pending output to the socket.
#[derive(Debug)]
pub(crate) enum Flush {
    /// Scratch and send buffer are both empty.
    Drained,
    /// The socket would block; unsent bytes stay in the scratch buffer.
    Blocked,
    Failed(std::io::Error),
}

pub struct Connection<S> {
    id: ConnectionId,
    scratch: Box<[u8]>,
    used_len: usize,
    start_use: usize,
    phase: Phase,
    response_end: bool,
    shared: Arc<Shared>,
    scratch_size: usize,
    send_limit: usize,
    on_write_end: Option<WriteEndHook<S>>,
    on_destroy: Option<DestroyHook<S>>,
    state: S,
}

impl<S: ConnectionState> Connection<S> {
    pub fn new(scratch_size: usize, send_limit: usize, state: S) -> Self {
        Self {
            id: ConnectionId::INVALID,
            scratch: vec![0; scratch_size].into_boxed_slice(),
            used_len: 0,
            start_use: 0,
            phase: Phase::Receiving,
            response_end: false,
            shared: Arc::new(Shared::new(send_limit)),
            scratch_size,
            send_limit,
            on_write_end: None,
            on_destroy: None,
            state,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// The complete input has been received (or the connection gave up).
    pub fn recv_end(&self) -> bool {
        self.phase >= Phase::Processing
    }

    pub fn process_end(&self) -> bool {
        self.phase >= Phase::Sending
    }

    pub fn everything_end(&self) -> bool {
        self.phase >= Phase::Draining
    }

    /// Whether the application declared its output complete.
    pub fn response_end(&self) -> bool {
        self.response_end
    }

    /// Declares that no more output will be queued; the connection finishes
    /// once what is queued has been written.
    pub fn end_response(&mut self) {
        self.response_end = true;
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Asks for teardown. It happens on the connection's own worker, at the
    /// top of its next tick.
    pub fn mark_close(&self) {
        self.shared.closing.store(true, Ordering::Release);
    }

    /// Queues bytes for the peer.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.shared.send.write(data)
    }

    pub fn send_buffer(&self) -> &GrowableBuffer {
        &self.shared.send
    }

    /// Bytes queued but not yet handed to the socket.
    pub fn pending_output(&self) -> usize {
        (self.used_len - self.start_use) + self.shared.send.readable_size()
    }

    /// Called every time queued output has been fully written. Without one,
    /// the connection finishes after its first drained response.
    pub fn set_on_write_end<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Connection<S>) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_write_end = Some(Box::new(hook));
    }

    /// Called once, right before the connection is torn down.
    pub fn set_on_destroy<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Connection<S>) + Send + 'static,
    {
        self.on_destroy = Some(Box::new(hook));
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /// Sets `everything_end`.
    pub(crate) fn finish(&mut self) {
        self.set_phase(Phase::Draining);
    }

    /// Binds a pooled connection to a freshly accepted socket.
    pub(crate) fn attach(&mut self, id: ConnectionId, handshaking: bool) {
        self.id = id;
        self.phase = if handshaking {
            Phase::Handshaking
        } else {
            Phase::Receiving
        };
    }

    pub(crate) fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    /// Takes the scratch buffer out so it can be filled while the rest of
    /// the connection is borrowed. Must be given back with `restore_scratch`.
    pub(crate) fn take_scratch(&mut self) -> Box<[u8]> {
        std::mem::take(&mut self.scratch)
    }

    pub(crate) fn restore_scratch(&mut self, scratch: Box<[u8]>) {
        self.scratch = scratch;
        self.used_len = 0;
        self.start_use = 0;
    }

    /// Writes the scratch buffer out, refilling it from the send buffer,
    /// until both are empty or the socket pushes back.
    pub(crate) fn flush(&mut self, socket: &mut dyn Socket) -> Flush {
        loop {
            while self.start_use < self.used_len {
                match socket::send(socket, &self.scratch[self.start_use..self.used_len]) {
                    Sent::Bytes(n) => self.start_use += n,
                    Sent::WouldBlock => return Flush::Blocked,
                    Sent::Failed(e) => return Flush::Failed(e),
                }
            }

            self.used_len = 0;
            self.start_use = 0;
            if self.scratch.is_empty() {
                return Flush::Drained;
            }
            match self.shared.send.read(&mut self.scratch) {
                Ok(0) | Err(_) => return Flush::Drained,
                Ok(n) => self.used_len = n,
            }
        }
    }

    /// Runs the write-end hook, if any. Returns `None` when no hook is set.
    pub(crate) fn fire_write_end(&mut self) -> Option<anyhow::Result<()>> {
        let mut hook = self.on_write_end.take()?;
        let result = hook(self);
        if self.on_write_end.is_none() {
            self.on_write_end = Some(hook);
        }
        Some(result)
    }

    pub(crate) fn fire_destroy(&mut self) {
        if let Some(hook) = self.on_destroy.take() {
            hook(self);
        }
    }

    /// Returns the connection to its freshly built state.
    ///
    /// The send buffer is shared with the registry for `safe_send`; if some
    /// other thread still holds it, a new one is made so late writes cannot
    /// reach the next user of this connection.
    pub(crate) fn reset(&mut self) {
        self.id = ConnectionId::INVALID;
        if self.scratch.len() != self.scratch_size {
            // a tick unwound while the scratch buffer was taken out
            self.scratch = vec![0; self.scratch_size].into_boxed_slice();
        }
        self.used_len = 0;
        self.start_use = 0;
        self.phase = Phase::Receiving;
        self.response_end = false;
        self.on_write_end = None;
        self.on_destroy = None;
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => {
                shared.send.clear();
                *shared.closing.get_mut() = false;
            }
            None => self.shared = Arc::new(Shared::new(self.send_limit)),
        }
        self.state.reset();
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("response_end", &self.response_end)
            .field("pending_scratch", &(self.used_len - self.start_use))
            .finish()
    }
}
