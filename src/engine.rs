//! The tick: everything a worker does when a connection's task runs.
//!
//! ```text
//! readiness ─▶ schedule(id) ─▶ worker[id % n] ─▶ tick(task)
//!                                                  │
//!        lookup ─▶ closing? ─▶ teardown            │
//!               └▶ handshake ─▶ advance ─▶ Next ───┘
//!                                 Read/Write: rearm
//!                                 Reschedule: push again
//!                                 Close: mark + push (teardown next tick)
//! ```

use std::{
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
};

use mio::{net::TcpStream, Interest};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::EngineConfig,
    connection::{Connection, ConnectionId, Phase},
    error::{Error, Result},
    object_pool::BoundedObjectPool,
    poll::Multiplexer,
    registry::{ConnectionRegistry, Slot},
    socket::SocketSlot,
    task::{Next, ProtocolTask, Task},
    thread_pool::WorkerPool,
    tls::HandshakeStatus,
};

/// Owns the registry, the connection pool and the workers for one protocol.
pub struct Engine<P: ProtocolTask> {
    protocol: P,
    config: EngineConfig,
    registry: ConnectionRegistry<P::State>,
    connections: BoundedObjectPool<Connection<P::State>>,
    workers: WorkerPool<Task>,
    mux: Arc<dyn Multiplexer>,
    next_id: AtomicU64,
}

impl<P: ProtocolTask> Engine<P> {
    pub fn new(config: EngineConfig, protocol: P, mux: Arc<dyn Multiplexer>) -> Result<Arc<Self>> {
        config.validate()?;

        // Workers reach the engine through a weak handle; the engine owns them.
        let handle: Arc<OnceLock<Weak<Engine<P>>>> = Arc::new(OnceLock::new());
        let workers = {
            let handle = Arc::clone(&handle);
            WorkerPool::new(
                config.workers,
                move |task: Task| {
                    if let Some(engine) = handle.get().and_then(Weak::upgrade) {
                        engine.tick(task);
                    }
                },
                |task: Task| trace!(conn = %task.id, kind = %task.kind, "discarded queued task"),
            )?
        };

        let connections = BoundedObjectPool::new(config.max_connections, false, || {
            Connection::new(
                config.scratch_size,
                config.send_buffer_limit,
                protocol.new_state(&config),
            )
        });

        let engine = Arc::new(Self {
            protocol,
            registry: ConnectionRegistry::new(),
            connections,
            workers,
            mux,
            next_id: AtomicU64::new(1),
            config,
        });
        let _ = handle.set(Arc::downgrade(&engine));

        debug!(
            kind = %P::KIND,
            workers = engine.config.workers,
            max_connections = engine.config.max_connections,
            "engine started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn registry(&self) -> &ConnectionRegistry<P::State> {
        &self.registry
    }

    /// Free connection slots. Advisory.
    pub fn available_connections(&self) -> usize {
        self.connections.space()
    }

    pub fn is_stopped(&self) -> bool {
        self.workers.is_stopped()
    }

    /// Takes over an accepted socket.
    ///
    /// Fails with `ResourceExhausted` when all pooled connections are in use;
    /// the caller drops the socket, which refuses the peer.
    pub fn accept(&self, socket: SocketSlot) -> Result<ConnectionId> {
        if self.is_stopped() {
            return Err(Error::PoolStopped);
        }
        let mut conn = self.connections.try_allocate()?;
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let handshaking = !socket.is_accepted();
        conn.attach(id, handshaking);
        if !handshaking {
            self.guarded(id, "on_connected", || self.protocol.on_connected(&mut conn));
        }
        // output to flush, or on_connected already asked to close
        let wake = conn.pending_output() > 0 || conn.is_closing();

        let entry = self.registry.add(id, socket, conn)?;
        let registered = {
            let mut slot = entry.lock();
            self.mux
                .register(id, slot.socket.stream_mut(), Interest::READABLE)
        };
        if let Err(e) = registered {
            warn!(conn = %id, error = %e, "failed to register connection");
            self.teardown(id);
            return Err(e.into());
        }

        if wake {
            self.schedule(id);
        }
        trace!(conn = %id, tls = handshaking, "accepted connection");
        Ok(id)
    }

    /// Opens an outbound connection to `addr` and drives it like an accepted
    /// one.
    ///
    /// The connect completes in the background: output queued before then
    /// waits for write readiness, and a refused connect shows up as a failed
    /// read that closes the connection.
    pub fn connect(&self, addr: SocketAddr) -> Result<ConnectionId> {
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }
        let id = self.accept(SocketSlot::plain(stream))?;
        debug!(conn = %id, %addr, "outbound connection");
        Ok(id)
    }

    /// Queues a tick for `id` on its worker.
    pub fn schedule(&self, id: ConnectionId) {
        if let Err(e) = self.workers.push(Task::new(id, P::KIND)) {
            trace!(conn = %id, error = %e, "tick not scheduled");
        }
    }

    /// Queues `data` for `id` from any thread and schedules a tick to flush
    /// it. `Ok(false)` if the connection is gone or closing.
    pub fn safe_send(&self, id: ConnectionId, data: &[u8]) -> Result<bool> {
        let queued = self.registry.safe_send(id, data)?;
        if queued {
            self.schedule(id);
        }
        Ok(queued)
    }

    /// Asks for `id` to be torn down on its own worker.
    pub fn close(&self, id: ConnectionId) -> bool {
        let marked = self.registry.mark_close(id);
        if marked {
            self.schedule(id);
        }
        marked
    }

    /// One resumption of a connection's state machine.
    pub fn tick(&self, task: Task) {
        let id = task.id;
        if !id.is_valid() {
            return;
        }
        let Some(entry) = self.registry.get(id) else {
            trace!(conn = %id, "tick for unknown connection");
            return;
        };
        if entry.is_closing() {
            self.teardown(id);
            return;
        }

        let next = {
            let mut slot = entry.lock();
            let Slot { socket, conn } = &mut *slot;
            let Some(conn) = conn.as_mut() else {
                return;
            };

            match socket.advance_handshake() {
                HandshakeStatus::Done => {
                    if conn.phase() == Phase::Handshaking {
                        conn.set_phase(Phase::Receiving);
                        self.guarded(id, "on_connected", || self.protocol.on_connected(conn));
                    }
                }
                HandshakeStatus::WantRead => {
                    self.rearm(id, socket, Interest::READABLE);
                    return;
                }
                HandshakeStatus::WantWrite => {
                    self.rearm(id, socket, Interest::WRITABLE);
                    return;
                }
                HandshakeStatus::Failed(reason) => {
                    warn!(conn = %id, error = %Error::Tls(reason), "closing connection");
                    conn.mark_close();
                    drop(slot);
                    self.schedule(id);
                    return;
                }
            }

            let stream = socket.stream_mut();
            let next = match panic::catch_unwind(AssertUnwindSafe(|| {
                self.protocol.advance(conn, stream)
            })) {
                Ok(next) => next,
                Err(_) => {
                    error!(conn = %id, "protocol task panicked, closing connection");
                    Next::Close
                }
            };
            // a callback may have marked close whatever the task returned
            let next = if conn.is_closing() { Next::Close } else { next };

            match next {
                Next::Read => self.rearm(id, socket, Interest::READABLE),
                Next::Write => self.rearm(id, socket, Interest::WRITABLE),
                Next::Reschedule | Next::Close => {}
            }
            next
        };

        match next {
            Next::Reschedule => self.schedule(id),
            Next::Close => {
                entry.mark_close();
                self.schedule(id);
            }
            Next::Read | Next::Write => {}
        }
    }

    /// Stops the workers and tears down every connection still registered.
    pub fn stop(&self) {
        if self.is_stopped() {
            return;
        }
        self.workers.stop();
        let ids = self.registry.ids();
        for id in &ids {
            self.teardown(*id);
        }
        info!(kind = %P::KIND, closed = ids.len(), "engine stopped");
    }

    fn rearm(&self, id: ConnectionId, socket: &mut SocketSlot, interest: Interest) {
        if let Err(e) = self.mux.rearm(id, socket.stream_mut(), interest) {
            warn!(conn = %id, error = %e, "failed to re-arm connection");
            if self.registry.mark_close(id) {
                self.schedule(id);
            }
        }
    }

    /// Removes `id` and gives its connection back to the pool. Runs at most
    /// once per id; later calls find nothing to remove.
    fn teardown(&self, id: ConnectionId) {
        let Some(entry) = self.registry.remove(id) else {
            return;
        };

        let mut slot = entry.lock();
        let Some(mut conn) = slot.conn.take() else {
            return;
        };
        conn.mark_close();
        self.guarded(id, "on_destroy hook", || conn.fire_destroy());
        self.guarded(id, "on_destroy", || self.protocol.on_destroy(&mut conn));
        if let Err(e) = self.mux.deregister(id, slot.socket.stream_mut()) {
            debug!(conn = %id, error = %e, "deregister failed");
        }
        drop(slot);
        drop(entry);

        conn.set_phase(Phase::Closed);
        conn.reset();
        self.connections.release(conn);
        trace!(conn = %id, "connection torn down");
    }

    /// Runs an application callback, turning a panic into a log line.
    fn guarded<F: FnOnce()>(&self, id: ConnectionId, what: &'static str, f: F) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(conn = %id, callback = what, "application callback panicked");
        }
    }
}

impl<P: ProtocolTask> Drop for Engine<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
