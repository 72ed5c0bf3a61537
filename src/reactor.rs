use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Waker,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    connection::ConnectionId,
    engine::Engine,
    error::{Error, Result},
    poll::{PollHandle, LISTENER_TOKEN, WAKER_TOKEN},
    socket::SocketSlot,
    task::ProtocolTask,
};

/// Turns an accepted TCP stream into the socket the engine drives.
///
/// A TLS acceptor wraps the stream in its session type and hands back the
/// pending handshake next to it.
pub trait Acceptor: Send + Sync + 'static {
    fn accept(&self, stream: TcpStream) -> io::Result<SocketSlot>;
}

/// Uses accepted streams as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainAcceptor;

impl Acceptor for PlainAcceptor {
    fn accept(&self, stream: TcpStream) -> io::Result<SocketSlot> {
        Ok(SocketSlot::plain(stream))
    }
}

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake the poll loop");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Accept loop and readiness dispatch for one protocol.
///
/// `run` blocks the calling thread: it polls, accepts new connections into
/// the engine, and turns every connection readiness event into a tick on
/// that connection's worker.
pub struct Server<P: ProtocolTask> {
    poll_handle: PollHandle,
    listener: TcpListener,
    events: Events,
    engine: Arc<Engine<P>>,
    acceptor: Box<dyn Acceptor>,
    shutdown: Arc<AtomicBool>,
}

impl<P: ProtocolTask> Server<P> {
    pub fn bind(config: EngineConfig, protocol: P) -> Result<Self> {
        config.validate()?;
        let poll_handle = PollHandle::new()?;
        let mut listener = TcpListener::bind(config.address)?;
        poll_handle
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mux = Arc::new(poll_handle.multiplexer()?);
        let events = Events::with_capacity(config.events_capacity);
        let engine = Engine::new(config, protocol, mux)?;

        Ok(Self {
            poll_handle,
            listener,
            events,
            engine,
            acceptor: Box::new(PlainAcceptor),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_acceptor<A: Acceptor>(mut self, acceptor: A) -> Self {
        self.acceptor = Box::new(acceptor);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn engine(&self) -> &Arc<Engine<P>> {
        &self.engine
    }

    /// Dials `addr` and serves the connection with this server's protocol.
    /// Same as [`Engine::connect`].
    pub fn connect(&self, addr: SocketAddr) -> Result<ConnectionId> {
        self.engine.connect(addr)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: self.poll_handle.waker(),
        }
    }

    /// Runs until a [`ShutdownHandle`] fires, then stops the engine.
    pub fn run(&mut self) -> Result<()> {
        let poll_timeout = Duration::from_millis(self.engine.config().poll_timeout_ms);
        let mut backlog = false;
        info!(address = ?self.local_addr().ok(), kind = %P::KIND, "server running");

        while !self.shutdown.load(Ordering::SeqCst) {
            // pending accepts left over from the last round: don't sleep
            let timeout = if backlog { Duration::ZERO } else { poll_timeout };
            self.poll_handle.poll(&mut self.events, Some(timeout))?;
            if backlog {
                backlog = self.accept_ready();
            }

            for event in self.events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => backlog = self.accept_ready(),
                    token => self.engine.schedule(ConnectionId(token.0 as u64)),
                }
            }
        }

        self.engine.stop();
        info!("server stopped");
        Ok(())
    }

    /// Accepts up to `accept_per_tick` connections. Returns true if more may
    /// be waiting.
    fn accept_ready(&self) -> bool {
        for _ in 0..self.engine.config().accept_per_tick {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return false;
                }
            }
        }
        true
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.engine.config().no_delay) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        let socket = match self.acceptor.accept(stream) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(%peer, error = %e, "acceptor rejected connection");
                return;
            }
        };
        match self.engine.accept(socket) {
            Ok(id) => debug!(conn = %id, %peer, "new connection"),
            Err(Error::ResourceExhausted(_)) => {
                warn!(%peer, "connection limit reached, refusing")
            }
            Err(e) => warn!(%peer, error = %e, "failed to admit connection"),
        }
    }
}
