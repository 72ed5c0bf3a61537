use std::{io, sync::Arc, time::Duration};

use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::{connection::ConnectionId, socket::Socket};

/// Token of the wake-up handle. Connection ids never get this high.
pub const WAKER_TOKEN: Token = Token(usize::MAX);
/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness notification registry, keyed by connection id.
///
/// Interest is one-shot from the engine's point of view: after each tick it
/// calls [`rearm`](Multiplexer::rearm) with what the connection waits for.
pub trait Multiplexer: Send + Sync {
    fn register(&self, id: ConnectionId, socket: &mut dyn Socket, interest: Interest)
        -> io::Result<()>;

    fn rearm(&self, id: ConnectionId, socket: &mut dyn Socket, interest: Interest)
        -> io::Result<()>;

    fn deregister(&self, id: ConnectionId, socket: &mut dyn Socket) -> io::Result<()>;
}

pub fn token_for(id: ConnectionId) -> Token {
    Token(id.as_u64() as usize)
}

/// A [`Multiplexer`] over a cloned [`mio::Registry`].
#[derive(Debug)]
pub struct MioMultiplexer {
    registry: Registry,
}

impl MioMultiplexer {
    pub fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            registry: registry.try_clone()?,
        })
    }
}

impl Multiplexer for MioMultiplexer {
    fn register(
        &self,
        id: ConnectionId,
        socket: &mut dyn Socket,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(socket, token_for(id), interest)
    }

    fn rearm(&self, id: ConnectionId, socket: &mut dyn Socket, interest: Interest) -> io::Result<()> {
        self.registry.reregister(socket, token_for(id), interest)
    }

    fn deregister(&self, _id: ConnectionId, socket: &mut dyn Socket) -> io::Result<()> {
        self.registry.deregister(socket)
    }
}

pub struct PollHandle {
    poller: Poll,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> io::Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(PollHandle {
            poller,
            waker: Arc::new(waker),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    pub fn multiplexer(&self) -> io::Result<MioMultiplexer> {
        MioMultiplexer::new(self.poller.registry())
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
