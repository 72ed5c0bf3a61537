use std::io::{self, Read, Write};

use mio::event::Source;

use crate::tls::{Handshake, HandshakeStatus};

/// A non-blocking byte stream the multiplexer can watch.
///
/// Implemented for anything that is `Read + Write + mio::event::Source`,
/// which covers `mio::net::TcpStream` and TLS wrappers around it.
pub trait Socket: Read + Write + Source + Send + 'static {}

impl<T> Socket for T where T: Read + Write + Source + Send + 'static {}

/// The socket half of a registry entry: the stream plus its pending TLS
/// handshake, if any.
pub struct SocketSlot {
    stream: Box<dyn Socket>,
    handshake: Option<Box<dyn Handshake>>,
}

impl SocketSlot {
    pub fn new(stream: Box<dyn Socket>, handshake: Option<Box<dyn Handshake>>) -> Self {
        Self { stream, handshake }
    }

    pub fn plain<S: Socket>(stream: S) -> Self {
        Self::new(Box::new(stream), None)
    }

    /// True once no handshake is pending.
    pub fn is_accepted(&self) -> bool {
        self.handshake.is_none()
    }

    /// Drives the pending handshake one step. Without one this is `Done`.
    pub(crate) fn advance_handshake(&mut self) -> HandshakeStatus {
        let Some(handshake) = self.handshake.as_mut() else {
            return HandshakeStatus::Done;
        };
        let status = handshake.advance();
        if status == HandshakeStatus::Done {
            self.handshake = None;
        }
        status
    }

    pub fn stream_mut(&mut self) -> &mut dyn Socket {
        &mut *self.stream
    }
}

/// Result of one non-blocking read.
#[derive(Debug)]
pub(crate) enum Recv {
    Data(usize),
    WouldBlock,
    /// Peer closed its write half.
    Closed,
    Failed(io::Error),
}

/// Reads once, retrying on `Interrupted`.
pub(crate) fn recv(socket: &mut dyn Socket, buf: &mut [u8]) -> Recv {
    loop {
        match socket.read(buf) {
            Ok(0) => return Recv::Closed,
            Ok(n) => return Recv::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Recv::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Recv::Failed(e),
        }
    }
}

/// Result of one non-blocking write.
#[derive(Debug)]
pub(crate) enum Sent {
    Bytes(usize),
    WouldBlock,
    Failed(io::Error),
}

/// Writes once, retrying on `Interrupted`. A zero-length write counts as a
/// failure: the peer is gone.
pub(crate) fn send(socket: &mut dyn Socket, buf: &[u8]) -> Sent {
    loop {
        match socket.write(buf) {
            Ok(0) => return Sent::Failed(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => return Sent::Bytes(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Sent::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Sent::Failed(e),
        }
    }
}
