//! Opaque TLS handshake seam.
//!
//! The engine never speaks TLS itself. An [`Acceptor`](crate::reactor::Acceptor)
//! that wraps accepted streams in a TLS session hands back a [`Handshake`]
//! next to the socket, and the first ticks of that connection drive it until
//! it reports [`HandshakeStatus::Done`].

/// Outcome of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Done,
    /// Needs more bytes from the peer; wait for read readiness.
    WantRead,
    /// Needs to flush bytes to the peer; wait for write readiness.
    WantWrite,
    Failed(String),
}

pub trait Handshake: Send {
    /// Runs the handshake as far as it can go without blocking.
    fn advance(&mut self) -> HandshakeStatus;
}

impl<F> Handshake for F
where
    F: FnMut() -> HandshakeStatus + Send,
{
    fn advance(&mut self) -> HandshakeStatus {
        self()
    }
}
