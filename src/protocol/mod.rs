//! Protocol task state machines.
//!
//! - [`stream`]: length-prefixed frames dispatched by command id
//! - [`http`]: one request/response per connection
//! - [`websocket`]: upgrade handshake, then raw byte pumping
//!
//! Stream and connected WebSocket connections share [`pump`]: read into the
//! inbound buffer until the socket would block, let the application consume
//! it, then flush whatever it queued.

pub mod frame;
pub mod http;
pub mod http_parser;
pub mod stream;
pub mod websocket;

use std::io;

use tracing::{debug, warn};

use crate::{
    buffer::GrowableBuffer,
    connection::{Connection, ConnectionState, Flush},
    error::Error,
    socket::Socket,
    task::Next,
};

/// State types with a buffer of received, not yet consumed bytes.
pub trait Inbound {
    fn inbound(&self) -> &GrowableBuffer;
}

pub(crate) fn pump<S, F>(conn: &mut Connection<S>, socket: &mut dyn Socket, mut process: F) -> Next
where
    S: ConnectionState + Inbound,
    F: FnMut(&mut Connection<S>) -> anyhow::Result<()>,
{
    let id = conn.id();
    let chunk = conn.scratch_len().max(1);
    let mut peer_closed = false;
    let mut full = false;

    loop {
        let inbound = conn.state().inbound();
        let room = inbound.available_space().min(chunk);
        if room == 0 {
            full = true;
            break;
        }
        match inbound.read_from(socket, room) {
            Ok(0) => {
                peer_closed = true;
                break;
            }
            Ok(_) => {}
            Err(e) if e.is_would_block() => break,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(conn = %id, error = %e, "receive failed");
                return Next::Close;
            }
        }
    }

    if !conn.state().inbound().is_empty() {
        if let Err(e) = process(conn) {
            warn!(conn = %id, error = %format!("{e:#}"), "application error, closing");
            return flush_then_close(conn, socket);
        }
    }
    if conn.is_closing() {
        return flush_then_close(conn, socket);
    }
    if full && conn.state().inbound().available_space() == 0 {
        let inbound = conn.state().inbound();
        let err = Error::CapacityExceeded {
            required: inbound.readable_size() + 1,
            limit: inbound.limit_max(),
        };
        warn!(conn = %id, error = %err, "inbound buffer not drained, closing");
        return Next::Close;
    }

    let had_output = conn.pending_output() > 0;
    match conn.flush(socket) {
        Flush::Blocked => return Next::Write,
        Flush::Failed(e) => {
            debug!(conn = %id, error = %e, "send failed");
            return Next::Close;
        }
        Flush::Drained => {}
    }
    if had_output {
        if let Some(Err(e)) = conn.fire_write_end() {
            warn!(conn = %id, error = %format!("{e:#}"), "write-end hook failed");
            return Next::Close;
        }
        if conn.pending_output() > 0 {
            return Next::Reschedule;
        }
    }

    if peer_closed || conn.response_end() {
        Next::Close
    } else if full {
        Next::Reschedule
    } else {
        Next::Read
    }
}

/// Hands whatever was queued before a close to the socket, without waiting
/// for write readiness; what does not fit is dropped with the connection.
fn flush_then_close<S: ConnectionState>(conn: &mut Connection<S>, socket: &mut dyn Socket) -> Next {
    match conn.flush(socket) {
        Flush::Drained => {}
        Flush::Blocked => debug!(
            conn = %conn.id(),
            pending = conn.pending_output(),
            "dropping unsent output"
        ),
        Flush::Failed(e) => debug!(conn = %conn.id(), error = %e, "send failed"),
    }
    Next::Close
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionId,
        test_util::{MockSocket, ReadStep, WriteStep},
    };

    struct Echo {
        inbound: GrowableBuffer,
    }

    impl ConnectionState for Echo {
        fn reset(&mut self) {
            self.inbound.clear();
        }
    }

    impl Inbound for Echo {
        fn inbound(&self) -> &GrowableBuffer {
            &self.inbound
        }
    }

    fn echo_conn(limit: usize) -> Connection<Echo> {
        let mut conn = Connection::new(
            4,
            1024,
            Echo {
                inbound: GrowableBuffer::new(limit),
            },
        );
        conn.attach(ConnectionId(1), false);
        conn
    }

    fn echo(conn: &mut Connection<Echo>) -> anyhow::Result<()> {
        let data = conn.state().inbound.peek_all();
        conn.state().inbound.consume(data.len())?;
        conn.send(&data)?;
        Ok(())
    }

    #[test]
    fn test_reads_until_would_block_then_flushes() {
        let mut conn = echo_conn(64);
        let mut socket = MockSocket::new().with_data(b"hello, world");
        let written = socket.written();

        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Read);
        assert_eq!(&*written.lock(), b"hello, world");
    }

    #[test]
    fn test_peer_close_flushes_first() {
        let mut conn = echo_conn(64);
        let mut socket = MockSocket::new()
            .with_data(b"bye")
            .with_read(ReadStep::Eof);
        let written = socket.written();

        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Close);
        assert_eq!(&*written.lock(), b"bye");
    }

    #[test]
    fn test_blocked_flush_waits_for_write() {
        let mut conn = echo_conn(64);
        let mut socket = MockSocket::new()
            .with_data(b"data")
            .with_write(WriteStep::WouldBlock);
        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Write);
        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Read);
    }

    #[test]
    fn test_full_buffer_reschedules_when_drained() {
        let mut conn = echo_conn(8);
        let mut socket = MockSocket::new().with_data(b"0123456789abcdef");
        let written = socket.written();

        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Reschedule);
        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Reschedule);
        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Read);
        assert_eq!(&*written.lock(), b"0123456789abcdef");
    }

    #[test]
    fn test_full_buffer_not_drained_closes() {
        let mut conn = echo_conn(8);
        let mut socket = MockSocket::new().with_data(b"0123456789");
        assert_eq!(pump(&mut conn, &mut socket, |_| Ok(())), Next::Close);
    }

    #[test]
    fn test_process_error_closes() {
        let mut conn = echo_conn(8);
        let mut socket = MockSocket::new().with_data(b"x");
        let next = pump(&mut conn, &mut socket, |_| anyhow::bail!("nope"));
        assert_eq!(next, Next::Close);
    }

    #[test]
    fn test_mark_close_from_process() {
        let mut conn = echo_conn(8);
        let mut socket = MockSocket::new().with_data(b"x");
        let next = pump(&mut conn, &mut socket, |conn| {
            conn.mark_close();
            Ok(())
        });
        assert_eq!(next, Next::Close);
    }

    #[test]
    fn test_close_flushes_replies_queued_before() {
        let mut conn = echo_conn(8);
        let mut socket = MockSocket::new().with_data(b"last");
        let written = socket.written();
        let next = pump(&mut conn, &mut socket, |conn| {
            echo(conn)?;
            anyhow::bail!("no more")
        });
        assert_eq!(next, Next::Close);
        assert_eq!(&*written.lock(), b"last");
    }

    #[test]
    fn test_close_does_not_wait_for_write() {
        let mut conn = echo_conn(8);
        let mut socket = MockSocket::new()
            .with_data(b"x")
            .with_write(WriteStep::WouldBlock);
        let written = socket.written();
        let next = pump(&mut conn, &mut socket, |conn| {
            echo(conn)?;
            conn.mark_close();
            Ok(())
        });
        assert_eq!(next, Next::Close);
        assert!(written.lock().is_empty());
    }

    #[test]
    fn test_read_error_closes() {
        let mut conn = echo_conn(8);
        let mut socket =
            MockSocket::new().with_read(ReadStep::Error(io::ErrorKind::ConnectionReset));
        assert_eq!(pump(&mut conn, &mut socket, echo), Next::Close);
    }
}
