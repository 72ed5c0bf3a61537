//! HTTP request/response task: one request per connection.

use std::mem;

use tracing::{debug, trace, warn};

use crate::{
    config::EngineConfig,
    connection::{Connection, ConnectionState, Flush, Phase},
    protocol::http_parser::{HttpEvent, HttpParser},
    socket::{self, Recv, Socket},
    task::{Next, ProtocolKind, ProtocolTask},
};

/// A parsed request. Header names keep their first spelling; lookups are
/// case-insensitive and values stay in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, Vec<String>)>,
    pub body: Vec<u8>,
    /// The head asked for a protocol upgrade.
    pub upgrade: bool,
}

impl HttpRequest {
    pub fn add_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
        {
            Some((_, values)) => values.push(value),
            None => self.headers.push((name.to_owned(), vec![value])),
        }
    }

    /// First value of `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }

    /// Records one parser event. Body chunks are left to the caller.
    pub(crate) fn apply(&mut self, event: &HttpEvent<'_>) {
        match *event {
            HttpEvent::Request { method, url } => {
                self.method = method.to_owned();
                self.url = url.to_owned();
            }
            HttpEvent::Header { name, value } => {
                self.add_header(name, String::from_utf8_lossy(value).trim().to_owned())
            }
            HttpEvent::HeadersComplete { upgrade } => self.upgrade = upgrade,
            HttpEvent::Body(_) | HttpEvent::MessageComplete => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct HttpState {
    pub(crate) parser: HttpParser,
    pub request: HttpRequest,
}

impl HttpState {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            parser: HttpParser::new(max_head_size),
            request: HttpRequest::default(),
        }
    }
}

impl ConnectionState for HttpState {
    fn reset(&mut self) {
        self.parser.reset();
        self.request = HttpRequest::default();
    }
}

pub type HttpConnection = Connection<HttpState>;

/// Application side of the HTTP task.
pub trait HttpApp: Send + Sync + 'static {
    /// Called once the whole request is in. Queue the response with
    /// [`Connection::send`]; set a write-end hook to stream more.
    fn process(&self, conn: &mut HttpConnection) -> anyhow::Result<()>;

    /// Called for every body chunk as it arrives.
    fn on_body(&self, conn: &mut HttpConnection, chunk: &[u8]) -> anyhow::Result<()> {
        conn.state_mut().request.body.extend_from_slice(chunk);
        Ok(())
    }

    fn on_connected(&self, conn: &mut HttpConnection) {
        let _ = conn;
    }

    fn on_destroy(&self, conn: &mut HttpConnection) {
        let _ = conn;
    }
}

pub struct HttpProtocol<A> {
    app: A,
}

impl<A: HttpApp> HttpProtocol<A> {
    pub fn new(app: A) -> Self {
        Self { app }
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    fn receive(&self, conn: &mut HttpConnection, socket: &mut dyn Socket) {
        let id = conn.id();
        let mut scratch = conn.take_scratch();
        let mut parser = mem::take(&mut conn.state_mut().parser);

        while !conn.recv_end() && !conn.everything_end() {
            match socket::recv(socket, &mut scratch) {
                Recv::Data(n) => {
                    if let Err(e) = self.feed(conn, &mut parser, &scratch[..n]) {
                        debug!(conn = %id, error = %format!("{e:#}"), "bad request");
                        conn.finish();
                    }
                }
                Recv::WouldBlock => break,
                Recv::Closed => conn.finish(),
                Recv::Failed(e) => {
                    debug!(conn = %id, error = %e, "receive failed");
                    conn.finish();
                }
            }
        }

        conn.state_mut().parser = parser;
        conn.restore_scratch(scratch);
    }

    fn feed(
        &self,
        conn: &mut HttpConnection,
        parser: &mut HttpParser,
        data: &[u8],
    ) -> anyhow::Result<()> {
        parser.feed(data, |event| {
            match event {
                HttpEvent::Body(chunk) => self.app.on_body(conn, chunk)?,
                HttpEvent::MessageComplete => conn.set_phase(Phase::Processing),
                ref other => conn.state_mut().request.apply(other),
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Drains queued output. `None` when the send stage is done for this
    /// tick without needing write readiness.
    fn send(&self, conn: &mut HttpConnection, socket: &mut dyn Socket) -> Option<Next> {
        let id = conn.id();
        loop {
            match conn.flush(socket) {
                Flush::Blocked => return Some(Next::Write),
                Flush::Failed(e) => {
                    debug!(conn = %id, error = %e, "send failed");
                    conn.end_response();
                    conn.finish();
                    return None;
                }
                Flush::Drained => {}
            }

            if conn.response_end() {
                conn.finish();
                return None;
            }
            match conn.fire_write_end() {
                None => {
                    conn.finish();
                    return None;
                }
                Some(Err(e)) => {
                    warn!(conn = %id, error = %format!("{e:#}"), "write-end hook failed");
                    conn.finish();
                    return None;
                }
                // more output queued, or the response just ended
                Some(Ok(())) if conn.pending_output() > 0 || conn.response_end() => {}
                // nothing to send yet; safe_send will schedule the next tick
                Some(Ok(())) => return self.watch_peer(conn, socket),
            }
        }
    }

    /// Reads while the write-end hook waits for output, so a peer that goes
    /// away is noticed. Bytes past the request are discarded.
    fn watch_peer(&self, conn: &mut HttpConnection, socket: &mut dyn Socket) -> Option<Next> {
        let id = conn.id();
        let mut scratch = conn.take_scratch();
        let next = loop {
            match socket::recv(socket, &mut scratch) {
                Recv::Data(n) => trace!(conn = %id, bytes = n, "discarding input past the request"),
                Recv::WouldBlock => break Some(Next::Read),
                Recv::Closed => {
                    debug!(conn = %id, "peer closed while the response was streaming");
                    break None;
                }
                Recv::Failed(e) => {
                    debug!(conn = %id, error = %e, "receive failed");
                    break None;
                }
            }
        };
        conn.restore_scratch(scratch);
        if next.is_none() {
            conn.finish();
        }
        next
    }
}

impl<A: HttpApp> ProtocolTask for HttpProtocol<A> {
    type State = HttpState;

    const KIND: ProtocolKind = ProtocolKind::Http;

    fn new_state(&self, config: &EngineConfig) -> HttpState {
        HttpState::new(config.max_head_size)
    }

    fn on_connected(&self, conn: &mut HttpConnection) {
        self.app.on_connected(conn);
    }

    fn on_destroy(&self, conn: &mut HttpConnection) {
        self.app.on_destroy(conn);
    }

    fn advance(&self, conn: &mut HttpConnection, socket: &mut dyn Socket) -> Next {
        if !conn.recv_end() && !conn.everything_end() {
            self.receive(conn, socket);
        }

        if conn.recv_end() && !conn.process_end() && !conn.everything_end() {
            conn.set_phase(Phase::Sending);
            if let Err(e) = self.app.process(conn) {
                warn!(conn = %conn.id(), error = %format!("{e:#}"), "request processing failed");
                conn.finish();
            }
        }

        if conn.process_end() && !conn.everything_end() {
            if let Some(next) = self.send(conn, socket) {
                return next;
            }
        }

        if conn.everything_end() {
            Next::Close
        } else if !conn.recv_end() {
            Next::Read
        } else {
            Next::Write
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionId,
        test_util::{MockSocket, ReadStep, WriteStep},
    };
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::{io, sync::Arc};

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<HttpRequest>>,
        reply: &'static [u8],
    }

    impl HttpApp for Arc<Recorder> {
        fn process(&self, conn: &mut HttpConnection) -> anyhow::Result<()> {
            self.requests.lock().push(conn.state().request.clone());
            if !self.reply.is_empty() {
                conn.send(self.reply)?;
            }
            Ok(())
        }
    }

    fn setup(reply: &'static [u8]) -> (HttpProtocol<Arc<Recorder>>, Arc<Recorder>, HttpConnection) {
        let recorder = Arc::new(Recorder {
            reply,
            ..Default::default()
        });
        let protocol = HttpProtocol::new(Arc::clone(&recorder));
        let config = EngineConfig::default();
        let mut conn = Connection::new(16, 1024, protocol.new_state(&config));
        conn.attach(ConnectionId(1), false);
        (protocol, recorder, conn)
    }

    const REQUEST: &[u8] =
        b"POST /items HTTP/1.1\r\nHost: example\r\nX-Tag: a\r\nX-Tag: b\r\nContent-Length: 5\r\n\r\nhello";

    #[rstest]
    #[case(1, 2)]
    #[case(10, 40)]
    #[case(30, 70)]
    #[case(79, 80)]
    fn test_request_split_across_three_reads(#[case] first: usize, #[case] second: usize) {
        let (protocol, recorder, mut conn) = setup(b"HTTP/1.1 200 OK\r\n\r\n");
        let mut socket = MockSocket::new()
            .with_data(&REQUEST[..first])
            .with_read(ReadStep::WouldBlock)
            .with_data(&REQUEST[first..second])
            .with_read(ReadStep::WouldBlock)
            .with_data(&REQUEST[second..]);
        let written = socket.written();

        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Read);
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Read);
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);

        let requests = recorder.requests.lock();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/items");
        assert_eq!(request.header("host"), Some("example"));
        assert_eq!(request.header_values("x-tag"), ["a", "b"]);
        assert_eq!(request.body, b"hello");
        assert_eq!(&*written.lock(), b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn test_blocked_write_resumes_at_offset() {
        let (protocol, _, mut conn) = setup(b"HTTP/1.1 204 No Content\r\n\r\n");
        let mut socket = MockSocket::new()
            .with_data(b"GET / HTTP/1.1\r\n\r\n")
            .with_write(WriteStep::Accept(4))
            .with_write(WriteStep::WouldBlock);
        let written = socket.written();

        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Write);
        assert_eq!(&*written.lock(), b"HTTP");
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert_eq!(&*written.lock(), b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn test_peer_close_before_complete() {
        let (protocol, recorder, mut conn) = setup(b"");
        let mut socket = MockSocket::new()
            .with_data(b"GET / HTT")
            .with_read(ReadStep::Eof);
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert!(recorder.requests.lock().is_empty());
    }

    #[test]
    fn test_malformed_request_closes() {
        let (protocol, recorder, mut conn) = setup(b"");
        let mut socket = MockSocket::new().with_data(b"\x00\x01\x02\r\n\r\n");
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert!(recorder.requests.lock().is_empty());
    }

    #[test]
    fn test_fatal_write_sets_response_end() {
        let (protocol, _, mut conn) = setup(b"HTTP/1.1 200 OK\r\n\r\n");
        let mut socket = MockSocket::new()
            .with_data(b"GET / HTTP/1.1\r\n\r\n")
            .with_write(WriteStep::Error(io::ErrorKind::ConnectionReset));
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert!(conn.response_end());
        assert!(conn.everything_end());
    }

    struct Streaming;

    impl HttpApp for Streaming {
        fn process(&self, conn: &mut HttpConnection) -> anyhow::Result<()> {
            conn.send(b"HTTP/1.1 200 OK\r\n\r\n")?;
            let mut parts = vec![&b"two"[..], &b"one"[..]];
            conn.set_on_write_end(move |conn| {
                match parts.pop() {
                    Some(part) => {
                        conn.send(part)?;
                    }
                    None => conn.end_response(),
                }
                Ok(())
            });
            Ok(())
        }
    }

    #[test]
    fn test_write_end_hook_streams_response() {
        let protocol = HttpProtocol::new(Streaming);
        let mut conn = Connection::new(8, 1024, protocol.new_state(&EngineConfig::default()));
        conn.attach(ConnectionId(2), false);
        let mut socket = MockSocket::new().with_data(b"GET /stream HTTP/1.1\r\n\r\n");
        let written = socket.written();

        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert_eq!(&*written.lock(), b"HTTP/1.1 200 OK\r\n\r\nonetwo");
    }

    /// Streams nothing until told to; counts how often the hook ran.
    struct Idle {
        hook_calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl HttpApp for Idle {
        fn process(&self, conn: &mut HttpConnection) -> anyhow::Result<()> {
            conn.send(b"HTTP/1.1 200 OK\r\n\r\n")?;
            let calls = Arc::clone(&self.hook_calls);
            conn.set_on_write_end(move |_| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        }
    }

    fn idle() -> (HttpProtocol<Idle>, Arc<std::sync::atomic::AtomicUsize>, HttpConnection) {
        let hook_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let protocol = HttpProtocol::new(Idle {
            hook_calls: Arc::clone(&hook_calls),
        });
        let mut conn = Connection::new(8, 1024, protocol.new_state(&EngineConfig::default()));
        conn.attach(ConnectionId(4), false);
        (protocol, hook_calls, conn)
    }

    #[test]
    fn test_peer_eof_while_hook_waits_closes() {
        let (protocol, hook_calls, mut conn) = idle();
        let mut socket = MockSocket::new()
            .with_data(b"GET / HTTP/1.1\r\n\r\n")
            .with_read(ReadStep::WouldBlock)
            .with_read(ReadStep::Eof);

        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Read);
        assert_eq!(hook_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!conn.everything_end());

        // the FIN shows up as readiness; the next tick must see it
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert!(conn.everything_end());
    }

    #[rstest]
    #[case(ReadStep::Eof)]
    #[case(ReadStep::Error(io::ErrorKind::ConnectionReset))]
    fn test_peer_gone_right_after_request(#[case] step: ReadStep) {
        let (protocol, hook_calls, mut conn) = idle();
        let mut socket = MockSocket::new()
            .with_data(b"GET / HTTP/1.1\r\n\r\n")
            .with_read(step);

        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert_eq!(hook_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_input_past_request_is_discarded() {
        let (protocol, _, mut conn) = idle();
        let mut socket = MockSocket::new()
            .with_data(b"GET / HTTP/1.1\r\n\r\n")
            .with_read(ReadStep::WouldBlock)
            .with_data(b"GET /again HTTP/1.1\r\n\r\n");
        let written = socket.written();

        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Read);
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Read);
        assert_eq!(conn.state().request.url, "/");
        assert_eq!(&*written.lock(), b"HTTP/1.1 200 OK\r\n\r\n");
    }

    struct Failing;

    impl HttpApp for Failing {
        fn process(&self, _conn: &mut HttpConnection) -> anyhow::Result<()> {
            anyhow::bail!("handler exploded")
        }
    }

    #[test]
    fn test_process_error_closes_gracefully() {
        let protocol = HttpProtocol::new(Failing);
        let mut conn = Connection::new(8, 1024, protocol.new_state(&EngineConfig::default()));
        conn.attach(ConnectionId(3), false);
        let mut socket = MockSocket::new().with_data(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(protocol.advance(&mut conn, &mut socket), Next::Close);
        assert!(conn.everything_end());
    }

    #[test]
    fn test_reset_clears_request() {
        let (protocol, _, mut conn) = setup(b"");
        let mut socket = MockSocket::new().with_data(b"GET /a HTTP/1.1\r\nA: 1\r\n\r\n");
        protocol.advance(&mut conn, &mut socket);
        assert_eq!(conn.state().request.url, "/a");

        conn.reset();
        assert_eq!(conn.state().request, HttpRequest::default());
        assert!(!conn.state().parser.is_complete());
    }
}
