//! WebSocket upgrade handshake, then raw byte pumping.
//!
//! Frames are not decoded here: once connected, the application sees the
//! raw inbound bytes and queues raw outbound bytes.

use std::mem;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::{
    buffer::GrowableBuffer,
    config::EngineConfig,
    connection::{Connection, ConnectionState, Phase},
    error::Error,
    protocol::{
        http::HttpRequest,
        http_parser::{HttpEvent, HttpParser},
        pump, Inbound,
    },
    socket::{self, Recv, Socket},
    task::{Next, ProtocolKind, ProtocolTask},
};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_VERSION: &str = "13";

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug)]
pub struct WebSocketState {
    parser: HttpParser,
    pub request: HttpRequest,
    pub sec_websocket_key: Option<String>,
    pub sec_websocket_version: Option<String>,
    pub is_upgrade: bool,
    /// The upgrade request has been read.
    pub http_processed: bool,
    pub connected: bool,
    inbound: GrowableBuffer,
}

impl WebSocketState {
    pub fn new(max_head_size: usize, recv_limit: usize) -> Self {
        Self {
            parser: HttpParser::new(max_head_size),
            request: HttpRequest::default(),
            sec_websocket_key: None,
            sec_websocket_version: None,
            is_upgrade: false,
            http_processed: false,
            connected: false,
            inbound: GrowableBuffer::new(recv_limit),
        }
    }
}

impl ConnectionState for WebSocketState {
    fn reset(&mut self) {
        self.parser.reset();
        self.request = HttpRequest::default();
        self.sec_websocket_key = None;
        self.sec_websocket_version = None;
        self.is_upgrade = false;
        self.http_processed = false;
        self.connected = false;
        self.inbound.clear();
    }
}

impl Inbound for WebSocketState {
    fn inbound(&self) -> &GrowableBuffer {
        &self.inbound
    }
}

pub type WebSocketConnection = Connection<WebSocketState>;

pub trait WebSocketApp: Send + Sync + 'static {
    /// Called whenever new bytes are buffered. Consume what was handled
    /// from the inbound buffer and queue replies with [`Connection::send`].
    fn process(&self, conn: &mut WebSocketConnection) -> anyhow::Result<()>;

    fn on_connected(&self, conn: &mut WebSocketConnection) {
        let _ = conn;
    }

    fn on_destroy(&self, conn: &mut WebSocketConnection) {
        let _ = conn;
    }
}

pub struct WebSocketProtocol<A> {
    app: A,
}

impl<A: WebSocketApp> WebSocketProtocol<A> {
    pub fn new(app: A) -> Self {
        Self { app }
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    /// Reads the upgrade request. Bytes after its head go to the inbound
    /// buffer; they already belong to the WebSocket stream.
    fn receive_upgrade(&self, conn: &mut WebSocketConnection, socket: &mut dyn Socket) {
        let id = conn.id();
        let mut scratch = conn.take_scratch();
        let mut parser = mem::take(&mut conn.state_mut().parser);

        while !conn.state().http_processed && !conn.everything_end() {
            match socket::recv(socket, &mut scratch) {
                Recv::Data(n) => {
                    let data = &scratch[..n];
                    match Self::feed(conn, &mut parser, data) {
                        Ok(consumed) if consumed < n && conn.state().http_processed => {
                            if let Err(e) = conn.state().inbound.write(&data[consumed..]) {
                                debug!(conn = %id, error = %e, "early frame bytes dropped");
                                conn.finish();
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(conn = %id, error = %format!("{e:#}"), "bad upgrade request");
                            conn.finish();
                        }
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
        conn: &mut WebSocketConnection,
        parser: &mut HttpParser,
        data: &[u8],
    ) -> anyhow::Result<usize> {
        parser.feed(data, |event| {
            let state = conn.state_mut();
            match event {
                HttpEvent::Request { method, .. } if method != "GET" => {
                    return Err(Error::ProtocolViolation(format!(
                        "websocket upgrade with method {method}"
                    ))
                    .into());
                }
                HttpEvent::Body(_) => {
                    return Err(Error::ProtocolViolation("websocket upgrade with a body".into()).into())
                }
                HttpEvent::HeadersComplete { upgrade } => state.is_upgrade = upgrade,
                HttpEvent::MessageComplete => state.http_processed = true,
                ref other => state.request.apply(other),
            }
            Ok(())
        })
    }

    /// Validates the upgrade headers and queues the 101 response.
    fn handshake(&self, conn: &mut WebSocketConnection) -> crate::error::Result<()> {
        let state = conn.state_mut();
        if !state.is_upgrade {
            return Err(Error::ProtocolViolation("not an upgrade request".into()));
        }
        state.sec_websocket_key = state.request.header("Sec-WebSocket-Key").map(str::to_owned);
        state.sec_websocket_version = state
            .request
            .header("Sec-WebSocket-Version")
            .map(str::to_owned);

        let key = match state.sec_websocket_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => return Err(Error::ProtocolViolation("missing Sec-WebSocket-Key".into())),
        };
        if state.sec_websocket_version.as_deref() != Some(WEBSOCKET_VERSION) {
            return Err(Error::ProtocolViolation(format!(
                "unsupported Sec-WebSocket-Version {:?}",
                state.sec_websocket_version
            )));
        }

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        state.connected = true;
        conn.send(response.as_bytes())?;
        Ok(())
    }
}

impl<A: WebSocketApp> ProtocolTask for WebSocketProtocol<A> {
    type State = WebSocketState;

    const KIND: ProtocolKind = ProtocolKind::WebSocket;

    fn new_state(&self, config: &EngineConfig) -> WebSocketState {
        WebSocketState::new(config.max_head_size, config.recv_buffer_limit)
    }

    fn on_destroy(&self, conn: &mut WebSocketConnection) {
        self.app.on_destroy(conn);
    }

    fn advance(&self, conn: &mut WebSocketConnection, socket: &mut dyn Socket) -> Next {
        if !conn.state().connected {
            if !conn.state().http_processed {
                self.receive_upgrade(conn, socket);
                if conn.everything_end() {
                    return Next::Close;
                }
                if !conn.state().http_processed {
                    return Next::Read;
                }
            }

            if let Err(e) = self.handshake(conn) {
                debug!(conn = %conn.id(), error = %e, "websocket handshake rejected");
                conn.finish();
                return Next::Close;
            }
            conn.set_phase(Phase::Processing);
            trace!(conn = %conn.id(), url = %conn.state().request.url, "websocket connected");
            self.app.on_connected(conn);
        }

        pump(conn, socket, |conn| self.app.process(conn))
    }
}
