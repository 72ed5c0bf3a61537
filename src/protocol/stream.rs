use tracing::warn;

use crate::{
    buffer::GrowableBuffer,
    config::EngineConfig,
    connection::{Connection, ConnectionState},
    protocol::{frame::decode_frames, pump, Inbound},
    socket::Socket,
    task::{Next, ProtocolKind, ProtocolTask},
};

pub struct StreamState {
    inbound: GrowableBuffer,
}

impl StreamState {
    pub fn new(recv_limit: usize) -> Self {
        Self {
            inbound: GrowableBuffer::new(recv_limit),
        }
    }
}

impl ConnectionState for StreamState {
    fn reset(&mut self) {
        self.inbound.clear();
    }
}

impl Inbound for StreamState {
    fn inbound(&self) -> &GrowableBuffer {
        &self.inbound
    }
}

pub type StreamConnection = Connection<StreamState>;

/// Receives every decoded frame of a stream connection.
///
/// Replies go through [`Connection::send`], usually wrapped with
/// [`encode_frame`](crate::protocol::frame::encode_frame). An error closes
/// the connection: replies to earlier frames are still written if the socket
/// takes them without blocking, the rest of the input is dropped.
pub trait StreamDispatcher: Send + Sync + 'static {
    fn dispatch(&self, conn: &mut StreamConnection, cmd: u32, body: &[u8]) -> anyhow::Result<()>;

    fn on_connected(&self, conn: &mut StreamConnection) {
        let _ = conn;
    }

    fn on_destroy(&self, conn: &mut StreamConnection) {
        let _ = conn;
    }
}

pub struct StreamProtocol<D> {
    dispatcher: D,
}

impl<D: StreamDispatcher> StreamProtocol<D> {
    pub fn new(dispatcher: D) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Dispatches the complete frames buffered so far.
    fn process(&self, conn: &mut StreamConnection) -> anyhow::Result<()> {
        let data = conn.state().inbound.peek_all();
        let decoded = decode_frames(&data, |cmd, body| self.dispatcher.dispatch(conn, cmd, body));
        match decoded {
            Ok(consumed) => conn.state().inbound.consume(consumed)?,
            Err(e) => {
                warn!(conn = %conn.id(), error = %format!("{e:#}"), "dropping stream");
                conn.mark_close();
                conn.state().inbound.clear();
            }
        }
        Ok(())
    }
}

impl<D: StreamDispatcher> ProtocolTask for StreamProtocol<D> {
    type State = StreamState;

    const KIND: ProtocolKind = ProtocolKind::Stream;

    fn new_state(&self, config: &EngineConfig) -> StreamState {
        StreamState::new(config.recv_buffer_limit)
    }

    fn on_connected(&self, conn: &mut StreamConnection) {
        self.dispatcher.on_connected(conn);
    }

    fn on_destroy(&self, conn: &mut StreamConnection) {
        self.dispatcher.on_destroy(conn);
    }

    fn advance(&self, conn: &mut StreamConnection, socket: &mut dyn Socket) -> Next {
        pump(conn, socket, |conn| self.process(conn))
    }
}
