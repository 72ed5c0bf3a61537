//! Scripted sockets and a recording multiplexer for unit tests.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
};

use mio::{event::Source, Interest, Registry, Token};
use parking_lot::Mutex;

use crate::{connection::ConnectionId, poll::Multiplexer, socket::Socket};

#[derive(Debug, Clone)]
pub(crate) enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Interrupted,
    Eof,
    Error(io::ErrorKind),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteStep {
    /// Accept at most this many bytes.
    Accept(usize),
    WouldBlock,
    Error(io::ErrorKind),
}

/// A socket that replays scripted reads and records what was written.
///
/// An exhausted read script reports `WouldBlock`; an exhausted write script
/// accepts everything.
#[derive(Default)]
pub(crate) struct MockSocket {
    reads: VecDeque<ReadStep>,
    writes: VecDeque<WriteStep>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl MockSocket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_read(mut self, step: ReadStep) -> Self {
        self.reads.push_back(step);
        self
    }

    pub(crate) fn with_data(self, data: &[u8]) -> Self {
        self.with_read(ReadStep::Data(data.to_vec()))
    }

    pub(crate) fn with_write(mut self, step: WriteStep) -> Self {
        self.writes.push_back(step);
        self
    }

    /// Handle on everything written so far, usable after the socket moved.
    pub(crate) fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

impl Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Error(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.writes.pop_front() {
            None => buf.len(),
            Some(WriteStep::Accept(max)) => buf.len().min(max),
            Some(WriteStep::WouldBlock) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(WriteStep::Error(kind)) => return Err(kind.into()),
        };
        self.written.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for MockSocket {
    fn register(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(
        &mut self,
        _registry: &Registry,
        _token: Token,
        _interests: Interest,
    ) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuxCall {
    Register(ConnectionId, Interest),
    Rearm(ConnectionId, Interest),
    Deregister(ConnectionId),
}

/// Multiplexer that only records what the engine asked of it.
#[derive(Default)]
pub(crate) struct RecordingMux {
    calls: Mutex<Vec<MuxCall>>,
}

impl RecordingMux {
    pub(crate) fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn last_rearm(&self, id: ConnectionId) -> Option<Interest> {
        self.calls.lock().iter().rev().find_map(|call| match *call {
            MuxCall::Rearm(rearmed, interest) if rearmed == id => Some(interest),
            _ => None,
        })
    }
}

impl Multiplexer for RecordingMux {
    fn register(&self, id: ConnectionId, _socket: &mut dyn Socket, interest: Interest) -> io::Result<()> {
        self.calls.lock().push(MuxCall::Register(id, interest));
        Ok(())
    }

    fn rearm(&self, id: ConnectionId, _socket: &mut dyn Socket, interest: Interest) -> io::Result<()> {
        self.calls.lock().push(MuxCall::Rearm(id, interest));
        Ok(())
    }

    fn deregister(&self, id: ConnectionId, _socket: &mut dyn Socket) -> io::Result<()> {
        self.calls.lock().push(MuxCall::Deregister(id));
        Ok(())
    }
}
