//! Incremental HTTP/1.x request parser.
//!
//! Bytes may arrive in any split. The head is accumulated until `httparse`
//! sees all of it (bounded by `max_head_size`); body bytes are forwarded as
//! they arrive, never buffered whole.

use crate::error::Error;

pub const MAX_HEADERS: usize = 64;
pub const DEFAULT_MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum HttpEvent<'a> {
    Request { method: &'a str, url: &'a str },
    Header { name: &'a str, value: &'a [u8] },
    HeadersComplete { upgrade: bool },
    Body(&'a [u8]),
    MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
    /// Head of an upgrade request parsed; the rest belongs to the new protocol.
    Upgraded,
}

#[derive(Debug)]
pub struct HttpParser {
    state: State,
    head: Vec<u8>,
    line: Vec<u8>,
    max_head_size: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAD_SIZE)
    }
}

impl HttpParser {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            state: State::Head,
            head: Vec::new(),
            line: Vec::new(),
            max_head_size,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Head;
        self.head.clear();
        self.line.clear();
    }

    /// A whole message (or upgrade head) has been seen.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete | State::Upgraded)
    }

    pub fn is_upgraded(&self) -> bool {
        self.state == State::Upgraded
    }

    /// Feeds the next bytes and reports what they contained.
    ///
    /// Returns how many bytes of `data` belong to this message. Anything
    /// after that (pipelined requests, bytes of an upgraded protocol) is left
    /// to the caller. Errors from `on_event` stop parsing and are returned
    /// as they are; malformed input is an [`Error::Parse`].
    pub fn feed<F>(&mut self, data: &[u8], mut on_event: F) -> anyhow::Result<usize>
    where
        F: FnMut(HttpEvent<'_>) -> anyhow::Result<()>,
    {
        let mut pos = 0;
        while pos < data.len() {
            let rest = &data[pos..];
            pos += match self.state {
                State::Head => self.feed_head(rest, &mut on_event)?,
                State::FixedBody { remaining } => {
                    let n = rest.len().min(remaining as usize);
                    on_event(HttpEvent::Body(&rest[..n]))?;
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        self.complete(&mut on_event)?;
                    } else {
                        self.state = State::FixedBody { remaining };
                    }
                    n
                }
                State::ChunkSize => {
                    let (n, line_done) = self.take_line(rest)?;
                    if line_done {
                        let size = match httparse::parse_chunk_size(&self.line) {
                            Ok(httparse::Status::Complete((_, size))) => size,
                            _ => return Err(Error::Parse("invalid chunk size".into()).into()),
                        };
                        self.line.clear();
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                    n
                }
                State::ChunkData { remaining } => {
                    let n = rest.len().min(remaining as usize);
                    on_event(HttpEvent::Body(&rest[..n]))?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    n
                }
                State::ChunkDataEnd => {
                    let (n, line_done) = self.take_line(rest)?;
                    if line_done {
                        if self.line != b"\r\n" {
                            return Err(Error::Parse("missing CRLF after chunk".into()).into());
                        }
                        self.line.clear();
                        self.state = State::ChunkSize;
                    }
                    n
                }
                State::Trailers => {
                    let (n, line_done) = self.take_line(rest)?;
                    if line_done {
                        let last = self.line == b"\r\n";
                        self.line.clear();
                        if last {
                            self.complete(&mut on_event)?;
                        }
                    }
                    n
                }
                State::Complete | State::Upgraded => break,
            };
        }
        Ok(pos)
    }

    fn complete<F>(&mut self, on_event: &mut F) -> anyhow::Result<()>
    where
        F: FnMut(HttpEvent<'_>) -> anyhow::Result<()>,
    {
        self.state = State::Complete;
        on_event(HttpEvent::MessageComplete)
    }

    /// Accumulates one CRLF-terminated line; returns bytes taken and
    /// whether the line is complete.
    fn take_line(&mut self, data: &[u8]) -> anyhow::Result<(usize, bool)> {
        let (n, done) = match data.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (data.len(), false),
        };
        self.line.extend_from_slice(&data[..n]);
        if self.line.len() > MAX_CHUNK_LINE.max(self.max_head_size) {
            return Err(Error::Parse("chunk line too long".into()).into());
        }
        Ok((n, done))
    }

    fn feed_head<F>(&mut self, data: &[u8], on_event: &mut F) -> anyhow::Result<usize>
    where
        F: FnMut(HttpEvent<'_>) -> anyhow::Result<()>,
    {
        let before = self.head.len();
        let room = self.max_head_size.saturating_sub(before);
        let take = data.len().min(room + 1);
        self.head.extend_from_slice(&data[..take]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&self.head) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if self.head.len() > self.max_head_size {
                    return Err(Error::Parse(format!(
                        "request head exceeds {} bytes",
                        self.max_head_size
                    ))
                    .into());
                }
                return Ok(take);
            }
            Err(e) => return Err(Error::Parse(e.to_string()).into()),
        };

        let method = req.method.unwrap_or_default();
        let url = req.path.unwrap_or_default();
        on_event(HttpEvent::Request { method, url })?;

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut has_upgrade = false;
        let mut connection_upgrade = false;
        for header in req.headers.iter() {
            on_event(HttpEvent::Header {
                name: header.name,
                value: header.value,
            })?;
            let value = String::from_utf8_lossy(header.value);
            if header.name.eq_ignore_ascii_case("content-length") {
                let length = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Parse(format!("invalid content-length {value:?}")))?;
                content_length = Some(length);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value
                    .split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
            } else if header.name.eq_ignore_ascii_case("upgrade") {
                has_upgrade = true;
            } else if header.name.eq_ignore_ascii_case("connection") {
                connection_upgrade = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
            }
        }
        let upgrade = has_upgrade && connection_upgrade;
        on_event(HttpEvent::HeadersComplete { upgrade })?;

        let consumed = head_len - before;
        self.head.clear();

        if upgrade {
            self.state = State::Upgraded;
            on_event(HttpEvent::MessageComplete)?;
        } else if chunked {
            self.state = State::ChunkSize;
        } else {
            match content_length {
                Some(remaining) if remaining > 0 => self.state = State::FixedBody { remaining },
                _ => self.complete(on_event)?,
            }
        }
        Ok(consumed)
    }
}
