//! Bounded, compacting byte buffer shared between a connection's task and
//! cross-thread senders.
//!
//! ```text
//!   0        read          write        capacity      limit_max
//!   |--------|=============|-------------|- - - - - - -|
//!    retired    readable     trailing       growth room
//! ```
//!
//! A write first tries the trailing space, then compacts the readable bytes
//! to the front, and only then grows the storage by the exact deficit. The
//! storage never grows past `limit_max` and never shrinks.

use std::{
    io::Read,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Capacity a fresh buffer starts with (capped by its limit).
pub const INITIAL_CAPACITY: usize = 10;

pub struct GrowableBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    data: Vec<u8>,
    read: usize,
    write: usize,
    limit_max: usize,
    last_read: Instant,
    last_write: Instant,
}

impl Inner {
    fn readable(&self) -> usize {
        self.write - self.read
    }

    fn trailing(&self) -> usize {
        self.data.len() - self.write
    }

    fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        self.data.copy_within(self.read..self.write, 0);
        self.write -= self.read;
        self.read = 0;
    }

    /// Makes room for `n` more bytes after `write`.
    fn reserve(&mut self, n: usize) -> Result<()> {
        if n <= self.trailing() {
            return Ok(());
        }
        self.compact();

        let trailing = self.trailing();
        if n <= trailing {
            return Ok(());
        }

        let required = self.data.len() + (n - trailing);
        if required > self.limit_max {
            return Err(Error::CapacityExceeded {
                required,
                limit: self.limit_max,
            });
        }
        self.data.resize(required, 0);
        Ok(())
    }
}

impl GrowableBuffer {
    pub fn new(limit_max: usize) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                data: vec![0; limit_max.min(INITIAL_CAPACITY)],
                read: 0,
                write: 0,
                limit_max,
                last_read: now,
                last_write: now,
            }),
        }
    }

    /// Appends all of `src`, or nothing.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Err(Error::InvalidArgument("write from an empty slice"));
        }
        let mut inner = self.inner.lock();
        inner.reserve(src.len())?;

        let start = inner.write;
        inner.data[start..start + src.len()].copy_from_slice(src);
        inner.write += src.len();
        inner.last_write = Instant::now();
        Ok(src.len())
    }

    /// Copies up to `dst.len()` readable bytes out. Returns 0 when empty.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Err(Error::InvalidArgument("read into an empty slice"));
        }
        let mut inner = self.inner.lock();
        let n = dst.len().min(inner.readable());
        let start = inner.read;
        dst[..n].copy_from_slice(&inner.data[start..start + n]);
        inner.read += n;
        inner.last_read = Instant::now();
        Ok(n)
    }

    /// Reads at most `max` bytes from `src` straight into the buffer.
    ///
    /// Room for `max` bytes is reserved with the same policy as [`write`],
    /// so this fails with `CapacityExceeded` before touching `src` if the
    /// limit does not allow it. I/O errors (including `WouldBlock`) come back
    /// as [`Error::Io`].
    ///
    /// [`write`]: GrowableBuffer::write
    pub fn read_from<R: Read + ?Sized>(&self, src: &mut R, max: usize) -> Result<usize> {
        if max == 0 {
            return Err(Error::InvalidArgument("read_from with a zero maximum"));
        }
        let mut inner = self.inner.lock();
        inner.reserve(max)?;

        let start = inner.write;
        let n = src.read(&mut inner.data[start..start + max])?;
        if n > 0 {
            inner.write += n;
            inner.last_write = Instant::now();
        }
        Ok(n)
    }

    /// Copy of every unread byte, leaving the cursors alone.
    pub fn peek_all(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        inner.data[inner.read..inner.write].to_vec()
    }

    /// Retires `n` unread bytes without copying them.
    pub fn consume(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if n > inner.readable() {
            return Err(Error::InvalidArgument("consume past the write cursor"));
        }
        inner.read += n;
        if n > 0 {
            inner.last_read = Instant::now();
        }
        Ok(())
    }

    pub fn readable_size(&self) -> usize {
        self.inner.lock().readable()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_size() == 0
    }

    /// Bytes that can still be written before hitting `limit_max`.
    pub fn available_space(&self) -> usize {
        let inner = self.inner.lock();
        inner.limit_max.saturating_sub(inner.readable())
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn limit_max(&self) -> usize {
        self.inner.lock().limit_max
    }

    /// Changes the growth ceiling. Storage already allocated is kept.
    pub fn set_limit_max(&self, limit_max: usize) {
        self.inner.lock().limit_max = limit_max;
    }

    /// Drops all unread bytes. Capacity and limit are unchanged.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.read = 0;
        inner.write = 0;
        inner.last_read = now;
        inner.last_write = now;
    }

    pub fn last_read_gap(&self) -> Duration {
        self.inner.lock().last_read.elapsed()
    }

    pub fn last_write_gap(&self) -> Duration {
        self.inner.lock().last_write.elapsed()
    }
}

impl std::fmt::Debug for GrowableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("GrowableBuffer")
            .field("readable", &inner.readable())
            .field("capacity", &inner.data.len())
            .field("limit_max", &inner.limit_max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{collections::VecDeque, io};

    fn drain(buffer: &GrowableBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = buffer.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[test]
    fn test_initial_capacity() {
        assert_eq!(GrowableBuffer::new(1024).capacity(), INITIAL_CAPACITY);
        assert_eq!(GrowableBuffer::new(4).capacity(), 4);
    }

    #[test]
    fn test_rejects_empty_arguments() {
        let buffer = GrowableBuffer::new(64);
        assert!(matches!(buffer.write(&[]), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            buffer.read(&mut []),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_grows_by_exact_deficit() {
        let buffer = GrowableBuffer::new(64);
        buffer.write(b"0123456789abc").unwrap();
        assert_eq!(buffer.capacity(), 13);
        assert_eq!(buffer.readable_size(), 13);
    }

    #[test]
    fn test_compacts_before_growing() {
        let buffer = GrowableBuffer::new(10);
        buffer.write(b"01234567").unwrap();
        let mut dst = [0u8; 6];
        assert_eq!(buffer.read(&mut dst).unwrap(), 6);

        // only 2 trailing bytes left, but compaction frees the 6 retired ones
        buffer.write(b"abcdef").unwrap();
        assert_eq!(buffer.capacity(), 10);
        assert_eq!(drain(&buffer), b"67abcdef");
    }

    #[test]
    fn test_capacity_exceeded_keeps_content() {
        let buffer = GrowableBuffer::new(12);
        buffer.write(b"hello").unwrap();
        let mut dst = [0u8; 2];
        buffer.read(&mut dst).unwrap();

        let err = buffer.write(b"0123456789").unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                required: 13,
                limit: 12
            }
        ));
        assert_eq!(drain(&buffer), b"llo");
    }

    #[test]
    fn test_clear_behaves_like_fresh_buffer() {
        let buffer = GrowableBuffer::new(32);
        buffer.write(b"some bytes that grow it").unwrap();
        let capacity = buffer.capacity();
        buffer.clear();

        assert_eq!(buffer.readable_size(), 0);
        assert_eq!(buffer.capacity(), capacity);
        let mut dst = [0u8; 4];
        assert_eq!(buffer.read(&mut dst).unwrap(), 0);
        buffer.write(b"abc").unwrap();
        assert_eq!(drain(&buffer), b"abc");
    }

    #[test]
    fn test_peek_and_consume() {
        let buffer = GrowableBuffer::new(32);
        buffer.write(b"frame-one").unwrap();
        assert_eq!(buffer.peek_all(), b"frame-one");
        buffer.consume(6).unwrap();
        assert_eq!(buffer.peek_all(), b"one");
        assert!(buffer.consume(4).is_err());
        assert_eq!(buffer.readable_size(), 3);
    }

    #[test]
    fn test_read_from_reader() {
        let buffer = GrowableBuffer::new(16);
        let mut src = io::Cursor::new(b"abcdef".to_vec());
        assert_eq!(buffer.read_from(&mut src, 4).unwrap(), 4);
        assert_eq!(buffer.read_from(&mut src, 4).unwrap(), 2);
        assert_eq!(buffer.read_from(&mut src, 4).unwrap(), 0);
        assert_eq!(buffer.peek_all(), b"abcdef");
        assert_eq!(buffer.available_space(), 10);
    }

    #[test]
    fn test_read_from_respects_limit() {
        let buffer = GrowableBuffer::new(4);
        let mut src = io::Cursor::new(b"abcdef".to_vec());
        assert!(matches!(
            buffer.read_from(&mut src, 8),
            Err(Error::CapacityExceeded { .. })
        ));
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn test_gaps_track_activity() {
        let buffer = GrowableBuffer::new(16);
        std::thread::sleep(Duration::from_millis(20));
        assert!(buffer.last_write_gap() >= Duration::from_millis(20));
        buffer.write(b"x").unwrap();
        assert!(buffer.last_write_gap() < Duration::from_millis(20));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(any::<u8>(), 1..24).prop_map(Op::Write),
            (1usize..32).prop_map(Op::Read),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip_preserves_order(ops in prop::collection::vec(op(), 1..64)) {
            let limit = 64;
            let buffer = GrowableBuffer::new(limit);
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(bytes) => {
                        let fits = model.len() + bytes.len() <= limit;
                        let result = buffer.write(&bytes);
                        if fits {
                            prop_assert_eq!(result.unwrap(), bytes.len());
                            model.extend(bytes);
                        } else {
                            let is_capacity_exceeded = matches!(result, Err(Error::CapacityExceeded { .. }));
                            prop_assert!(is_capacity_exceeded);
                        }
                    }
                    Op::Read(n) => {
                        let mut dst = vec![0u8; n];
                        let got = buffer.read(&mut dst).unwrap();
                        let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                        prop_assert_eq!(&dst[..got], &expected[..]);
                    }
                }
                prop_assert_eq!(buffer.readable_size(), model.len());
                prop_assert!(buffer.capacity() <= limit);
            }
        }
    }
}
