//! Thread-safe id → connection directory.
//!
//! The id → entry map is a [`lockfree::map::Map`]; every entry keeps its
//! socket and connection behind its own mutex, and the send side of the
//! connection outside of it so other threads can queue output without
//! waiting on a tick.

use std::{fmt, sync::atomic::Ordering, sync::Arc};

use lockfree::map::Map as LockfreeMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::{
    connection::{Connection, ConnectionId, ConnectionState, Shared},
    error::{Error, Result},
    socket::SocketSlot,
};

/// The socket and connection owned by one registry entry.
pub struct Slot<S> {
    pub socket: SocketSlot,
    /// `None` once teardown has taken the connection back.
    pub conn: Option<Connection<S>>,
}

pub struct Entry<S> {
    id: ConnectionId,
    shared: Arc<Shared>,
    slot: Mutex<Slot<S>>,
}

impl<S: ConnectionState> Entry<S> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn mark_close(&self) {
        self.shared.closing.store(true, Ordering::Release);
    }

    /// Locks the socket and connection. Only the connection's own worker
    /// does this during a tick, so it is normally uncontended.
    pub fn lock(&self) -> MutexGuard<'_, Slot<S>> {
        self.slot.lock()
    }

    fn safe_send(&self, data: &[u8]) -> Result<bool> {
        if self.is_closing() {
            return Ok(false);
        }
        self.shared.send.write(data)?;
        Ok(true)
    }
}

impl<S> fmt::Debug for Entry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("closing", &self.shared.closing.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct ConnectionRegistry<S> {
    entries: LockfreeMap<u64, Arc<Entry<S>>>,
}

impl<S: ConnectionState> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConnectionState> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: LockfreeMap::new(),
        }
    }

    /// Inserts a freshly accepted connection under `id`.
    ///
    /// Ids come from a single accept thread, so checking and inserting are
    /// not raced by another `add` for the same id.
    pub fn add(
        &self,
        id: ConnectionId,
        socket: SocketSlot,
        conn: Connection<S>,
    ) -> Result<Arc<Entry<S>>> {
        if !id.is_valid() {
            return Err(Error::InvalidArgument("connection id 0 is reserved"));
        }
        if self.has(id) {
            return Err(Error::DuplicateConnection(id));
        }

        let entry = Arc::new(Entry {
            id,
            shared: Arc::clone(conn.shared()),
            slot: Mutex::new(Slot {
                socket,
                conn: Some(conn),
            }),
        });
        self.entries.insert(id.as_u64(), Arc::clone(&entry));
        trace!(conn = %id, "registered connection");
        Ok(entry)
    }

    /// Removes `id`. Only the first call for an id gets the entry back.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Entry<S>>> {
        let removed = self.entries.remove(&id.as_u64())?;
        trace!(conn = %id, "removed connection");
        Some(Arc::clone(removed.val()))
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Entry<S>>> {
        self.entries
            .get(&id.as_u64())
            .map(|guard| Arc::clone(guard.val()))
    }

    pub fn has(&self, id: ConnectionId) -> bool {
        self.entries.get(&id.as_u64()).is_some()
    }

    /// Visits every entry. Entries added or removed meanwhile may or may
    /// not be seen.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Entry<S>>),
    {
        for guard in self.entries.iter() {
            f(guard.val());
        }
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .map(|guard| ConnectionId(*guard.key()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().next().is_none()
    }

    /// Flags `id` for teardown. Returns false if it is not registered.
    pub fn mark_close(&self, id: ConnectionId) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.mark_close();
                true
            }
            None => false,
        }
    }

    /// Queues `data` on the connection's send buffer from any thread.
    ///
    /// Returns `Ok(false)` when the connection is gone or closing, and
    /// `CapacityExceeded` when the send buffer is full.
    pub fn safe_send(&self, id: ConnectionId, data: &[u8]) -> Result<bool> {
        match self.get(id) {
            Some(entry) => entry.safe_send(data),
            None => Ok(false),
        }
    }
}
