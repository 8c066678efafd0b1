//! Per-reactor, fixed-capacity arena of connection slots.
//!
//! Wraps `slab::Slab` — the same crate the rest of this codebase already
//! depends on for connection storage — with the one property
//! `slab::Slab` doesn't give for free: a hard capacity bound. `slab::Slab`'s
//! vacant-entry list is already a LIFO free list (removing an entry makes it
//! the new free-list head; inserting pops the head), which is exactly the
//! free-stack discipline this pool needs.

use std::mem;

use mio::Token;
use slab::Slab;

use crate::connection::ConnectionContext;

/// Raised when [`ConnPool::try_insert`] or [`ConnPool::try_vacant_entry`] is
/// called at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// A reserved, not-yet-occupied slot. Its `token` is stable and known before
/// the connection it will hold has even been constructed, so a caller that
/// needs the token to register the connection's socket (mio's `Token` is
/// the slab key) can do so before calling [`VacantEntry::insert`].
pub struct VacantEntry<'a> {
    inner: slab::VacantEntry<'a, ConnectionContext>,
}

impl<'a> VacantEntry<'a> {
    /// Token this slot will be inserted under.
    pub fn token(&self) -> Token {
        Token(self.inner.key())
    }

    /// Occupies the slot, returning its id (equal to `self.token().0`).
    pub fn insert(self, ctx: ConnectionContext) -> usize {
        let key = self.inner.key();
        self.inner.insert(ctx);
        key
    }
}

/// Thread-confined arena of [`ConnectionContext`] slots. Every acquire and
/// release happens on the owning reactor's thread; the pool itself carries
/// no synchronization.
#[derive(Debug)]
pub struct ConnPool {
    slots: Slab<ConnectionContext>,
    capacity: usize,
}

impl ConnPool {
    /// Allocates room for `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        ConnPool {
            slots: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Reports the memory a pool of `capacity` slots occupies, for startup
    /// diagnostics.
    pub fn memsize(capacity: usize) -> usize {
        capacity * (mem::size_of::<ConnectionContext>() + mem::size_of::<usize>())
    }

    /// Number of live connections currently held by the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the pool currently holds no live connections.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Configured capacity of this pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquires a free slot and moves `ctx` into it, returning the slot id.
    /// Fails with [`OutOfMemory`] when the pool is already at capacity.
    pub fn try_insert(&mut self, ctx: ConnectionContext) -> Result<usize, OutOfMemory> {
        Ok(self.try_vacant_entry()?.insert(ctx))
    }

    /// Reserves a slot without occupying it, handing back its token so a
    /// caller can register a socket under that token before the connection
    /// carrying it even exists. Fails with [`OutOfMemory`] at capacity.
    pub fn try_vacant_entry(&mut self) -> Result<VacantEntry<'_>, OutOfMemory> {
        if self.slots.len() >= self.capacity {
            return Err(OutOfMemory);
        }
        Ok(VacantEntry {
            inner: self.slots.vacant_entry(),
        })
    }

    /// Borrows the connection at `id`, if still live.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut ConnectionContext> {
        self.slots.get_mut(id)
    }

    /// Releases the slot at `id` back to the free list, dropping its
    /// connection. Debug builds assert the id is currently occupied.
    pub fn release(&mut self, id: usize) {
        debug_assert!(self.slots.contains(id), "release of unknown slot {id}");
        self.slots.remove(id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnectionContext;
    use crate::pool::ThreadPool;
    use mio::net::TcpStream;
    use mio::{Poll, Waker};
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        poll: Poll,
        pool: Arc<ThreadPool>,
        waker: Arc<Waker>,
    }

    fn harness() -> Harness {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX)).unwrap());
        Harness {
            pool: ThreadPool::spawn(0),
            waker,
            poll,
        }
    }

    fn connected_connection(h: &Harness, token: Token) -> ConnectionContext {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let (tx, _rx) = crossbeam_channel::unbounded();
        ConnectionContext::new(
            token,
            TcpStream::from_std(server),
            h.poll.registry(),
            h.pool.clone(),
            tx,
            h.waker.clone(),
            Duration::from_millis(1),
            1,
        )
        .unwrap()
    }

    fn insert_one(h: &Harness, pool: &mut ConnPool) -> Result<usize, OutOfMemory> {
        let entry = pool.try_vacant_entry()?;
        let token = entry.token();
        let ctx = connected_connection(h, token);
        Ok(entry.insert(ctx))
    }

    #[test]
    fn acquire_then_release_then_acquire_reuses_same_slot() {
        let h = harness();
        let mut pool = ConnPool::new(4);
        let first = insert_one(&h, &mut pool).unwrap();
        pool.release(first);
        let second = insert_one(&h, &mut pool).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fails_out_of_memory_at_capacity() {
        let h = harness();
        let mut pool = ConnPool::new(2);
        insert_one(&h, &mut pool).unwrap();
        insert_one(&h, &mut pool).unwrap();
        assert_eq!(Err(OutOfMemory), pool.try_vacant_entry().map(|_| ()));
    }

    #[test]
    fn len_tracks_live_connections() {
        let h = harness();
        let mut pool = ConnPool::new(4);
        assert_eq!(0, pool.len());
        let id = insert_one(&h, &mut pool).unwrap();
        assert_eq!(1, pool.len());
        pool.release(id);
        assert_eq!(0, pool.len());
    }
}
