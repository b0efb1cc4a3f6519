//! Burst-oriented packet rings and the process-wide ring registry.
//!
//! A ring is a fixed-capacity lockless queue of packet buffers. The burst
//! API preserves FIFO order only under single-producer single-consumer
//! use, which is what the driver layer guarantees (one worker per queue
//! side). Named rings are shared across the process through a registry so
//! that a device created in one place can attach to rings published in
//! another (including rings discovered inside shared-memory zones).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crossbeam_queue::ArrayQueue;

use crate::error::{MemError, Result};
use crate::mempool::PktBuf;

/// Name prefix of memory zones that hold a ring.
pub const RING_MZ_PREFIX: &str = "RG_";

/// Magic of a ring header stored at the start of a ring memory zone.
pub const RING_HDR_MAGIC: u32 = 0x52_47_48_44; // "RGHD"

/// On-zone ring descriptor, read when scanning shared-memory zones.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RingHeader {
    pub magic: u32,
    pub capacity: u32,
}

/// Lockless fixed-capacity queue of packet buffers.
pub struct PktRing {
    name: String,
    q: ArrayQueue<PktBuf>,
}

impl PktRing {
    pub fn new(name: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            q: ArrayQueue::new(capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.q.capacity()
    }

    /// Number of buffers currently queued.
    #[inline]
    pub fn count(&self) -> usize {
        self.q.len()
    }

    /// Enqueue from the front of `bufs`, stopping at the first rejection.
    ///
    /// Accepted buffers are drained out of `bufs`; rejected ones stay, in
    /// order, for the caller to retry or drop.
    pub fn enqueue_burst(&self, bufs: &mut Vec<PktBuf>) -> u16 {
        let mut sent: u16 = 0;
        let mut left = Vec::new();
        for buf in bufs.drain(..) {
            if !left.is_empty() {
                left.push(buf);
                continue;
            }
            match self.q.push(buf) {
                Ok(()) => sent += 1,
                Err(buf) => left.push(buf),
            }
        }
        *bufs = left;
        sent
    }

    /// Dequeue up to `n` buffers, appending them to `out` in FIFO order.
    pub fn dequeue_burst(&self, out: &mut Vec<PktBuf>, n: u16) -> u16 {
        let mut got: u16 = 0;
        while got < n {
            match self.q.pop() {
                Some(buf) => {
                    out.push(buf);
                    got += 1;
                }
                None => break,
            }
        }
        got
    }
}

/// Process-wide table of named rings.
///
/// Readers (ring lookup on the control path) take the lock shared; the
/// single writer (registration) takes it exclusive.
pub struct RingRegistry {
    rings: RwLock<HashMap<String, Arc<PktRing>>>,
}

impl RingRegistry {
    pub fn new() -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static RingRegistry {
        static GLOBAL: OnceLock<RingRegistry> = OnceLock::new();
        GLOBAL.get_or_init(RingRegistry::new)
    }

    /// Create and register a ring. Fails if the name is taken.
    pub fn create(&self, name: &str, capacity: usize) -> Result<Arc<PktRing>> {
        let ring = PktRing::new(name, capacity);
        self.insert(ring.clone())?;
        Ok(ring)
    }

    pub fn insert(&self, ring: Arc<PktRing>) -> Result<()> {
        let mut rings = self.rings.write().expect("ring registry poisoned");
        if rings.contains_key(ring.name()) {
            return Err(MemError::DuplicateRing(ring.name().to_string()));
        }
        rings.insert(ring.name().to_string(), ring);
        Ok(())
    }

    /// Register unless the name is taken; returns whether it was inserted.
    pub fn insert_if_absent(&self, ring: Arc<PktRing>) -> bool {
        let mut rings = self.rings.write().expect("ring registry poisoned");
        if rings.contains_key(ring.name()) {
            return false;
        }
        rings.insert(ring.name().to_string(), ring);
        true
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<PktRing>> {
        self.rings
            .read()
            .expect("ring registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<PktRing>> {
        self.rings
            .write()
            .expect("ring registry poisoned")
            .remove(name)
    }
}

impl Default for RingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{DEFAULT_BUF_SIZE, PktPool};

    fn pool(n: usize) -> Arc<PktPool> {
        Arc::new(PktPool::new("ring-test", n, DEFAULT_BUF_SIZE, 0).expect("pool"))
    }

    fn frame(pool: &Arc<PktPool>, tag: u8) -> PktBuf {
        let mut buf = pool.alloc().expect("alloc");
        buf.write_area()[0] = tag;
        buf.data_len = 1;
        buf.pkt_len = 1;
        buf
    }

    #[test]
    fn test_burst_fifo_order() {
        let p = pool(8);
        let ring = PktRing::new("r", 8);
        let mut bufs: Vec<_> = (0..5).map(|i| frame(&p, i)).collect();
        assert_eq!(ring.enqueue_burst(&mut bufs), 5);
        assert!(bufs.is_empty());
        assert_eq!(ring.count(), 5);

        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 16), 5);
        let tags: Vec<u8> = out.iter().map(|b| b.data()[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_enqueue_full_keeps_rejects() {
        let p = pool(8);
        let ring = PktRing::new("r", 2);
        let mut bufs: Vec<_> = (0..4).map(|i| frame(&p, i)).collect();
        assert_eq!(ring.enqueue_burst(&mut bufs), 2);
        // rejected buffers stay with the caller, in order
        assert_eq!(bufs.len(), 2);
        assert_eq!(bufs[0].data()[0], 2);
        assert_eq!(bufs[1].data()[0], 3);
    }

    #[test]
    fn test_registry_create_lookup() {
        let reg = RingRegistry::new();
        let r = reg.create("ETH_RXTX0_a", 16).expect("create");
        assert!(Arc::ptr_eq(&r, &reg.lookup("ETH_RXTX0_a").expect("lookup")));
        assert!(matches!(
            reg.create("ETH_RXTX0_a", 16),
            Err(MemError::DuplicateRing(_))
        ));
        assert!(reg.lookup("nope").is_none());
    }
}
