//! Packet buffer pool for the data plane.
//!
//! Pre-allocates one contiguous mmap'd region and hands out fixed-size
//! buffers through a lock-free free list. Every buffer starts with a
//! headroom at the front and carries an opaque 64-bit `userdata` word that
//! the driver layer uses to mark control packets travelling in-band.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// Headroom reserved at the front of every buffer.
pub const HEADROOM: usize = 128;

/// Default buffer size (one MTU-sized frame plus headroom).
pub const DEFAULT_BUF_SIZE: usize = 2048;

/// Fixed-size packet buffer pool.
///
/// Allocation and deallocation are lock-free. Size the pool with at least
/// one buffer of slack over the steady-state RX working set so that
/// control-packet allocation can never be starved by data traffic.
pub struct PktPool {
    name: String,
    /// Base pointer to the mmap'd region.
    base: NonNull<u8>,
    size: usize,
    buf_size: usize,
    /// Free list (lock-free queue of buffer indices).
    free: ArrayQueue<u32>,
    socket: u32,
}

// SAFETY: the region is owned by the pool and only reached through buffer
// indices handed out by the free list; ArrayQueue is thread-safe.
unsafe impl Send for PktPool {}
unsafe impl Sync for PktPool {}

impl PktPool {
    /// Create a pool of `n_bufs` buffers of `buf_size` bytes each.
    pub fn new(name: &str, n_bufs: usize, buf_size: usize, socket: u32) -> io::Result<Self> {
        if n_bufs == 0 || buf_size <= HEADROOM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pool needs at least one buffer larger than the headroom",
            ));
        }
        let size = n_bufs * buf_size;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(size).ok_or_else(|| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )?
        };

        let free = ArrayQueue::new(n_bufs);
        for i in 0..n_bufs {
            // push only fails when full, which cannot happen here
            let _ = free.push(i as u32);
        }

        tracing::debug!(
            pool = name,
            buffers = n_bufs,
            buf_size,
            "packet pool created"
        );

        Ok(Self {
            name: name.to_string(),
            base: ptr.cast(),
            size,
            buf_size,
            free,
            socket,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket(&self) -> u32 {
        self.socket
    }

    /// Per-buffer size, headroom included.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently on the free list.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Virtual range covered by the pool, for memory registration.
    pub fn virt_range(&self) -> (usize, usize) {
        (self.base.as_ptr() as usize, self.size)
    }

    /// Allocate one buffer, reset to full headroom and zero lengths.
    ///
    /// Returns `None` when the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PktBuf> {
        self.free.pop().map(|idx| PktBuf {
            pool: Arc::clone(self),
            index: idx,
            off: HEADROOM,
            data_len: 0,
            pkt_len: 0,
            userdata: 0,
        })
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index is always < n_bufs, enforced by the free list
        unsafe { self.base.as_ptr().add(index as usize * self.buf_size) }
    }

    #[inline]
    fn return_buffer(&self, index: u32) {
        let _ = self.free.push(index);
    }
}

impl Drop for PktPool {
    fn drop(&mut self) {
        // SAFETY: base/size come from mmap_anonymous in new()
        unsafe {
            let _ = munmap(self.base.cast(), self.size);
        }
    }
}

/// A packet buffer owned from a pool.
///
/// Returns itself to the pool on drop. The data area starts at `data_off`
/// within the underlying buffer; a freshly allocated buffer has
/// `data_off == HEADROOM` and zero lengths.
pub struct PktBuf {
    pool: Arc<PktPool>,
    index: u32,
    off: usize,
    /// Length of data in this segment.
    pub data_len: usize,
    /// Total frame length (equals `data_len` for single-segment frames).
    pub pkt_len: usize,
    /// Opaque side channel; the driver layer stores sentinels here.
    pub userdata: u64,
}

impl PktBuf {
    /// Base address of the underlying buffer (not the data area).
    #[inline]
    pub fn buf_addr(&self) -> *mut u8 {
        self.pool.buffer_ptr(self.index)
    }

    /// Full size of the underlying buffer.
    #[inline]
    pub fn buf_len(&self) -> usize {
        self.pool.buf_size()
    }

    /// Offset of the data area from the buffer base.
    #[inline]
    pub fn data_off(&self) -> usize {
        self.off
    }

    /// Move the data area; `off + data_len` must stay in bounds.
    #[inline]
    pub fn set_data_off(&mut self, off: usize) {
        debug_assert!(off + self.data_len <= self.buf_len());
        self.off = off;
    }

    /// Bytes available in front of the data area.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.off
    }

    /// Bytes available behind the data area.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.buf_len() - self.off - self.data_len
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: off and data_len are kept within buffer bounds
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.off);
            std::slice::from_raw_parts(ptr, self.data_len)
        }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: off and data_len are kept within buffer bounds
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.off);
            std::slice::from_raw_parts_mut(ptr, self.data_len)
        }
    }

    /// Writable slice from the data offset to the end of the buffer.
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: off is always within buffer bounds
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.off);
            std::slice::from_raw_parts_mut(ptr, self.buf_len() - self.off)
        }
    }

    /// Reset to the freshly-allocated state: full headroom, zero lengths,
    /// cleared userdata.
    #[inline]
    pub fn reset(&mut self) {
        self.off = HEADROOM;
        self.data_len = 0;
        self.pkt_len = 0;
        self.userdata = 0;
    }

    /// Pool this buffer came from.
    pub fn pool(&self) -> &Arc<PktPool> {
        &self.pool
    }
}

impl Drop for PktBuf {
    #[inline]
    fn drop(&mut self) {
        self.pool.return_buffer(self.index);
    }
}

// PktBuf is Send because Arc<PktPool> is Send + Sync and the rest is plain
// data.

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> Arc<PktPool> {
        Arc::new(PktPool::new("test", n, DEFAULT_BUF_SIZE, 0).expect("pool"))
    }

    #[test]
    fn test_alloc_and_return() {
        let p = pool(8);
        assert_eq!(p.available(), 8);
        {
            let buf = p.alloc().expect("alloc");
            assert_eq!(buf.data_off(), HEADROOM);
            assert_eq!(buf.data_len, 0);
            assert_eq!(buf.pkt_len, 0);
            assert_eq!(buf.userdata, 0);
            assert_eq!(p.available(), 7);
        }
        assert_eq!(p.available(), 8);
    }

    #[test]
    fn test_exhaustion() {
        let p = pool(4);
        let held: Vec<_> = (0..4).map(|_| p.alloc().expect("alloc")).collect();
        assert!(p.alloc().is_none());
        drop(held);
        assert_eq!(p.available(), 4);
    }

    #[test]
    fn test_write_and_read() {
        let p = pool(2);
        let mut buf = p.alloc().expect("alloc");
        buf.write_area()[..5].copy_from_slice(b"hello");
        buf.data_len = 5;
        buf.pkt_len = 5;
        assert_eq!(buf.data(), b"hello");
        assert_eq!(buf.tailroom(), DEFAULT_BUF_SIZE - HEADROOM - 5);
    }

    #[test]
    fn test_data_off_move() {
        let p = pool(2);
        let mut buf = p.alloc().expect("alloc");
        buf.set_data_off(0);
        assert_eq!(buf.headroom(), 0);
        buf.reset();
        assert_eq!(buf.headroom(), HEADROOM);
    }

    #[test]
    fn test_send_across_threads() {
        let p = pool(2);
        let mut buf = p.alloc().expect("alloc");
        buf.userdata = 0xdead_beef;
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || tx.send(buf).unwrap());
        let got = rx.recv().unwrap();
        assert_eq!(got.userdata, 0xdead_beef);
    }
}
