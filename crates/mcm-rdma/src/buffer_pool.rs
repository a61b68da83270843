//! Fixed-size, page-aligned buffer pool: one block
//! allocated up front and carved into `queue_size` slots of `trx_sz +
//! TRAILER` bytes each. The trailing 8 bytes of every slot carry the
//! sequence number RDMA completions use to reassemble frames in order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use mcm_core::{Context, McmError, Result};

/// Bytes reserved at the tail of every slot for the sequence counter.
pub const TRAILER_LEN: usize = 8;
const PAGE_SIZE: usize = 4096;

struct Inner {
    slots: Mutex<Vec<u8>>,
    free: Mutex<VecDeque<usize>>,
    available: Condvar,
    slot_len: usize,
    payload_len: usize,
}

/// Owns the pool's single backing allocation. Cheap to clone (`Arc`
/// inside); every `Arc<BufferPool>` clone shares the same slots.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// `payload_len` is the usable frame size; each slot is rounded up to a
    /// page multiple once the trailer is added, matching the donor's
    /// single-`mmap`-style allocation.
    pub fn new(payload_len: usize, queue_size: usize) -> Self {
        let slot_len = page_align(payload_len + TRAILER_LEN);
        let mut free = VecDeque::with_capacity(queue_size);
        for i in 0..queue_size {
            free.push_back(i);
        }
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(vec![0u8; slot_len * queue_size]),
                free: Mutex::new(free),
                available: Condvar::new(),
                slot_len,
                payload_len,
            }),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.inner.payload_len
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.lock().len() / self.inner.slot_len
    }

    /// Raw pointer and length covering the pool's whole backing allocation,
    /// for a single memory-region registration per endpoint: the whole
    /// region is registered once per endpoint, never once per slot. Valid
    /// for as long as this `BufferPool` (and any clone sharing its `Arc`)
    /// is alive.
    pub fn region(&self) -> (*mut u8, usize) {
        let mut slots = self.inner.slots.lock();
        (slots.as_mut_ptr(), slots.len())
    }

    /// Blocks until a slot frees up, the context cancels, or (with
    /// `try_acquire`) immediately. Returns `McmError::NoBuffer` on
    /// cancellation so callers can distinguish it from a real I/O failure.
    pub fn acquire(&self, ctx: &Context) -> Result<Buffer> {
        const POLL: Duration = Duration::from_millis(10);
        let mut free = self.inner.free.lock();
        loop {
            if let Some(index) = free.pop_front() {
                return Ok(Buffer {
                    pool: self.inner.clone(),
                    index,
                    len: 0,
                });
            }
            if ctx.cancelled() {
                return Err(McmError::NoBuffer {
                    context: "buffer_pool.acquire",
                });
            }
            self.inner.available.wait_for(&mut free, POLL);
        }
    }

    /// Non-blocking variant used by the CQ reactor, which must never stall
    /// waiting on application-side buffer reuse.
    pub fn try_acquire(&self) -> Option<Buffer> {
        let index = self.inner.free.lock().pop_front()?;
        Some(Buffer {
            pool: self.inner.clone(),
            index,
            len: 0,
        })
    }
}

fn page_align(n: usize) -> usize {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// A leased slot. Returns itself to the pool's free list on drop, so
/// callers never need an explicit release call.
pub struct Buffer {
    pool: Arc<Inner>,
    index: usize,
    len: usize,
}

impl Buffer {
    fn offset(&self) -> usize {
        self.index * self.pool.slot_len
    }

    pub fn capacity(&self) -> usize {
        self.pool.payload_len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` into the slot's payload region and records its length.
    /// Fails if `data` exceeds the slot's payload capacity.
    pub fn fill(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.pool.payload_len {
            return Err(McmError::bad_argument("buffer.fill"));
        }
        let offset = self.offset();
        let mut slots = self.pool.slots.lock();
        slots[offset..offset + data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    pub fn payload(&self) -> Vec<u8> {
        let offset = self.offset();
        self.pool.slots.lock()[offset..offset + self.len].to_vec()
    }

    /// Reads the full fixed-size payload region regardless of `len` — used
    /// on the receive side, where a slot is posted empty and filled by the
    /// peer rather than by `fill`.
    pub fn read_payload(&self) -> Vec<u8> {
        let offset = self.offset();
        self.pool.slots.lock()[offset..offset + self.pool.payload_len].to_vec()
    }

    /// Raw pointer and length to the slot's payload region, for handing
    /// off to the endpoint's post-send/post-recv call. Valid only while
    /// this `Buffer` is alive.
    pub fn as_raw_parts(&self) -> (*mut u8, usize) {
        let offset = self.offset();
        let mut slots = self.pool.slots.lock();
        (slots.as_mut_ptr().wrapping_add(offset), self.pool.slot_len)
    }

    /// Identity used as the RDMA operation context tag (`buf_ctx`): the
    /// slot's own address, stable for the buffer's lifetime.
    pub fn tag(&self) -> u64 {
        let offset = self.offset();
        let base = self.pool.slots.lock().as_ptr() as u64;
        base + offset as u64
    }

    /// Bytes actually carried over the wire: the payload plus the 8-byte
    /// sequence trailer.
    pub fn wire_len(&self) -> usize {
        self.pool.payload_len + TRAILER_LEN
    }

    /// Snapshot of payload + trailer, for handing to a send call that takes
    /// an owned/borrowed slice rather than a raw pointer.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let offset = self.offset();
        self.pool.slots.lock()[offset..offset + self.wire_len()].to_vec()
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.pool.payload_len);
        self.len = len;
    }

    pub fn set_sequence(&mut self, seq: u64) {
        let offset = self.offset() + self.pool.payload_len;
        let mut slots = self.pool.slots.lock();
        slots[offset..offset + TRAILER_LEN].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn sequence(&self) -> u64 {
        let offset = self.offset() + self.pool.payload_len;
        let slots = self.pool.slots.lock();
        u64::from_be_bytes(slots[offset..offset + TRAILER_LEN].try_into().unwrap())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.free.lock().push_back(self.index);
        self.pool.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trips() {
        let pool = BufferPool::new(1024, 4);
        assert_eq!(pool.capacity(), 4);
        let ctx = Context::background();
        let mut buf = pool.acquire(&ctx).unwrap();
        buf.fill(b"payload").unwrap();
        buf.set_sequence(42);
        assert_eq!(buf.payload(), b"payload");
        assert_eq!(buf.sequence(), 42);
        drop(buf);
        assert_eq!(pool.try_acquire().is_some(), true);
    }

    #[test]
    fn acquire_blocks_when_exhausted_then_unblocks_on_release() {
        let pool = BufferPool::new(64, 1);
        let ctx = Context::background();
        let held = pool.acquire(&ctx).unwrap();
        assert!(pool.try_acquire().is_none());

        let pool2 = pool.clone();
        let ctx2 = ctx.clone();
        let handle = std::thread::spawn(move || pool2.acquire(&ctx2).is_ok());
        std::thread::sleep(Duration::from_millis(30));
        drop(held);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn acquire_returns_no_buffer_on_cancel() {
        let pool = BufferPool::new(64, 1);
        let _held = pool.acquire(&Context::background()).unwrap();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = pool.acquire(&ctx).unwrap_err();
        assert!(matches!(err, McmError::NoBuffer { .. }));
    }

    #[test]
    fn fill_rejects_oversized_payload() {
        let pool = BufferPool::new(4, 1);
        let mut buf = pool.acquire(&Context::background()).unwrap();
        let err = buf.fill(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, McmError::BadArgument { .. }));
    }
}
