use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Upper bound on idle pairs kept for reuse; extra returns are dropped.
const MAX_IDLE_PAIRS: usize = 256;

/// A read buffer and a write buffer checked out together for one handshake
#[derive(Debug)]
pub struct BufferPair {
    pub read: Vec<u8>,
    pub write: Vec<u8>,
}

/// Pool of fixed-size read/write buffer pairs backed by an async-aware mutex.
///
/// Checkout is exclusive: a pair is moved out on [`BufferPool::acquire`] and
/// moved back on [`BufferPool::release`], so no two holders can share it.
/// An empty pool allocates instead of waiting.
#[derive(Debug)]
pub struct BufferPool {
    read_size: usize,
    write_size: usize,
    idle: Mutex<Vec<BufferPair>>,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create a new buffer pool; sizes are fixed for the pool's lifetime
    pub fn new(read_size: usize, write_size: usize) -> Self {
        Self {
            read_size,
            write_size,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take an idle pair or allocate a fresh one
    pub async fn acquire(&self) -> BufferPair {
        if let Some(pair) = self.idle.lock().await.pop() {
            debug_assert_eq!(pair.read.len(), self.read_size);
            debug_assert_eq!(pair.write.len(), self.write_size);
            return pair;
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        BufferPair {
            read: vec![0u8; self.read_size],
            write: vec![0u8; self.write_size],
        }
    }

    /// Return a pair to the pool for reuse
    pub async fn release(&self, mut pair: BufferPair) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if !Self::fits(&pair.read, self.read_size) || !Self::fits(&pair.write, self.write_size) {
            return;
        }

        // Zero on return so a later borrower never sees another connection's bytes
        Self::reset(&mut pair.read, self.read_size);
        Self::reset(&mut pair.write, self.write_size);

        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_PAIRS {
            idle.push(pair);
        }
    }

    fn fits(buffer: &Vec<u8>, size: usize) -> bool {
        buffer.capacity() >= size && buffer.capacity() <= size * 2
    }

    fn reset(buffer: &mut Vec<u8>, size: usize) {
        buffer.clear();
        buffer.resize(size, 0);
    }

    /// Get statistics about the buffer pool
    pub async fn stats(&self) -> BufferPoolStats {
        let idle_pairs = self.idle.lock().await.len();
        BufferPoolStats {
            idle_pairs,
            allocated_pairs: self.allocated.load(Ordering::Relaxed),
            idle_bytes: idle_pairs * (self.read_size + self.write_size),
        }
    }
}

/// Statistics about the buffer pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub idle_pairs: usize,
    pub allocated_pairs: usize,
    pub idle_bytes: usize,
}
