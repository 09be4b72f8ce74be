//! Packet pool module.
//!
//! A fixed-capacity arena of AX.25 packet buffers. Slots are claimed
//! lock-free off an atomic bitmap and handed out as reference-counted
//! handles; a slot returns to the freelist when the last handle drops.
//! Allocation fails fast when the pool is empty so callers can log and
//! drop instead of blocking.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use crate::ax25::{Address, Packet};

/// Default pool capacity.
pub const DEFAULT_CAPACITY: usize = 16;

/// The bitmap freelist limits the pool to one `u32` worth of slots.
const MAX_CAPACITY: usize = 32;

#[derive(Debug)]
struct PoolInner {
    /// Bit set means the slot is free.
    free: AtomicU32,
    refs: Vec<AtomicU32>,
    slots: Vec<Mutex<Packet>>,
    capacity: usize,
}

/// Fixed-capacity packet allocator.
#[derive(Debug, Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Creates a pool with `capacity` slots (at most 32).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= MAX_CAPACITY);
        let placeholder = || {
            Packet {
                source: Address::new("N0CALL", 0).unwrap(),
                destination: Address::new("N0CALL", 0).unwrap(),
                path: Vec::new(),
                info: Vec::new(),
            }
        };
        let mask = if capacity == MAX_CAPACITY {
            u32::MAX
        } else {
            (1u32 << capacity) - 1
        };
        Self {
            inner: Arc::new(PoolInner {
                free: AtomicU32::new(mask),
                refs: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
                slots: (0..capacity).map(|_| Mutex::new(placeholder())).collect(),
                capacity,
            }),
        }
    }

    /// Claims a slot for `packet`. Returns `None` immediately when the pool
    /// is exhausted.
    pub fn allocate(&self, packet: Packet) -> Option<PacketHandle> {
        let index = loop {
            let current = self.inner.free.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            let index = current.trailing_zeros();
            let claimed = current & !(1 << index);
            if self
                .inner
                .free
                .compare_exchange_weak(current, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break index as usize;
            }
        };

        let previous = self.inner.refs[index].swap(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "claimed slot had live references");

        match self.inner.slots[index].lock() {
            Ok(mut slot) => *slot = packet,
            Err(poisoned) => *poisoned.into_inner() = packet,
        }

        Some(PacketHandle {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.inner.free.load(Ordering::Relaxed).count_ones() as usize
    }

    /// Total capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Reference-counted handle to a pooled packet.
#[derive(Debug)]
pub struct PacketHandle {
    inner: Arc<PoolInner>,
    index: usize,
}

impl PacketHandle {
    /// Arena index of the underlying slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs `f` with shared access to the packet.
    pub fn with<R>(&self, f: impl FnOnce(&Packet) -> R) -> R {
        match self.inner.slots[self.index].lock() {
            Ok(slot) => f(&slot),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Runs `f` with exclusive access to the packet.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Packet) -> R) -> R {
        match self.inner.slots[self.index].lock() {
            Ok(mut slot) => f(&mut slot),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Clones the packet out of the pool.
    pub fn snapshot(&self) -> Packet {
        self.with(Packet::clone)
    }

    /// Current reference count. Diagnostic only.
    pub fn refcount(&self) -> u32 {
        self.inner.refs[self.index].load(Ordering::Relaxed)
    }
}

impl Clone for PacketHandle {
    fn clone(&self) -> Self {
        let previous = self.inner.refs[self.index].fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "cloned a handle to a freed slot");
        Self {
            inner: Arc::clone(&self.inner),
            index: self.index,
        }
    }
}

impl Drop for PacketHandle {
    fn drop(&mut self) {
        let previous = self.inner.refs[self.index].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "double free of a pooled packet");
        if previous == 1 {
            let _ = self
                .inner
                .free
                .fetch_or(1 << self.index, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::Address;

    fn packet(text: &str) -> Packet {
        Packet::new(
            Address::new("DL7AD", 12).unwrap(),
            Address::new("APECAN", 0).unwrap(),
            Vec::new(),
            text.as_bytes().to_vec(),
        )
        .unwrap()
    }

    /// Allocation fails fast once every slot is claimed, and recovers when
    /// handles drop.
    #[test]
    fn exhaustion_and_recovery() {
        let pool = PacketPool::new(4);
        let handles: Vec<_> = (0..4)
            .map(|i| pool.allocate(packet(&format!("p{i}"))).unwrap())
            .collect();
        assert_eq!(pool.available(), 0);
        assert!(pool.allocate(packet("overflow")).is_none());

        drop(handles);
        assert_eq!(pool.available(), 4);
        assert!(pool.allocate(packet("again")).is_some());
    }

    /// Cloned handles share the slot; the slot frees only when the last
    /// clone drops.
    #[test]
    fn refcount_lifecycle() {
        let pool = PacketPool::new(2);
        let handle = pool.allocate(packet("shared")).unwrap();
        assert_eq!(handle.refcount(), 1);

        let clone = handle.clone();
        assert_eq!(handle.refcount(), 2);
        assert_eq!(pool.available(), 1);

        drop(handle);
        assert_eq!(pool.available(), 1);
        assert_eq!(clone.snapshot().info, b"shared");

        drop(clone);
        assert_eq!(pool.available(), 2);
    }

    /// Distinct allocations land in distinct arena slots.
    #[test]
    fn distinct_slots() {
        let pool = PacketPool::new(4);
        let a = pool.allocate(packet("a")).unwrap();
        let b = pool.allocate(packet("b")).unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(a.snapshot().info, b"a");
        assert_eq!(b.snapshot().info, b"b");
    }

    /// Concurrent allocate/free cycles never lose slots.
    #[test]
    fn concurrent_churn() {
        let pool = PacketPool::new(8);
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        if let Some(handle) = pool.allocate(packet(&format!("{t}-{i}"))) {
                            let clone = handle.clone();
                            drop(handle);
                            drop(clone);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
    }
}
