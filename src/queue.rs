//! # Concurrent Slot-Ring Queue
//!
//! An unbounded multi-producer/multi-consumer FIFO built on a circular
//! buffer of individually locked slots. Producers and consumers reserve a
//! position under a short-held index mutex, then complete the data
//! transfer against the slot itself, so reservation and transfer never
//! serialise behind one another.
//!
//! Two locks cooperate:
//!
//! - the **index mutex** guards `head`/`tail`/`capacity` and is held only
//!   long enough to reserve a slot (or to grow the buffer);
//! - the **buffer lock** (reader/writer) guards the buffer identity:
//!   every push/pop holds it shared across its slot handshake, and growth
//!   takes it exclusive to reallocate without invalidating reservations.
//!
//! Producer-local FIFO order is preserved: two pushes by one producer are
//! observed in push order by any single consumer, regardless of other
//! producers.

use parking_lot::{Mutex, RwLock};

/// Initial capacity used by [`AtomicQueue::default`].
pub const DEFAULT_CAPACITY: usize = 64;

struct Slot<T> {
    /// `None` means the slot is free for a push; `Some` means a value is
    /// committed and ready for a pop.
    cell: Mutex<Option<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Slot {
            cell: Mutex::new(None),
        }
    }
}

struct IndexState {
    head: usize,
    tail: usize,
    capacity: usize,
}

/// Unbounded MPMC FIFO queue of `T`.
pub struct AtomicQueue<T> {
    slots: RwLock<Vec<Slot<T>>>,
    index: Mutex<IndexState>,
}

impl<T> AtomicQueue<T> {
    /// Create a queue with the given initial capacity (minimum 2; one
    /// slot is always kept free to distinguish full from empty).
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.max(2);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);
        AtomicQueue {
            slots: RwLock::new(slots),
            index: Mutex::new(IndexState {
                head: 0,
                tail: 0,
                capacity,
            }),
        }
    }

    /// Append a value at the tail.
    ///
    /// Never fails and never blocks on consumers; if the ring is full the
    /// buffer is doubled first.
    pub fn push(&self, value: T) {
        let (pos, slots) = {
            let mut idx = self.index.lock();
            if (idx.tail + 1) % idx.capacity == idx.head {
                self.grow(&mut idx);
            }
            let pos = idx.tail;
            idx.tail = (idx.tail + 1) % idx.capacity;
            // The shared buffer lock must be taken before the index mutex
            // is released: growth re-bases positions, and a reservation
            // outstanding without the shared lock could be moved under us.
            let slots = self.slots.read();
            (pos, slots)
        };

        let mut pending = Some(value);
        loop {
            {
                let mut cell = slots[pos].cell.lock();
                if cell.is_none() {
                    // A pop that previously reserved this slot has
                    // finished; the position is ours.
                    *cell = pending.take();
                    return;
                }
            }
            std::thread::yield_now();
        }
    }

    /// Remove and return the value at the head, or `None` when the queue
    /// is empty at reservation time.
    pub fn try_pop(&self) -> Option<T> {
        let (pos, slots) = {
            let mut idx = self.index.lock();
            if idx.head == idx.tail {
                return None;
            }
            let pos = idx.head;
            idx.head = (idx.head + 1) % idx.capacity;
            let slots = self.slots.read();
            (pos, slots)
        };

        loop {
            {
                let mut cell = slots[pos].cell.lock();
                if cell.is_some() {
                    return cell.take();
                }
                // The push that reserved this slot has not committed yet.
            }
            std::thread::yield_now();
        }
    }

    /// Number of reserved (pushed or in-flight) elements.
    pub fn len(&self) -> usize {
        let idx = self.index.lock();
        (idx.tail + idx.capacity - idx.head) % idx.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current ring capacity.
    pub fn capacity(&self) -> usize {
        self.index.lock().capacity
    }

    /// Drop every element and reset the indices.
    ///
    /// Takes the buffer lock exclusively, so it is safe against idle
    /// concurrent users, but values being pushed concurrently may be
    /// lost or survive; callers are expected to be quiescent.
    pub fn clear(&self) {
        let mut idx = self.index.lock();
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            *slot.cell.get_mut() = None;
        }
        idx.head = 0;
        idx.tail = 0;
    }

    /// Double the buffer, moving the logical contents to the front.
    ///
    /// Called with the index mutex held; takes the buffer lock exclusive,
    /// which waits out every in-flight slot handshake (each holds the
    /// shared lock from reservation to commit).
    fn grow(&self, idx: &mut IndexState) {
        let mut slots = self.slots.write();
        let old_capacity = idx.capacity;
        let mut grown: Vec<Slot<T>> = Vec::with_capacity(old_capacity * 2);
        for logical in 0..old_capacity {
            let value = slots[(idx.head + logical) % old_capacity].cell.get_mut().take();
            grown.push(Slot {
                cell: Mutex::new(value),
            });
        }
        grown.resize_with(old_capacity * 2, Slot::empty);
        *slots = grown;
        idx.head = 0;
        idx.tail = old_capacity - 1;
        idx.capacity = old_capacity * 2;
    }
}

impl<T> Default for AtomicQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_single_producer() {
        let queue = AtomicQueue::new(4);
        for i in 0..100 {
            queue.push(i);
        }
        for i in 0..100 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn growth_preserves_order_and_doubles() {
        let queue = AtomicQueue::new(2);
        for i in 0..10 {
            queue.push(i);
        }
        // 2 -> 4 -> 8 -> 16 while absorbing ten elements.
        assert_eq!(queue.capacity(), 16);
        assert_eq!(queue.len(), 10);
        for i in 0..10 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn wraparound_interleaved() {
        let queue = AtomicQueue::new(4);
        for round in 0..50 {
            queue.push(round * 2);
            queue.push(round * 2 + 1);
            assert_eq!(queue.try_pop(), Some(round * 2));
            assert_eq!(queue.try_pop(), Some(round * 2 + 1));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn clear_resets_everything() {
        let queue = AtomicQueue::new(2);
        for i in 0..5 {
            queue.push(i);
        }
        queue.clear();
        assert!(queue.is_empty());
        queue.push(42);
        assert_eq!(queue.try_pop(), Some(42));
    }

    #[test]
    fn per_producer_order_survives_contention() {
        let queue = Arc::new(AtomicQueue::new(2));
        let producers: u32 = 4;
        let per_producer: u32 = 500;

        let handles: Vec<_> = (0..producers)
            .map(|id| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for seq in 0..per_producer {
                        queue.push((id, seq));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last_seq = vec![None; producers as usize];
        let mut drained = 0;
        while let Some((id, seq)) = queue.try_pop() {
            let last = &mut last_seq[id as usize];
            if let Some(prev) = *last {
                assert!(seq > prev, "producer {id} reordered: {seq} after {prev}");
            }
            *last = Some(seq);
            drained += 1;
        }
        assert_eq!(drained, producers * per_producer);
    }
}
