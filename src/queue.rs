//! Lock-free single-producer/multi-consumer ring buffer.
//!
//! The ring is split at construction into exactly one [`Producer`] and a cloneable [`Consumer`],
//! so the single-producer rule is enforced by the type system instead of by convention.
//!
//! # Algorithm
//!
//! Two free-running cursors are kept: `producer` (next position to write) and `consumer` (next
//! position to claim). Both only ever grow and are compared with wrapping arithmetic, a slot is
//! addressed by `cursor & (capacity - 1)`.
//!
//! - empty: `producer == consumer`
//! - full: `producer - consumer >= capacity`
//!
//! Consumers race for a position with a compare-and-swap on `consumer`; the loser re-reads both
//! cursors and tries again. Every slot additionally carries a stamp that tells the producer
//! whether the previous occupant was completely read by the consumer that claimed it, so a slot
//! is never overwritten while a successful claimer is still copying it out.
use std::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity {0} must be a non-zero power of two")]
    Capacity(usize),
}

/// Returned by a failed push, carries the rejected item back to the caller.
#[derive(PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

struct Slot<T> {
    /// `pos` while free for the write at `pos`, `pos + 1` once that write is published.
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct RingQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    producer: AtomicUsize,
    consumer: AtomicUsize,
}

// Safety: slot contents are only accessed by the producer before publication and by the one
// consumer whose CAS claimed the position afterwards.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let consumer = self.consumer.load(Ordering::Acquire);
        let producer = self.producer.load(Ordering::Acquire);
        producer.wrapping_sub(consumer).min(self.capacity())
    }

    fn slot(&self, pos: usize) -> &Slot<T> {
        &self.slots[pos & self.mask]
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        let mut pos = *self.consumer.get_mut();
        let end = *self.producer.get_mut();
        while pos != end {
            let slot = &mut self.slots[pos & self.mask];
            // Safety: positions in consumer..producer hold published, unclaimed values.
            unsafe { slot.value.get_mut().assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

/// Creates a ring of `capacity` slots and splits it into its two halves.
pub fn ring_queue<T>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(QueueError::Capacity(capacity));
    }

    let slots = (0..capacity)
        .map(|i| Slot {
            stamp: AtomicUsize::new(i),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        })
        .collect();

    let ring = Arc::new(RingQueue {
        slots,
        mask: capacity - 1,
        producer: AtomicUsize::new(0),
        consumer: AtomicUsize::new(0),
    });

    Ok((
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    ))
}

/// Writing half of a ring. There is exactly one per ring.
pub struct Producer<T> {
    ring: Arc<RingQueue<T>>,
}

impl<T> Producer<T> {
    /// Enqueues `item`, or hands it back if the ring is full. Never drops.
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        let ring = &*self.ring;
        let pos = ring.producer.load(Ordering::Relaxed);
        let consumer = ring.consumer.load(Ordering::Acquire);

        if pos.wrapping_sub(consumer) >= ring.capacity() {
            return Err(Full(item));
        }

        let slot = ring.slot(pos);
        if slot.stamp.load(Ordering::Acquire) != pos {
            // claimed but not read out yet
            return Err(Full(item));
        }

        // Safety: the stamp proves no consumer owns this slot.
        unsafe { (*slot.value.get()).write(item) };
        slot.stamp.store(pos.wrapping_add(1), Ordering::Release);
        ring.producer.store(pos.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Enqueues every item of `items` or none of them. On success `items` is left empty and all
    /// entries become visible to consumers at once.
    pub fn push_batch(&mut self, items: &mut Vec<T>) -> Result<(), Full<()>> {
        let ring = &*self.ring;
        let count = items.len();
        if count == 0 {
            return Ok(());
        }

        let pos = ring.producer.load(Ordering::Relaxed);
        let consumer = ring.consumer.load(Ordering::Acquire);
        let used = pos.wrapping_sub(consumer);

        if count > ring.capacity().saturating_sub(used) {
            return Err(Full(()));
        }

        let target = |i: usize| pos.wrapping_add(i);
        if (0..count).any(|i| ring.slot(target(i)).stamp.load(Ordering::Acquire) != target(i)) {
            return Err(Full(()));
        }

        for (i, item) in items.drain(..).enumerate() {
            let slot = ring.slot(target(i));
            // Safety: checked free above and consumers can not reach it before publication.
            unsafe { (*slot.value.get()).write(item) };
            slot.stamp.store(target(i).wrapping_add(1), Ordering::Release);
        }
        ring.producer.store(target(count), Ordering::Release);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Reading half of a ring. Clone it to add consumers.
pub struct Consumer<T> {
    ring: Arc<RingQueue<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T> Consumer<T> {
    /// Dequeues the oldest unclaimed item. The first consumer to win the CAS gets it.
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        loop {
            let pos = ring.consumer.load(Ordering::Acquire);
            let producer = ring.producer.load(Ordering::Acquire);

            if pos == producer {
                return None;
            }

            if ring
                .consumer
                .compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            let slot = ring.slot(pos);
            debug_assert_eq!(slot.stamp.load(Ordering::Acquire), pos.wrapping_add(1));

            // Safety: the successful CAS makes this the only reader of the published value.
            let item = unsafe { (*slot.value.get()).assume_init_read() };
            slot.stamp
                .store(pos.wrapping_add(ring.capacity()), Ordering::Release);

            return Some(item);
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Mutex, atomic::AtomicBool},
        thread,
    };

    use super::*;

    #[test]
    fn capacity_must_be_power_of_two() {
        assert!(matches!(ring_queue::<u32>(0), Err(QueueError::Capacity(0))));
        assert!(matches!(ring_queue::<u32>(6), Err(QueueError::Capacity(6))));
        assert!(ring_queue::<u32>(8).is_ok());
    }

    #[test]
    fn fifo_and_full() {
        let (mut tx, rx) = ring_queue(4).unwrap();

        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert!(tx.is_full());
        assert_eq!(tx.push(4), Err(Full(4)));

        assert_eq!(rx.pop(), Some(0));
        assert_eq!(rx.pop(), Some(1));
        tx.push(4).unwrap();

        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), Some(4));
        assert_eq!(rx.pop(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn cursors_wrap_around() {
        let (mut tx, rx) = ring_queue(2).unwrap();
        for i in 0..10_000u32 {
            tx.push(i).unwrap();
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.len(), 0);
    }

    #[test]
    fn batch_push_is_all_or_nothing() {
        let (mut tx, rx) = ring_queue(4).unwrap();
        tx.push(0).unwrap();
        tx.push(1).unwrap();

        let mut batch = vec![2, 3, 4];
        assert_eq!(tx.push_batch(&mut batch), Err(Full(())));
        assert_eq!(batch, vec![2, 3, 4]);
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.pop(), Some(0));
        tx.push_batch(&mut batch).unwrap();
        assert!(batch.is_empty());

        let drained: Vec<_> = std::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    #[test]
    fn remaining_items_are_dropped_with_the_ring() {
        let marker = Arc::new(());
        {
            let (mut tx, rx) = ring_queue(4).unwrap();
            tx.push(Arc::clone(&marker)).unwrap();
            tx.push(Arc::clone(&marker)).unwrap();
            drop(rx.pop());
            assert_eq!(Arc::strong_count(&marker), 2);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn one_producer_many_consumers_lose_nothing() {
        const ITEMS: usize = 100_000;
        const CONSUMERS: usize = 4;

        let (mut tx, rx) = ring_queue::<usize>(64).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::with_capacity(ITEMS)));

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let rx = rx.clone();
                let done = Arc::clone(&done);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    let mut local = Vec::new();
                    loop {
                        match rx.pop() {
                            Some(item) => {
                                // per consumer, items arrive in push order
                                if let Some(last) = local.last() {
                                    assert!(item > *last);
                                }
                                local.push(item);
                            }
                            None if done.load(Ordering::Acquire) && rx.is_empty() => break,
                            None => thread::yield_now(),
                        }
                    }
                    seen.lock().unwrap().extend(local);
                })
            })
            .collect();

        let mut next = 0;
        while next < ITEMS {
            match tx.push(next) {
                Ok(()) => next += 1,
                Err(Full(_)) => thread::yield_now(),
            }
        }
        done.store(true, Ordering::Release);

        for consumer in consumers {
            consumer.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), ITEMS);
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), ITEMS);
    }
}
