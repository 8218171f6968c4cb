//! Bounded single-producer single-consumer queues.
//!
//! Requests cross between application threads and the network thread through these. The ring has
//! one slot more than its capacity so that a full ring can be told apart from an empty one without
//! a shared counter. A full ring rejects the item instead of overwriting anything.
//!
//! Each side is a separate owned handle. Having several application threads feed one queue means
//! wrapping the producer in a lock, which is what the stack does.
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// The sending half of a handoff queue.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// The receiving half of a handoff queue.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

struct Ring<T> {
    /// Next slot to dequeue, written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Next slot to enqueue, written only by the producer.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

/// A bounded array queue private to one thread.
///
/// Holds items that were taken off a handoff queue but can not be finalized yet.
#[derive(Debug)]
pub struct InternalQueue<T> {
    items: Vec<Option<T>>,
    first: usize,
    last: usize,
    count: usize,
}

/// Create a queue holding at most `capacity` items.
pub fn queue<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let slots = (0..capacity + 1)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let ring = Arc::new(Ring {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        slots,
    });

    (Producer { ring: ring.clone() }, Consumer { ring })
}

impl<T> Producer<T> {
    /// Append an item, handing it back if the queue is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let next = ring.next(tail);
        if next == ring.head.load(Ordering::Acquire) {
            return Err(item);
        }

        // SAFETY: the slot at `tail` is outside the consumer's readable range.
        unsafe { (*ring.slots[tail].get()).as_mut_ptr().write(item) };
        ring.tail.store(next, Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        let ring = &*self.ring;
        ring.next(ring.tail.load(Ordering::Relaxed)) == ring.head.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.len() - 1
    }
}

impl<T> Consumer<T> {
    /// Take the oldest item, if any.
    pub fn dequeue(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        if head == ring.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the producer published this slot with the release store of `tail`.
        let item = unsafe { (*ring.slots[head].get()).as_ptr().read() };
        ring.head.store(ring.next(head), Ordering::Release);
        Some(item)
    }

    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        (tail + ring.slots.len() - head) % ring.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Ring<T> {
    fn next(&self, idx: usize) -> usize {
        if idx + 1 == self.slots.len() { 0 } else { idx + 1 }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            // SAFETY: every slot between head and tail holds an initialized item.
            unsafe { self.slots[head].get_mut().as_mut_ptr().drop_in_place() };
            head = self.next(head);
        }
    }
}

// SAFETY: each slot is accessed by exactly one side at a time, handed over with release/acquire.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> InternalQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        InternalQueue {
            items: (0..capacity).map(|_| None).collect(),
            first: 0,
            last: 0,
            count: 0,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.count == self.items.len() {
            return Err(item);
        }

        self.items[self.last] = Some(item);
        self.last = (self.last + 1) % self.items.len();
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }

        let item = self.items[self.first].take();
        self.first = (self.first + 1) % self.items.len();
        self.count -= 1;
        item
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate the queued items, oldest first.
    pub fn iter(&self) -> impl Iterator<Item=&T> + '_ {
        let cap = self.items.len();
        (0..self.count).filter_map(move |i| self.items[(self.first + i) % cap].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple() {
        let (mut tx, mut rx) = queue(2);
        assert_eq!(tx.capacity(), 2);
        assert_eq!(rx.dequeue(), None::<u32>);

        tx.enqueue(1).unwrap();
        tx.enqueue(2).unwrap();
        assert!(tx.is_full());
        assert_eq!(tx.enqueue(3), Err(3));
        assert_eq!(rx.len(), 2);

        assert_eq!(rx.dequeue(), Some(1));
        tx.enqueue(3).unwrap();
        assert_eq!(rx.dequeue(), Some(2));
        assert_eq!(rx.dequeue(), Some(3));
        assert_eq!(rx.dequeue(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn drops_remaining() {
        let item = Arc::new(());
        let (mut tx, rx) = queue(4);
        tx.enqueue(item.clone()).unwrap();
        tx.enqueue(item.clone()).unwrap();
        assert_eq!(Arc::strong_count(&item), 3);
        drop(tx);
        drop(rx);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn across_threads() {
        let (mut tx, mut rx) = queue(16);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u32 {
                let mut item = i;
                while let Err(back) = tx.enqueue(item) {
                    item = back;
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < 10_000u32 {
            match rx.dequeue() {
                Some(i) => {
                    assert_eq!(i, expected);
                    expected += 1;
                },
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn internal() {
        let mut queue = InternalQueue::with_capacity(2);
        queue.push('a').unwrap();
        queue.push('b').unwrap();
        assert_eq!(queue.push('c'), Err('c'));
        assert_eq!(queue.pop(), Some('a'));
        queue.push('c').unwrap();
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![&'b', &'c']);
        assert_eq!(queue.pop(), Some('b'));
        assert_eq!(queue.pop(), Some('c'));
        assert_eq!(queue.pop(), None);
    }
}
