//! Lock-free single-producer/single-consumer key-event queue.
//!
//! Grounded on the atomic-cell pattern in `quiver::io::AtomicF64`,
//! generalized from a single shared value to a ring of 1024 slots per
//! spec.md §3 "Message queue". The control thread (producer) encodes
//! `KeyEvent`s into 16-bit words; the audio thread (consumer) drains the
//! whole queue at the start of each block (§4.3.3 step 1).

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

const CAPACITY: usize = 1024;
const KEY_ON_TAG: u16 = 0x1000;
const KEY_OFF_TAG: u16 = 0x2000;
const KEY_MASK: u16 = 0x0FFF;

/// A single key-on/key-off event, as decoded from the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    On(u16),
    Off(u16),
}

impl KeyEvent {
    #[inline]
    fn encode(self) -> u16 {
        match self {
            KeyEvent::On(key) => KEY_ON_TAG | (key & KEY_MASK),
            KeyEvent::Off(key) => KEY_OFF_TAG | (key & KEY_MASK),
        }
    }

    #[inline]
    fn decode(word: u16) -> Option<Self> {
        let key = word & KEY_MASK;
        match word & !KEY_MASK {
            KEY_ON_TAG => Some(KeyEvent::On(key)),
            KEY_OFF_TAG => Some(KeyEvent::Off(key)),
            _ => None,
        }
    }
}

/// Fixed-capacity SPSC ring buffer of [`KeyEvent`]s.
///
/// Keys must be observed by the consumer in the order the producer
/// enqueued them (spec.md §5 "Ordering"); acquire/release orderings on the
/// shared head/tail indices suffice for a single producer and single
/// consumer, so no heavier synchronization is needed.
pub struct MessageQueue {
    slots: Box<[AtomicU16; CAPACITY]>,
    head: AtomicUsize, // next slot the consumer will read
    tail: AtomicUsize, // next slot the producer will write
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            slots: Box::new([const { AtomicU16::new(0) }; CAPACITY]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side: enqueue an event. Returns `false` if the queue is
    /// full (the event is dropped; this never blocks the control thread).
    pub fn push(&self, event: KeyEvent) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let next = (tail + 1) % CAPACITY;
        if next == head {
            return false; // full
        }
        self.slots[tail].store(event.encode(), Ordering::Relaxed);
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Consumer side: drain every pending event, in order, calling `f` for
    /// each. Runs on the audio thread at block start; never allocates.
    pub fn drain(&self, mut f: impl FnMut(KeyEvent)) {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                break;
            }
            let word = self.slots[head].load(Ordering::Relaxed);
            if let Some(event) = KeyEvent::decode(word) {
                f(event);
            }
            self.head.store((head + 1) % CAPACITY, Ordering::Release);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_fifo_order() {
        let q = MessageQueue::new();
        q.push(KeyEvent::On(36));
        q.push(KeyEvent::Off(36));
        q.push(KeyEvent::On(40));

        let mut seen = vec![];
        q.drain(|e| seen.push(e));
        assert_eq!(
            seen,
            vec![KeyEvent::On(36), KeyEvent::Off(36), KeyEvent::On(40)]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn rejects_push_when_full() {
        let q = MessageQueue::new();
        for i in 0..CAPACITY - 1 {
            assert!(q.push(KeyEvent::On((i % 160) as u16)));
        }
        assert!(!q.push(KeyEvent::On(1)));
    }

    #[test]
    fn round_trips_key_index_range() {
        let q = MessageQueue::new();
        q.push(KeyEvent::On(159));
        q.push(KeyEvent::Off(0));
        let mut seen = vec![];
        q.drain(|e| seen.push(e));
        assert_eq!(seen, vec![KeyEvent::On(159), KeyEvent::Off(0)]);
    }
}
