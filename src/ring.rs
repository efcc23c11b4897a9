//! Bounded ring of buffer slots shared by readers, workers and the updater.
//!
//! Three cursors partition the slots: `tail` (drained, free for reading),
//! `work` (filled, waiting for a worker) and `head` (next free slot), with
//! `tail ≤ work ≤ head` modulo capacity. Readers advance `head`, workers
//! advance `work`, the updater advances `tail`. Slot data itself lives in
//! per-slot `Mutex<DataBuffer>` cells owned by the scan state; a slot index
//! handed out here may still be locked by the previous stage, in which case
//! the next stage blocks on the slot mutex; that lock ordering is what makes
//! read → process → persist strictly ordered within one slot.
//!
//! Waiters sit on a condvar with a 10 ms timeout so the abort flag is polled
//! even if no notification arrives.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::ctx::Ctx;

const TICK: Duration = Duration::from_millis(10);

/// Outcome of a slot acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A slot index was claimed and its cursor advanced.
    Slot(usize),
    /// All readers finished and the ring is drained.
    Done,
    /// The abort flag was raised.
    Aborted,
}

struct Cursors {
    head: usize,
    work: usize,
    tail: usize,
    done: bool,
}

impl Cursors {
    fn is_done(&self) -> bool {
        self.done && self.head == self.tail
    }
}

pub struct RingBuffer {
    capacity: usize,
    meta: Mutex<Cursors>,
    changed: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring needs at least two slots");
        RingBuffer {
            capacity,
            meta: Mutex::new(Cursors {
                head: 0,
                work: 0,
                tail: 0,
                done: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Signal that no more data will be produced. Acquirers return
    /// [`Acquire::Done`] once the remaining slots are drained.
    pub fn set_done(&self) {
        self.meta.lock().unwrap().done = true;
        self.changed.notify_all();
    }

    /// Claim the next free slot for a reader. Waits while the ring is full.
    pub fn acquire_free(&self, ctx: &Ctx) -> Acquire {
        self.acquire(ctx, |c, cap| (c.head + 1) % cap != c.tail, |c, cap| {
            let ix = c.head;
            c.head = (c.head + 1) % cap;
            ix
        })
    }

    /// Claim the next filled slot for a worker. Waits while no slot is filled.
    pub fn acquire_full(&self, ctx: &Ctx) -> Acquire {
        self.acquire(ctx, |c, _| c.work != c.head, |c, cap| {
            let ix = c.work;
            c.work = (c.work + 1) % cap;
            ix
        })
    }

    /// Claim the next processed slot for the updater. Waits while none is
    /// ready.
    pub fn acquire_used(&self, ctx: &Ctx) -> Acquire {
        self.acquire(ctx, |c, _| c.tail != c.work, |c, cap| {
            let ix = c.tail;
            c.tail = (c.tail + 1) % cap;
            ix
        })
    }

    fn acquire(
        &self,
        ctx: &Ctx,
        ready: impl Fn(&Cursors, usize) -> bool,
        advance: impl FnOnce(&mut Cursors, usize) -> usize,
    ) -> Acquire {
        let mut c = self.meta.lock().unwrap();
        loop {
            if ctx.aborted() {
                return Acquire::Aborted;
            }
            if c.is_done() {
                return Acquire::Done;
            }
            if ready(&c, self.capacity) {
                break;
            }
            c = self.changed.wait_timeout(c, TICK).unwrap().0;
        }
        let ix = advance(&mut c, self.capacity);
        drop(c);
        self.changed.notify_all();
        Acquire::Slot(ix)
    }

    /// Number of claimed-but-not-yet-drained slots.
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        let c = self.meta.lock().unwrap();
        (c.head + self.capacity - c.tail) % self.capacity
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Ctx {
        Ctx::new(true)
    }

    #[test]
    fn slots_cycle_free_full_used() {
        let ctx = ctx();
        let rb = RingBuffer::new(4);
        assert_eq!(rb.acquire_free(&ctx), Acquire::Slot(0));
        assert_eq!(rb.acquire_free(&ctx), Acquire::Slot(1));
        assert_eq!(rb.acquire_full(&ctx), Acquire::Slot(0));
        assert_eq!(rb.acquire_used(&ctx), Acquire::Slot(0));
        assert_eq!(rb.acquire_full(&ctx), Acquire::Slot(1));
        assert_eq!(rb.acquire_used(&ctx), Acquire::Slot(1));
        assert_eq!(rb.in_flight(), 0);
    }

    #[test]
    fn in_flight_never_exceeds_capacity_minus_one() {
        let ctx = ctx();
        let rb = RingBuffer::new(4);
        for _ in 0..3 {
            assert!(matches!(rb.acquire_free(&ctx), Acquire::Slot(_)));
        }
        assert_eq!(rb.in_flight(), 3);
        // a fourth acquire_free would block; drain one slot instead
        assert!(matches!(rb.acquire_full(&ctx), Acquire::Slot(_)));
        assert!(matches!(rb.acquire_used(&ctx), Acquire::Slot(_)));
        assert!(matches!(rb.acquire_free(&ctx), Acquire::Slot(3)));
        assert_eq!(rb.in_flight(), 3);
    }

    #[test]
    fn done_on_empty_ring_terminates_all_acquirers() {
        let ctx = ctx();
        let rb = RingBuffer::new(4);
        rb.set_done();
        assert_eq!(rb.acquire_full(&ctx), Acquire::Done);
        assert_eq!(rb.acquire_used(&ctx), Acquire::Done);
        assert_eq!(rb.acquire_free(&ctx), Acquire::Done);
    }

    #[test]
    fn done_drains_remaining_slots_first() {
        let ctx = ctx();
        let rb = RingBuffer::new(4);
        assert!(matches!(rb.acquire_free(&ctx), Acquire::Slot(_)));
        rb.set_done();
        // the filled slot must still flow through worker and updater
        assert_eq!(rb.acquire_full(&ctx), Acquire::Slot(0));
        assert_eq!(rb.acquire_used(&ctx), Acquire::Slot(0));
        assert_eq!(rb.acquire_full(&ctx), Acquire::Done);
        assert_eq!(rb.acquire_used(&ctx), Acquire::Done);
    }

    #[test]
    fn abort_unblocks_waiters() {
        let ctx = ctx();
        let rb = RingBuffer::new(2);
        ctx.raise_abort();
        assert_eq!(rb.acquire_full(&ctx), Acquire::Aborted);
        assert_eq!(rb.acquire_free(&ctx), Acquire::Aborted);
        assert_eq!(rb.acquire_used(&ctx), Acquire::Aborted);
    }

    #[test]
    fn abort_wakes_a_blocked_waiter() {
        let ctx = ctx();
        let rb = std::sync::Arc::new(RingBuffer::new(2));
        let rb2 = std::sync::Arc::clone(&rb);
        let ctx2 = ctx.clone();
        let h = std::thread::spawn(move || rb2.acquire_full(&ctx2));
        std::thread::sleep(Duration::from_millis(30));
        ctx.raise_abort();
        assert_eq!(h.join().unwrap(), Acquire::Aborted);
    }

    #[test]
    fn concurrent_producers_consumers_preserve_counts() {
        let ctx = ctx();
        let rb = std::sync::Arc::new(RingBuffer::new(8));
        let n = 200usize;

        let producer = {
            let rb = std::sync::Arc::clone(&rb);
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for _ in 0..n {
                    assert!(matches!(rb.acquire_free(&ctx), Acquire::Slot(_)));
                }
                rb.set_done();
            })
        };
        let worker = {
            let rb = std::sync::Arc::clone(&rb);
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let mut seen = 0usize;
                while let Acquire::Slot(_) = rb.acquire_full(&ctx) {
                    seen += 1;
                }
                seen
            })
        };
        let updater = {
            let rb = std::sync::Arc::clone(&rb);
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let mut seen = 0usize;
                while let Acquire::Slot(_) = rb.acquire_used(&ctx) {
                    seen += 1;
                }
                seen
            })
        };

        producer.join().unwrap();
        assert_eq!(worker.join().unwrap(), n);
        assert_eq!(updater.join().unwrap(), n);
    }
}
