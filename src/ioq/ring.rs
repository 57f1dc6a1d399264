use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex};

// Slot state: a two-bit phase plus a waiter flag.
//
// EMPTY   -- no value, nobody mid-transition
// CLAIMED -- one side owns the cell and is moving a value in or out
// FULL    -- value present
// WAITERS -- at least one thread is parked on this slot's condvar
const PHASE: u8 = 0b011;
const EMPTY: u8 = 0b000;
const CLAIMED: u8 = 0b001;
const FULL: u8 = 0b010;
const WAITERS: u8 = 0b100;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    lock: Mutex<()>,
    cond: Condvar,
}

// SAFETY: the slot protocol guarantees exactly one thread touches `value`
// at a time (the one that won the CLAIMED transition).
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Park until the phase moves off `phase`. Spurious returns are fine;
    /// every caller loops.
    fn wait_while(&self, phase: u8) {
        let mut guard = self.lock.lock();
        // declare interest, then re-check under the lock so a concurrent
        // transition cannot slip between the check and the sleep
        let state = self.state.fetch_or(WAITERS, Ordering::AcqRel);
        if state & PHASE != phase {
            return;
        }
        self.cond.wait(&mut guard);
    }

    /// Publish a new phase; wake anything parked here.
    fn publish(&self, phase: u8) {
        let old = self.state.swap(phase, Ordering::AcqRel);
        if old & WAITERS != 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }
}

/**
Fixed-depth ring of slots carrying owned values between threads.

Both the submission and completion sides of the I/O queue are instances of
this ring. Producers and consumers claim indices with wrapping atomic
cursors; each slot transition is a CAS with a per-slot condvar for the
blocked arcs, so an uncontended transfer never takes a lock.
*/
pub(crate) struct Ring<T> {
    slots: Box<[Slot<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    mask: usize,
}

// SAFETY: values only move through slots under the protocol above.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// `depth` must be a power of two (validated by the queue).
    pub(crate) fn new(depth: usize) -> Self {
        debug_assert!(depth.is_power_of_two());
        Self {
            slots: (0..depth).map(|_| Slot::new()).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            mask: depth - 1,
        }
    }

    /// Move `value` into the next slot, sleeping if the previous lap's
    /// occupant has not been consumed yet.
    pub(crate) fn push(&self, value: T) {
        let idx = self.tail.fetch_add(1, Ordering::Relaxed) & self.mask;
        let slot = &self.slots[idx];
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if state & PHASE == EMPTY {
                if slot
                    .state
                    .compare_exchange(
                        state,
                        (state & WAITERS) | CLAIMED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: CLAIMED grants exclusive access to the cell
                    unsafe { (*slot.value.get()).write(value) };
                    slot.publish(FULL);
                    return;
                }
            } else {
                slot.wait_while(state & PHASE);
            }
        }
    }

    /// Blocking take from the next slot; usable from many consumer threads.
    pub(crate) fn pop(&self) -> T {
        let idx = self.head.fetch_add(1, Ordering::Relaxed) & self.mask;
        self.take_from(idx)
    }

    /**
    Single-consumer pop. Only advances the head cursor once a value is
    actually taken, which is what makes the non-blocking variant sound:
    an empty probe leaves the ring untouched.

    The caller guarantees no other thread pops this ring.
    */
    pub(crate) fn pop_single(&self, block: bool) -> Option<T> {
        let idx = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[idx & self.mask];
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if state & PHASE == FULL {
                self.head.store(idx.wrapping_add(1), Ordering::Relaxed);
                return Some(self.take_from(idx & self.mask));
            }
            if !block {
                return None;
            }
            slot.wait_while(state & PHASE);
        }
    }

    fn take_from(&self, idx: usize) -> T {
        let slot = &self.slots[idx];
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if state & PHASE == FULL {
                if slot
                    .state
                    .compare_exchange(
                        state,
                        (state & WAITERS) | CLAIMED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: CLAIMED grants exclusive access; the slot held FULL
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.publish(EMPTY);
                    return value;
                }
            } else {
                slot.wait_while(state & PHASE);
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if *slot.state.get_mut() & PHASE == FULL {
                // SAFETY: exclusive access via &mut; the slot holds a value
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Ring;
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_within_capacity() {
        let ring = Ring::new(8);
        for i in 0..8 {
            ring.push(i);
        }
        for i in 0..8 {
            assert_eq!(ring.pop_single(false), Some(i));
        }
        assert_eq!(ring.pop_single(false), None);
    }

    #[test]
    fn empty_probe_does_not_lose_position() {
        let ring = Ring::new(4);
        assert_eq!(ring.pop_single(false), None);
        assert_eq!(ring.pop_single(false), None);
        ring.push(41);
        assert_eq!(ring.pop_single(false), Some(41));
    }

    #[test]
    fn blocked_reader_wakes_on_push() {
        let ring = Arc::new(Ring::new(2));
        let reader = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.pop_single(true))
        };
        std::thread::sleep(Duration::from_millis(20));
        ring.push(7);
        assert_eq!(reader.join().unwrap(), Some(7));
    }

    #[test]
    fn overfull_push_blocks_until_pop() {
        let ring = Arc::new(Ring::new(2));
        ring.push(1);
        ring.push(2);

        let third_landed = Arc::new(AtomicBool::new(false));
        let writer = {
            let ring = Arc::clone(&ring);
            let landed = Arc::clone(&third_landed);
            std::thread::spawn(move || {
                ring.push(3);
                landed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        assert!(
            !third_landed.load(Ordering::SeqCst),
            "push into a full ring must sleep on the slot"
        );

        assert_eq!(ring.pop_single(true), Some(1));
        writer.join().unwrap();
        assert!(third_landed.load(Ordering::SeqCst));
        assert_eq!(ring.pop_single(true), Some(2));
        assert_eq!(ring.pop_single(true), Some(3));
    }

    #[test]
    fn multi_consumer_drains_everything() {
        let ring = Arc::new(Ring::new(16));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..8 {
                        got.push(ring.pop());
                    }
                    got
                })
            })
            .collect();

        for i in 0..32 {
            ring.push(i);
        }

        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn drops_unconsumed_values() {
        struct Probe(Arc<AtomicBool>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let ring = Ring::new(2);
        ring.push(Probe(Arc::clone(&dropped)));
        drop(ring);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
