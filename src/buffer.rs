//! Lock-free single-producer/single-consumer triple buffer, plus the shared
//! new-frame signal the camera callbacks use to wake the broadcaster.
//!
//! The triple buffer offers three slot states: the one the producer is
//! filling, the last committed one, and the one the reader has locked. The
//! producer never blocks and the reader never sees a torn value; commits the
//! reader did not get to in time are silently dropped.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Bit set in the shared state when the middle slot holds an unread commit.
const FRESH: u8 = 0b100;
const SLOT_MASK: u8 = 0b011;

struct Shared<T> {
    slots: [UnsafeCell<T>; 3],
    /// Bits 0..2: index of the middle (last committed) slot. Bit 2: FRESH.
    state: AtomicU8,
}

// Safety: the producer only ever touches the slot named by its own local
// index, the consumer only the slot named by its local index, and the middle
// slot is owned by whoever last swapped it in via `state`. The indices held
// by producer, consumer and `state` are a permutation of {0,1,2} at all
// times, so no slot is referenced from two threads at once.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Writer half of a triple buffer.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    write_idx: u8,
}

/// Reader half of a triple buffer.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    read_idx: u8,
}

/// Create a triple buffer; all three slots start as `T::default()`.
pub fn triple_buffer<T: Default + Send>() -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared {
        slots: [
            UnsafeCell::new(T::default()),
            UnsafeCell::new(T::default()),
            UnsafeCell::new(T::default()),
        ],
        // Middle slot starts at 1, not fresh.
        state: AtomicU8::new(1),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
            write_idx: 0,
        },
        Consumer {
            shared,
            read_idx: 2,
        },
    )
}

impl<T> Producer<T> {
    /// Mutable access to the slot currently being produced.
    pub fn start_new(&mut self) -> &mut T {
        // Safety: `write_idx` is owned exclusively by this producer until
        // `post_new` swaps it into the shared state.
        unsafe { &mut *self.shared.slots[self.write_idx as usize].get() }
    }

    /// Atomically publish the produced slot and take over the previous
    /// middle slot for the next round. Never blocks.
    pub fn post_new(&mut self) {
        let old = self
            .shared
            .state
            .swap(self.write_idx | FRESH, Ordering::AcqRel);
        self.write_idx = old & SLOT_MASK;
    }
}

impl<T> Consumer<T> {
    /// Try to lock the most recent commit. Returns false when nothing newer
    /// than the currently locked value has been committed.
    pub fn lock_new(&mut self) -> bool {
        if self.shared.state.load(Ordering::Acquire) & FRESH == 0 {
            return false;
        }
        // Hand our slot back as the new middle; only the producer sets
        // FRESH, so the commit we observed is still there (or has been
        // superseded by an even newer one, which is fine either way).
        let old = self.shared.state.swap(self.read_idx, Ordering::AcqRel);
        debug_assert_ne!(old & FRESH, 0);
        self.read_idx = old & SLOT_MASK;
        true
    }

    /// The value most recently acquired by `lock_new`. Stable until the next
    /// successful `lock_new`.
    pub fn locked(&self) -> &T {
        // Safety: `read_idx` is owned exclusively by this consumer until the
        // next `lock_new` swaps it away.
        unsafe { &*self.shared.slots[self.read_idx as usize].get() }
    }
}

/// N-producer/1-consumer wakeup used for "a new frame was committed
/// somewhere". Generation-counted so notifications between scans are never
/// lost; spurious wakeups are tolerated by design (the waiter rescans).
#[derive(Default)]
pub struct FrameSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that a new frame is available.
    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_one();
    }

    /// Wait until the generation advances past `seen`, or the timeout
    /// elapses. Returns the latest generation observed.
    pub fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let mut generation = self.generation.lock();
        if *generation == seen {
            self.cond.wait_for(&mut generation, timeout);
        }
        *generation
    }

    pub fn current(&self) -> u64 {
        *self.generation.lock()
    }
}
