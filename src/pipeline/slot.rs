//! Per-frame slot state machine and master election.
//!
//! Each pipeline stage owns a small ring of [`FrameSlot`]s, one per in-flight
//! frame. When the stage's workers arrive at a new frame they race a single
//! compare-and-swap on the slot state: the winner becomes the frame's master
//! and performs the once-per-frame initialization, everyone else parks until
//! the master publishes the shared work item. On the way out, each worker
//! bumps the slot's finished counter; whichever worker brings it to the
//! stage thread count is the teardown owner and resets the slot for reuse.
//!
//! State machine per slot: `Uninit -> Initializing -> Ready`, then back to
//! `Uninit` at reset. The explicit states replace a lock-check-flag pattern;
//! exactly-once initialization is enforced by the CAS, not by convention.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

/// Outcome of the init race for one worker on one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitRole {
    /// This worker won the CAS and must perform frame initialization.
    Master,
    /// Another worker is (or was) the master; wait for `Ready` before working.
    Follower,
}

/// Outcome of waiting for a slot to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// The master published the work item.
    Ready,
    /// Shutdown was requested while waiting.
    Shutdown,
}

/// One in-flight frame slot shared by all workers of a stage.
///
/// `W` is the per-frame work item: built by the master, read concurrently by
/// every worker during compute, consumed by the teardown owner.
pub struct FrameSlot<W> {
    state: AtomicU8,
    finished: AtomicUsize,
    work: RwLock<Option<W>>,
    ready_lock: Mutex<bool>,
    ready_cv: Condvar,
}

impl<W> Default for FrameSlot<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> FrameSlot<W> {
    /// Create a slot in the `Uninit` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            finished: AtomicUsize::new(0),
            work: RwLock::new(None),
            ready_lock: Mutex::new(false),
            ready_cv: Condvar::new(),
        }
    }

    /// Race to become this frame's master.
    ///
    /// Exactly one caller per frame observes [`InitRole::Master`]; the CAS
    /// from `Uninit` to `Initializing` is the whole election.
    pub fn claim_init(&self) -> InitRole {
        match self.state.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => InitRole::Master,
            Err(_) => InitRole::Follower,
        }
    }

    /// Master-only: publish the work item and release the followers.
    pub fn publish_ready(&self, work: W) {
        *self.work.write() = Some(work);
        let prev = self.state.swap(STATE_READY, Ordering::AcqRel);
        debug_assert_eq!(prev, STATE_INITIALIZING, "publish_ready outside an init claim");
        let mut ready = self.ready_lock.lock();
        *ready = true;
        drop(ready);
        self.ready_cv.notify_all();
    }

    /// Follower path: park until the master publishes, or shutdown.
    ///
    /// `shutdown` is checked through the closure so callers can point it at
    /// whatever flag their pipeline uses.
    pub fn wait_ready(&self, is_shutdown: impl Fn() -> bool) -> ReadyOutcome {
        if self.state.load(Ordering::Acquire) == STATE_READY {
            return ReadyOutcome::Ready;
        }
        let mut ready = self.ready_lock.lock();
        while !*ready {
            if is_shutdown() {
                return ReadyOutcome::Shutdown;
            }
            self.ready_cv.wait(&mut ready);
        }
        ReadyOutcome::Ready
    }

    /// Wake followers parked in [`FrameSlot::wait_ready`] so they can observe
    /// shutdown. Does not change the slot state.
    ///
    /// Taking and dropping the ready lock first closes the window where a
    /// follower has checked the shutdown flag but not yet parked: either it
    /// holds the lock and will reach the condvar before our notify, or it
    /// has not locked yet and will observe the flag on its next check.
    pub fn interrupt_waiters(&self) {
        drop(self.ready_lock.lock());
        self.ready_cv.notify_all();
    }

    /// Concurrent read access to the published work item for compute.
    ///
    /// Readers never contend with each other; the only writer is the master
    /// (before `Ready`) and the teardown owner (after every reader is done).
    pub fn read_work(&self) -> RwLockReadGuard<'_, Option<W>> {
        self.work.read()
    }

    /// Record one worker's completion. Returns true for the worker that
    /// brings the count to `expected`; that worker owns teardown.
    pub fn finish_one(&self, expected: usize) -> bool {
        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(done <= expected, "more workers finished than configured");
        done == expected
    }

    /// Teardown-owner only: take the work item back out of the slot.
    pub fn take_work(&self) -> W {
        self.work.write().take().expect("teardown with no published work")
    }

    /// Teardown-owner only: return the slot to `Uninit` for the next frame
    /// in the ring. The caller must have signaled the stage's own barrier
    /// *after* this reset, so no worker can reach the slot before it is clean.
    pub fn reset(&self) {
        let mut ready = self.ready_lock.lock();
        *ready = false;
        drop(ready);
        self.finished.store(0, Ordering::Release);
        self.state.store(STATE_UNINIT, Ordering::Release);
    }
}
