//! Frame-ordering dependency barriers.
//!
//! A [`DependencyBarrier`] tracks the last frame index fully released for one
//! resource (a stage's completion, a reference surface, a row of CTBs whose
//! owner has moved on). Consumers for frame N wait until the barrier shows
//! frame N-1 (or an earlier frame, for lagged cross-stage dependencies) as
//! complete; the elected last worker of a frame signals completion exactly
//! once, in order. Signaling out of order is a bug in the orchestration
//! logic and fails fast.
//!
//! Waits park on a condvar; a shutdown marker wakes every waiter and makes
//! all current and future waits return [`WaitOutcome::Shutdown`] so blocked
//! pipelines unwind cooperatively.

use parking_lot::{Condvar, Mutex};

/// Result of a barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited frame is complete; the caller may proceed.
    Ready,
    /// The pipeline is shutting down; the caller must unwind.
    Shutdown,
}

#[derive(Debug)]
struct BarrierState {
    /// Last frame index fully released, -1 before any frame completes.
    completed: i64,
    shutdown: bool,
}

/// Monotone per-resource frame completion counter.
pub struct DependencyBarrier {
    name: String,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl DependencyBarrier {
    /// Create a barrier with nothing completed yet (`completed = -1`), so a
    /// wait for frame 0's predecessor returns immediately.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BarrierState { completed: -1, shutdown: false }),
            cv: Condvar::new(),
        }
    }

    /// Barrier name (used in logs and panic messages).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reset to the startup state: frame -1 complete, shutdown cleared.
    /// Used between sequences so the first frame never waits on a
    /// non-existent predecessor.
    pub fn initialize_as_complete(&self) {
        let mut state = self.state.lock();
        state.completed = -1;
        state.shutdown = false;
    }

    /// Block until frame `frame_index - 1` is complete for this resource.
    /// No-op for frame 0. `caller` only feeds trace logging.
    pub fn wait_for_previous(&self, frame_index: u64, caller: usize) -> WaitOutcome {
        self.wait_done_through(frame_index as i64 - 1, caller)
    }

    /// Block until the barrier shows completion through `frame_index`
    /// (inclusive). Negative targets never wait; they denote dependencies
    /// on frames before the start of the sequence.
    pub fn wait_done_through(&self, frame_index: i64, caller: usize) -> WaitOutcome {
        let mut state = self.state.lock();
        while state.completed < frame_index {
            if state.shutdown {
                return WaitOutcome::Shutdown;
            }
            log::trace!(
                "barrier '{}': worker {caller} waiting for frame {frame_index} (at {})",
                self.name,
                state.completed
            );
            self.cv.wait(&mut state);
        }
        if state.shutdown {
            return WaitOutcome::Shutdown;
        }
        WaitOutcome::Ready
    }

    /// Mark `frame_index` complete and wake all waiters.
    ///
    /// Must be called exactly once per frame index, in order, by the elected
    /// last worker. Calling it for frame N while frame N-1 is still
    /// outstanding is a fatal orchestration bug.
    pub fn signal_done(&self, frame_index: u64) {
        let mut state = self.state.lock();
        assert_eq!(
            state.completed,
            frame_index as i64 - 1,
            "barrier '{}': signal_done({frame_index}) out of order (last completed {})",
            self.name,
            state.completed
        );
        state.completed = frame_index as i64;
        drop(state);
        self.cv.notify_all();
    }

    /// Last completed frame index (-1 before any completion).
    #[must_use]
    pub fn completed(&self) -> i64 {
        self.state.lock().completed
    }

    /// Wake every waiter with [`WaitOutcome::Shutdown`] and poison future waits.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        self.cv.notify_all();
    }
}
