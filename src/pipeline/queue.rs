//! Fixed-capacity buffer queues for inter-stage hand-off.
//!
//! A [`BufferQueue`] owns a fixed set of frame-sized payloads and hands them
//! between a producer stage and a consumer stage through two internal sets:
//!
//! - **free**: slots whose payload may be overwritten by a producer
//! - **filled**: slots carrying a completed frame, consumed FIFO
//!
//! Every slot is in exactly one of {free, filled, in-use-by-one-thread} at
//! any instant. While a slot is in use, its payload travels inside the
//! [`SlotHandle`] — exclusive ownership is enforced by the type system, not
//! by flags. Publishing a filled slot happens under the queue mutex, so all
//! payload writes made before `publish_filled` are visible to the thread
//! that later dequeues it.
//!
//! Blocking acquires park on a condvar and wake on publish/release or when
//! the queue is marked end-of-stream, at which point they return
//! [`Acquired::EndOfStream`] instead of blocking forever — this is how
//! flush/shutdown propagates through a stalled pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Outcome of an acquire call.
pub enum Acquired<T> {
    /// A slot was granted; the caller now exclusively owns the payload.
    Slot(SlotHandle<T>),
    /// Non-blocking acquire found no candidate slot.
    WouldBlock,
    /// The queue was marked end-of-stream and no (further) slot can be granted.
    EndOfStream,
}

impl<T> Acquired<T> {
    /// Unwrap the slot handle; panics on `WouldBlock`/`EndOfStream`.
    ///
    /// Intended for paths where the pipeline configuration guarantees
    /// availability; failure here is a fatal sizing bug, not a runtime
    /// condition to recover from.
    #[track_caller]
    #[must_use]
    pub fn expect_slot(self, queue_name: &str) -> SlotHandle<T> {
        match self {
            Acquired::Slot(handle) => handle,
            Acquired::WouldBlock => {
                panic!("buffer queue '{queue_name}': no slot available under correct sizing")
            }
            Acquired::EndOfStream => {
                panic!("buffer queue '{queue_name}': acquired past end-of-stream")
            }
        }
    }

    /// Returns the handle if a slot was granted.
    pub fn slot(self) -> Option<SlotHandle<T>> {
        match self {
            Acquired::Slot(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Exclusive ownership of one queue slot and its payload.
///
/// The handle must flow back into the queue it came from, either via
/// [`BufferQueue::publish_filled`] (producer side) or
/// [`BufferQueue::release`] (consumer side). Dropping a handle without
/// returning it permanently removes the slot from circulation; debug builds
/// flag that as a leak when the queue is later checked for quiescence.
#[derive(Debug)]
pub struct SlotHandle<T> {
    index: usize,
    payload: Option<T>,
}

impl<T> SlotHandle<T> {
    /// Slot index within the queue (stable for the queue's lifetime).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Shared access to the payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        self.payload.as_ref().expect("slot payload already taken")
    }

    /// Exclusive access to the payload.
    pub fn payload_mut(&mut self) -> &mut T {
        self.payload.as_mut().expect("slot payload already taken")
    }
}

/// Per-slot bookkeeping state, used to assert handle discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotTag {
    Free,
    Filled,
    InUse,
}

struct Inner<T> {
    /// Payload storage for slots currently *inside* the queue. `None` while
    /// the payload is out travelling in a `SlotHandle`.
    payloads: Vec<Option<T>>,
    tags: Vec<SlotTag>,
    free: VecDeque<usize>,
    filled: VecDeque<usize>,
    end_of_stream: bool,
}

/// Multi-producer/multi-consumer fixed-capacity slot queue.
pub struct BufferQueue<T> {
    name: String,
    inner: Mutex<Inner<T>>,
    free_cv: Condvar,
    filled_cv: Condvar,
    // Counters feed the stats snapshot; relaxed is fine, they are advisory.
    acquired_free: AtomicU64,
    acquired_filled: AtomicU64,
    published: AtomicU64,
    released: AtomicU64,
    blocked_waits: AtomicU64,
}

impl<T> BufferQueue<T> {
    /// Create a queue owning the given payloads; capacity equals their count.
    /// All slots start free.
    #[must_use]
    pub fn new(name: impl Into<String>, payloads: Vec<T>) -> Self {
        let capacity = payloads.len();
        assert!(capacity > 0, "buffer queue needs at least one slot");
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                payloads: payloads.into_iter().map(Some).collect(),
                tags: vec![SlotTag::Free; capacity],
                free: (0..capacity).collect(),
                filled: VecDeque::with_capacity(capacity),
                end_of_stream: false,
            }),
            free_cv: Condvar::new(),
            filled_cv: Condvar::new(),
            acquired_free: AtomicU64::new(0),
            acquired_filled: AtomicU64::new(0),
            published: AtomicU64::new(0),
            released: AtomicU64::new(0),
            blocked_waits: AtomicU64::new(0),
        }
    }

    /// Create a queue of `capacity` default-initialized payloads.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self
    where
        T: Default,
    {
        Self::new(name, (0..capacity).map(|_| T::default()).collect())
    }

    /// Queue name (used in logs and panic messages).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().tags.len()
    }

    /// Number of slots currently free.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of slots currently filled and not yet consumed.
    #[must_use]
    pub fn filled_len(&self) -> usize {
        self.inner.lock().filled.len()
    }

    /// Remove one slot from the free set.
    ///
    /// With `blocking = false` this returns [`Acquired::WouldBlock`] when the
    /// free set is empty. With `blocking = true` the caller parks until a
    /// slot is released or the queue reaches end-of-stream.
    pub fn acquire_free(&self, blocking: bool) -> Acquired<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(index) = inner.free.pop_front() {
                debug_assert_eq!(inner.tags[index], SlotTag::Free);
                inner.tags[index] = SlotTag::InUse;
                let payload = inner.payloads[index].take().expect("free slot lost its payload");
                self.acquired_free.fetch_add(1, Ordering::Relaxed);
                return Acquired::Slot(SlotHandle { index, payload: Some(payload) });
            }
            if inner.end_of_stream {
                return Acquired::EndOfStream;
            }
            if !blocking {
                return Acquired::WouldBlock;
            }
            self.blocked_waits.fetch_add(1, Ordering::Relaxed);
            self.free_cv.wait(&mut inner);
        }
    }

    /// Remove the oldest filled slot (FIFO).
    ///
    /// After end-of-stream, remaining filled slots are still drained in
    /// order; only once the filled set is empty does this return
    /// [`Acquired::EndOfStream`].
    pub fn acquire_filled(&self, blocking: bool) -> Acquired<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(index) = inner.filled.pop_front() {
                debug_assert_eq!(inner.tags[index], SlotTag::Filled);
                inner.tags[index] = SlotTag::InUse;
                let payload = inner.payloads[index].take().expect("filled slot lost its payload");
                self.acquired_filled.fetch_add(1, Ordering::Relaxed);
                return Acquired::Slot(SlotHandle { index, payload: Some(payload) });
            }
            if inner.end_of_stream {
                return Acquired::EndOfStream;
            }
            if !blocking {
                return Acquired::WouldBlock;
            }
            self.blocked_waits.fetch_add(1, Ordering::Relaxed);
            self.filled_cv.wait(&mut inner);
        }
    }

    /// Move a previously-acquired free slot into the filled set.
    ///
    /// The payload must be fully written before this call; the queue mutex
    /// makes those writes visible to the consumer that dequeues the slot.
    pub fn publish_filled(&self, mut handle: SlotHandle<T>) {
        let payload = handle.payload.take().expect("publishing a drained handle");
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.tags[handle.index],
            SlotTag::InUse,
            "buffer queue '{}': publish of a slot not in use",
            self.name
        );
        inner.payloads[handle.index] = Some(payload);
        inner.tags[handle.index] = SlotTag::Filled;
        inner.filled.push_back(handle.index);
        self.published.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.filled_cv.notify_one();
    }

    /// Return a consumed slot to the free set.
    pub fn release(&self, mut handle: SlotHandle<T>) {
        let payload = handle.payload.take().expect("releasing a drained handle");
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.tags[handle.index],
            SlotTag::InUse,
            "buffer queue '{}': release of a slot not in use",
            self.name
        );
        inner.payloads[handle.index] = Some(payload);
        inner.tags[handle.index] = SlotTag::Free;
        inner.free.push_back(handle.index);
        self.released.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.free_cv.notify_one();
    }

    /// Mark the queue end-of-stream and wake every parked thread.
    ///
    /// Producers are cut off immediately; consumers drain whatever is already
    /// filled, then observe [`Acquired::EndOfStream`].
    pub fn mark_end_of_stream(&self) {
        let mut inner = self.inner.lock();
        if !inner.end_of_stream {
            inner.end_of_stream = true;
            log::debug!("buffer queue '{}': end of stream", self.name);
        }
        drop(inner);
        self.free_cv.notify_all();
        self.filled_cv.notify_all();
    }

    /// Whether end-of-stream has been signaled.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.inner.lock().end_of_stream
    }

    /// True when every slot is back in the free set: nothing in flight,
    /// nothing unconsumed. Used by shutdown checks and tests.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let inner = self.inner.lock();
        inner.free.len() == inner.tags.len()
    }

    /// Snapshot of the queue's lifetime counters `(acquired_free,
    /// acquired_filled, published, released, blocked_waits)`.
    #[must_use]
    pub fn counters(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.acquired_free.load(Ordering::Relaxed),
            self.acquired_filled.load(Ordering::Relaxed),
            self.published.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
            self.blocked_waits.load(Ordering::Relaxed),
        )
    }
}
