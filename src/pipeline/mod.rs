//! The multi-stage, multi-threaded frame pipeline.
//!
//! # Architecture
//!
//! ```text
//! host ──► [input q] ─► Lookahead ─► [q] ─► CoarseMe ─► [q] ─► IntraPre ─► [q]
//!          ─► MotionEst ─► [q] ─► EncodeLoop ─► [q] ─► EntropyOut ─► [bitstream q] ─► host
//!                               │
//!                               └─► [recon q] ─► host
//! ```
//!
//! Each stage runs a fixed pool of worker threads over a small ring of
//! frame slots. Workers racing into a new frame elect a master by CAS
//! ([`slot`]), the master performs the once-per-frame setup (queue
//! acquisition, reference lists, rate control), everyone computes their
//! share, and the last worker out tears the frame down and advances the
//! stage's [`barrier`]. Frames hand off between stages through fixed
//! capacity [`queue`]s whose slots are exclusively owned while in flight.
//!
//! Shutdown is cooperative: a force-end flag plus end-of-stream sentinels
//! wake every suspension point, so no thread is ever cancelled.

pub mod barrier;
pub mod orchestrator;
pub mod queue;
pub mod slot;
pub mod stage;

pub use barrier::{DependencyBarrier, WaitOutcome};
pub use orchestrator::{EncodedFrame, PipelineOrchestrator, ReconFrame};
pub use queue::{Acquired, BufferQueue, SlotHandle};
pub use slot::{FrameSlot, InitRole, ReadyOutcome};
pub use stage::StageKind;

use crate::dpb::RecordId;
use crate::frame::{
    BitrateInstanceId, DeltaPocList, FrameMeta, FrameStats, PixelHandle, SideInfoHandle,
};

/// The frame-sized work item handed between stages.
///
/// One payload lives in each buffer-queue slot; stages fill in their part
/// and the teardown worker copies it forward into the next queue's slot.
/// Pixel data stays outside the core — only handles travel.
#[derive(Debug, Clone, Default)]
pub struct FramePayload {
    /// Frame identity; `meta.valid == false` marks a placeholder that skips
    /// compute but still flows through every stage's bookkeeping.
    pub meta: Option<FrameMeta>,
    /// Lookahead cost aggregates (filled by the lookahead stage).
    pub stats: FrameStats,
    /// Reference requests for list building (filled by lookahead).
    pub requests: DeltaPocList,
    /// POCs lookahead wants retained beyond this frame's own references.
    pub retain_pocs: Vec<i32>,
    /// Complexity-reset window and the current frame's index within it.
    pub neighborhood: Vec<FrameStats>,
    /// Index of the current frame within `neighborhood`.
    pub neighborhood_current: usize,
    /// Bitrate instance this frame belongs to.
    pub instance: BitrateInstanceId,
    /// Input pixel storage handle.
    pub pixels: PixelHandle,
    /// Per-CTB side-info handle.
    pub side_info: SideInfoHandle,
    /// DPB record granted to this frame (filled by the encode loop).
    pub record: Option<RecordId>,
    /// Frame QP decided by rate control (encode loop onward).
    pub qp: i32,
    /// Lambda matching `qp`.
    pub lambda: f64,
    /// Bits produced by the encode loop for this frame.
    pub bits_used: u64,
}

impl FramePayload {
    /// Reset to the empty state before reuse as a free queue slot.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
