//! Collaborator interfaces.
//!
//! The core schedules frames; it never computes pixels. Everything
//! pixel-shaped arrives through these traits: lookahead analysis feeds the
//! reference requests and cost aggregates the core needs for list building
//! and rate control, and [`StageCompute`] is the per-unit work the stage
//! workers fan out over. Compute implementations must not call back into
//! the core; they receive everything they need in the context and report
//! bits through it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dpb::RefLists;
use crate::frame::{BitrateInstanceId, DeltaPocList, FrameMeta, FrameStats};
use crate::pipeline::stage::StageKind;
use crate::pipeline::FramePayload;

/// Per-frame output of the lookahead/analysis collaborator.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutput {
    /// Cost aggregates for rate control.
    pub stats: FrameStats,
    /// Reference requests for list building.
    pub requests: DeltaPocList,
    /// POCs that must stay resident beyond this frame's own references.
    pub retain_pocs: Vec<i32>,
    /// Stats of the frame's temporal neighborhood (complexity-reset window);
    /// empty when lookahead has no window yet.
    pub neighborhood: Vec<FrameStats>,
    /// Index of the current frame within `neighborhood`.
    pub neighborhood_current: usize,
    /// Bitrate instance this frame belongs to.
    pub instance: BitrateInstanceId,
}

/// Lookahead/analysis collaborator: runs ahead of the main encode and
/// decides reference structure and costs per frame.
pub trait LookaheadAnalysis: Send + Sync {
    /// Analyze one frame. Called once per frame by the lookahead stage's
    /// elected master, in frame order.
    fn analyze(&self, meta: &FrameMeta) -> AnalysisOutput;
}

/// Everything one worker needs for its unit of compute on one frame.
pub struct ComputeContext<'a> {
    /// Stage this unit belongs to.
    pub stage: StageKind,
    /// Worker index within the stage (0-based).
    pub worker: usize,
    /// Total workers in the stage.
    pub num_workers: usize,
    /// Encode-order frame index.
    pub frame_index: u64,
    /// The frame's payload (read-only during compute).
    pub payload: &'a FramePayload,
    /// Reference lists, present in the encode-loop stage.
    pub ref_lists: Option<&'a RefLists>,
    /// Frame QP (0 outside the encode loop).
    pub qp: i32,
    /// Lagrangian multiplier matching `qp`.
    pub lambda: f64,
    bits_out: &'a AtomicU64,
}

impl<'a> ComputeContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stage: StageKind,
        worker: usize,
        num_workers: usize,
        frame_index: u64,
        payload: &'a FramePayload,
        ref_lists: Option<&'a RefLists>,
        qp: i32,
        lambda: f64,
        bits_out: &'a AtomicU64,
    ) -> Self {
        Self { stage, worker, num_workers, frame_index, payload, ref_lists, qp, lambda, bits_out }
    }

    /// Accumulate bits produced by this worker's unit; the frame total is
    /// fed to rate control at teardown.
    pub fn add_bits(&self, bits: u64) {
        self.bits_out.fetch_add(bits, Ordering::Relaxed);
    }
}

/// Externally supplied per-unit compute for one stage.
///
/// Workers of a stage call this concurrently for the same frame; the
/// implementation partitions its work by `ctx.worker` / `ctx.num_workers`
/// (CTB rows, tiles). It must not block on core resources.
pub trait StageCompute: Send + Sync {
    /// Perform this worker's share of the frame.
    fn process(&self, ctx: &ComputeContext<'_>);
}

/// No-op compute, useful for stages a host doesn't populate and for tests.
pub struct NullCompute;

impl StageCompute for NullCompute {
    fn process(&self, _ctx: &ComputeContext<'_>) {}
}

/// The per-stage compute table handed to the orchestrator.
pub struct StageComputeSet {
    computes: [Arc<dyn StageCompute>; StageKind::COUNT],
}

impl StageComputeSet {
    /// Use the same compute for every stage.
    #[must_use]
    pub fn uniform(compute: Arc<dyn StageCompute>) -> Self {
        Self {
            computes: [
                Arc::clone(&compute),
                Arc::clone(&compute),
                Arc::clone(&compute),
                Arc::clone(&compute),
                Arc::clone(&compute),
                compute,
            ],
        }
    }

    /// Replace the compute for one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageKind, compute: Arc<dyn StageCompute>) -> Self {
        self.computes[stage.index()] = compute;
        self
    }

    /// The compute for a stage.
    #[must_use]
    pub fn get(&self, stage: StageKind) -> Arc<dyn StageCompute> {
        Arc::clone(&self.computes[stage.index()])
    }
}

impl Default for StageComputeSet {
    fn default() -> Self {
        Self::uniform(Arc::new(NullCompute))
    }
}
