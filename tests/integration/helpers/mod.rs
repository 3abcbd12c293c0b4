//! Shared helpers for pipeline integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use encpipe::collab::{
    AnalysisOutput, ComputeContext, LookaheadAnalysis, StageCompute, StageComputeSet,
};
use encpipe::config::PipelineConfig;
use encpipe::frame::{FrameMeta, FrameStats, PixelHandle, RefRequest, SideInfoHandle, SliceType};
use encpipe::pipeline::{EncodedFrame, PipelineOrchestrator, ReconFrame};
use encpipe::stats::PipelineStats;

/// A pushed frame: (poc, gop generation, slice type).
pub type PushedFrame = (i32, u32, SliceType);

/// Opt into log output with `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build the push sequence for `gops` mini-GOPs of the pattern
/// I0 P4 B2 B1 B3 (encode order), POCs offset by 4 per mini-GOP.
pub fn hierarchical_gop_frames(gops: u32) -> Vec<PushedFrame> {
    let mut frames = Vec::new();
    for gop in 0..gops {
        let base = (gop * 4) as i32;
        if gop == 0 {
            frames.push((0, 0, SliceType::Idr));
        }
        frames.push((base + 4, 0, SliceType::P));
        frames.push((base + 2, 0, SliceType::B));
        frames.push((base + 1, 0, SliceType::B));
        frames.push((base + 3, 0, SliceType::B));
    }
    frames
}

/// Scripted lookahead for the I0 P4 B2 B1 B3 pattern.
///
/// B frames reference only the surrounding anchor pair (B pictures are
/// never references here), so the request deltas depend only on `poc % 4`.
pub struct GopLookahead;

impl LookaheadAnalysis for GopLookahead {
    fn analyze(&self, meta: &FrameMeta) -> AnalysisOutput {
        let mut out = AnalysisOutput {
            stats: FrameStats {
                satd: 80_000 + (meta.poc as u64 % 16) * 9_000,
                activity: 1_000,
                ..FrameStats::default()
            },
            ..AnalysisOutput::default()
        };
        if meta.poc == 0 {
            return out;
        }
        out.requests = match meta.poc % 4 {
            // Anchors reference the previous anchor.
            0 => vec![RefRequest::simple(-4)],
            1 => vec![RefRequest::simple(-1), RefRequest::simple(3)],
            2 => vec![RefRequest::simple(-2), RefRequest::simple(2)],
            _ => vec![RefRequest::simple(-3), RefRequest::simple(1)],
        };
        // Keep both anchors resident across the whole mini-GOP.
        let anchor = meta.poc & !3;
        out.retain_pocs = vec![anchor, anchor + 4];
        out
    }
}

/// Records how many times each (stage, frame) unit ran.
#[derive(Default)]
pub struct CountingCompute {
    counts: Mutex<HashMap<(usize, u64), usize>>,
}

impl CountingCompute {
    pub fn counts(&self) -> HashMap<(usize, u64), usize> {
        self.counts.lock().clone()
    }
}

impl StageCompute for CountingCompute {
    fn process(&self, ctx: &ComputeContext<'_>) {
        *self.counts.lock().entry((ctx.stage.index(), ctx.frame_index)).or_insert(0) += 1;
        // Report a deterministic per-unit bit cost so rate control sees
        // non-trivial feedback.
        ctx.add_bits(1_000 + ctx.worker as u64);
    }
}

/// Run a full pipeline over `frames`, draining both outputs.
///
/// Returns the encoded frames, the recon frames, and the final stats.
pub fn run_pipeline(
    cfg: PipelineConfig,
    lookahead: Arc<dyn LookaheadAnalysis>,
    computes: StageComputeSet,
    frames: &[PushedFrame],
) -> (Vec<EncodedFrame>, Vec<ReconFrame>, PipelineStats) {
    let pipe = PipelineOrchestrator::new(cfg, lookahead, computes).expect("construction failed");

    let (encoded, recon) = std::thread::scope(|scope| {
        let encoded = scope.spawn(|| {
            let mut out = Vec::new();
            while let Some(frame) = pipe.next_encoded() {
                out.push(frame);
            }
            out
        });
        let recon = scope.spawn(|| {
            let mut out = Vec::new();
            while let Some(frame) = pipe.next_recon() {
                out.push(frame);
            }
            out
        });

        for &(poc, gop_generation, slice_type) in frames {
            pipe.push_frame(
                FrameMeta::new(poc, gop_generation, slice_type),
                PixelHandle(poc as u32),
                SideInfoHandle(poc as u32),
            )
            .expect("push failed");
        }
        pipe.flush();
        (
            encoded.join().expect("encoded drain panicked"),
            recon.join().expect("recon drain panicked"),
        )
    });

    let stats = pipe.join().expect("pipeline error");
    (encoded, recon, stats)
}
