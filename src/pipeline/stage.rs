//! The generic per-stage worker loop.
//!
//! Every stage runs the same skeleton: wait for the frame-ordering barriers,
//! race siblings for the master role, let the master do the once-per-frame
//! setup, compute, and let the last worker out tear the frame down and
//! advance the stage's completion barrier. What differs per stage is only
//! the setup/teardown payload work — the lookahead stage runs the analysis
//! collaborator, the encode loop talks to the DPB pool and the rate-control
//! gate, everything else forwards its payload.
//!
//! A frame with an invalid (placeholder) payload skips compute but runs the
//! full barrier/counter bookkeeping, so a flush never strands a downstream
//! stage waiting on a frame that will not come.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collab::{ComputeContext, LookaheadAnalysis, StageCompute};
use crate::dpb::{DpbPool, RecordId, RefLists};
use crate::frame::SliceType;
use crate::pipeline::barrier::{DependencyBarrier, WaitOutcome};
use crate::pipeline::queue::{Acquired, BufferQueue, SlotHandle};
use crate::pipeline::slot::{FrameSlot, InitRole, ReadyOutcome};
use crate::pipeline::FramePayload;
use crate::rate_control::{lambda_for, EncodeUpdate, FrameRcStats, RcTable};

/// The six pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Lookahead analysis: slice types, reference requests, cost aggregates.
    Lookahead,
    /// Hierarchical/coarse motion search.
    CoarseMe,
    /// Intra pre-analysis.
    IntraPre,
    /// Full-pel/sub-pel motion estimation.
    MotionEst,
    /// Mode decision and encode loop; owns DPB and rate-control traffic.
    EncodeLoop,
    /// Entropy coding and bitstream output.
    EntropyOut,
}

impl StageKind {
    /// Number of stages.
    pub const COUNT: usize = 6;

    /// All stages in pipeline order.
    #[must_use]
    pub const fn all() -> [StageKind; Self::COUNT] {
        [
            StageKind::Lookahead,
            StageKind::CoarseMe,
            StageKind::IntraPre,
            StageKind::MotionEst,
            StageKind::EncodeLoop,
            StageKind::EntropyOut,
        ]
    }

    /// Dense index for per-stage tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            StageKind::Lookahead => 0,
            StageKind::CoarseMe => 1,
            StageKind::IntraPre => 2,
            StageKind::MotionEst => 3,
            StageKind::EncodeLoop => 4,
            StageKind::EntropyOut => 5,
        }
    }

    /// The stage whose completion this stage waits on, frame by frame.
    #[must_use]
    pub const fn upstream(self) -> Option<StageKind> {
        match self {
            StageKind::Lookahead => None,
            StageKind::CoarseMe => Some(StageKind::Lookahead),
            StageKind::IntraPre => Some(StageKind::CoarseMe),
            StageKind::MotionEst => Some(StageKind::IntraPre),
            StageKind::EncodeLoop => Some(StageKind::MotionEst),
            StageKind::EntropyOut => Some(StageKind::EncodeLoop),
        }
    }

    /// Short name used for thread names and logs.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            StageKind::Lookahead => "la",
            StageKind::CoarseMe => "cme",
            StageKind::IntraPre => "ipe",
            StageKind::MotionEst => "me",
            StageKind::EncodeLoop => "enc",
            StageKind::EntropyOut => "ent",
        }
    }

    /// Display name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            StageKind::Lookahead => "lookahead",
            StageKind::CoarseMe => "coarse-me",
            StageKind::IntraPre => "intra-pre",
            StageKind::MotionEst => "motion-est",
            StageKind::EncodeLoop => "enc-loop",
            StageKind::EntropyOut => "entropy-out",
        }
    }

    /// Whether frame N's setup must wait for frame N-1's *teardown* in this
    /// stage (not just for its slot). The encode loop needs it: frame N-1's
    /// recon record becomes resident at teardown, and frame N's reference
    /// lists may name it.
    #[must_use]
    pub const fn serializes_frames(self) -> bool {
        matches!(self, StageKind::EncodeLoop)
    }
}

/// Per-frame shared work item built by the master, read by every worker,
/// consumed by the teardown owner.
pub(crate) struct FrameWork {
    frame_index: u64,
    /// End of stream reached: no payload, propagate the sentinel and stop.
    eos: bool,
    input: Option<SlotHandle<FramePayload>>,
    output: Option<SlotHandle<FramePayload>>,
    recon: Option<SlotHandle<FramePayload>>,
    record: Option<RecordId>,
    ref_lists: Option<RefLists>,
    qp: i32,
    lambda: f64,
    bits: AtomicU64,
}

impl FrameWork {
    fn end_of_stream(frame_index: u64) -> Self {
        Self {
            frame_index,
            eos: true,
            input: None,
            output: None,
            recon: None,
            record: None,
            ref_lists: None,
            qp: 0,
            lambda: 0.0,
            bits: AtomicU64::new(0),
        }
    }

    /// Whether compute should run for this frame.
    fn runs_compute(&self) -> bool {
        !self.eos
            && self.input.as_ref().is_some_and(|h| h.payload().meta.is_some_and(|m| m.valid))
    }
}

/// Everything one stage's workers share.
pub(crate) struct StageContext {
    pub kind: StageKind,
    pub num_threads: usize,
    pub depth: usize,
    slots: Vec<FrameSlot<FrameWork>>,
    /// Completion barrier: frame N signaled once N is fully torn down here.
    pub done: Arc<DependencyBarrier>,
    /// Serializes master setup so queue acquisition stays in frame order.
    init_done: DependencyBarrier,
    /// Upstream stage's completion barrier, when the topology has one.
    upstream: Option<Arc<DependencyBarrier>>,
    pub input: Arc<BufferQueue<FramePayload>>,
    pub output: Arc<BufferQueue<FramePayload>>,
    /// Recon output to the host; encode loop only.
    recon_out: Option<Arc<BufferQueue<FramePayload>>>,
    dpb: Option<Arc<Mutex<DpbPool>>>,
    rc: Option<Arc<RcTable>>,
    lookahead: Option<Arc<dyn LookaheadAnalysis>>,
    compute: Arc<dyn StageCompute>,
    shutdown: Arc<AtomicBool>,
}

impl StageContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: StageKind,
        num_threads: usize,
        depth: usize,
        upstream: Option<Arc<DependencyBarrier>>,
        input: Arc<BufferQueue<FramePayload>>,
        output: Arc<BufferQueue<FramePayload>>,
        recon_out: Option<Arc<BufferQueue<FramePayload>>>,
        dpb: Option<Arc<Mutex<DpbPool>>>,
        rc: Option<Arc<RcTable>>,
        lookahead: Option<Arc<dyn LookaheadAnalysis>>,
        compute: Arc<dyn StageCompute>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        assert!(num_threads > 0 && depth > 0);
        if kind == StageKind::EncodeLoop {
            assert!(dpb.is_some() && rc.is_some(), "encode loop needs the DPB pool and RC table");
        }
        if kind == StageKind::Lookahead {
            assert!(lookahead.is_some(), "lookahead stage needs an analysis collaborator");
        }
        Self {
            kind,
            num_threads,
            depth,
            slots: (0..depth).map(|_| FrameSlot::new()).collect(),
            done: Arc::new(DependencyBarrier::new(format!("{}-done", kind.short_name()))),
            init_done: DependencyBarrier::new(format!("{}-init", kind.short_name())),
            upstream,
            input,
            output,
            recon_out,
            dpb,
            rc,
            lookahead,
            compute,
            shutdown,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wake everything a stage's workers can be parked on.
    pub(crate) fn interrupt_all(&self) {
        self.done.shutdown();
        self.init_done.shutdown();
        for slot in &self.slots {
            slot.interrupt_waiters();
        }
    }

    /// Once-per-frame setup, run by the elected master.
    fn begin_frame(&self, frame_index: u64) -> FrameWork {
        let input = match self.input.acquire_filled(true) {
            Acquired::Slot(handle) => handle,
            Acquired::EndOfStream => return FrameWork::end_of_stream(frame_index),
            Acquired::WouldBlock => unreachable!("blocking acquire returned WouldBlock"),
        };
        let output = match self.output.acquire_free(true) {
            Acquired::Slot(handle) => handle,
            // Only reachable during force-end; unwind as end of stream.
            Acquired::EndOfStream => {
                self.input.release(input);
                return FrameWork::end_of_stream(frame_index);
            }
            Acquired::WouldBlock => unreachable!("blocking acquire returned WouldBlock"),
        };

        let mut work = FrameWork {
            frame_index,
            eos: false,
            input: Some(input),
            output: Some(output),
            recon: None,
            record: None,
            ref_lists: None,
            qp: 0,
            lambda: 0.0,
            bits: AtomicU64::new(0),
        };

        let valid = work.runs_compute();
        match self.kind {
            StageKind::Lookahead if valid => self.lookahead_setup(&mut work),
            StageKind::EncodeLoop if valid => self.encode_loop_setup(&mut work),
            _ => {}
        }
        work
    }

    /// Lookahead master setup: run the analysis collaborator and fold its
    /// output into the payload.
    fn lookahead_setup(&self, work: &mut FrameWork) {
        let analysis = {
            let handle = work.input.as_ref().expect("lookahead setup without input");
            let meta = handle.payload().meta.expect("valid frame without meta");
            self.lookahead.as_ref().expect("checked at construction").analyze(&meta)
        };
        let payload = work.input.as_mut().expect("lookahead setup without input").payload_mut();
        payload.stats = analysis.stats;
        payload.requests = analysis.requests;
        payload.retain_pocs = analysis.retain_pocs;
        payload.neighborhood = analysis.neighborhood;
        payload.neighborhood_current = analysis.neighborhood_current;
        payload.instance = analysis.instance;
    }

    /// Encode-loop master setup: grant a DPB record, build reference lists,
    /// retire unused records, and get the frame's QP from the gate.
    ///
    /// List building and retirement run on one uninterrupted pool borrow so
    /// a sibling bitrate instance can never watch a half-retired pool; the
    /// lock is dropped before compute starts.
    fn encode_loop_setup(&self, work: &mut FrameWork) {
        let handle = work.input.as_ref().expect("encode setup without input");
        let payload = handle.payload();
        let meta = payload.meta.expect("valid frame without meta");

        let dpb = self.dpb.as_ref().expect("checked at construction");
        let (record, ref_lists) = {
            let mut pool = dpb.lock();
            if meta.slice_type.is_idr() && meta.poc != 0 {
                // Closed-GOP boundary: prior generations can no longer be referenced.
                pool.flush();
            }
            let record = pool.allocate_free_record();
            let ref_lists = pool.build_reference_lists(&payload.requests, meta.poc);
            let mut active = ref_lists.referenced_records();
            active.push(record);
            for &poc in &payload.retain_pocs {
                if let Some(id) = pool.find_resident(poc) {
                    active.push(id);
                }
            }
            pool.release_unused(&active);
            (record, ref_lists)
        };

        let rc = self.rc.as_ref().expect("checked at construction");
        let qp = {
            let mut gate = rc.gate(payload.instance).lock();
            if !payload.neighborhood.is_empty() {
                gate.detect_complexity_reset(&payload.neighborhood, payload.neighborhood_current);
            }
            gate.query_qp(&FrameRcStats {
                poc: meta.poc,
                slice_type: meta.slice_type,
                stats: payload.stats,
            })
        };

        work.record = Some(record);
        work.ref_lists = Some(ref_lists);
        work.qp = qp;
        work.lambda = lambda_for(qp, meta.slice_type);

        if let Some(recon_queue) = &self.recon_out {
            work.recon = recon_queue.acquire_free(true).slot();
        }
        log::trace!(
            "{}: frame {} poc {} qp {qp} l0/l1 {}/{}",
            self.kind.name(),
            work.frame_index,
            meta.poc,
            work.ref_lists.as_ref().map_or(0, |l| l.l0.len()),
            work.ref_lists.as_ref().map_or(0, |l| l.l1.len()),
        );
    }

    /// Teardown, run by the last worker out of the frame.
    fn end_frame(&self, work: FrameWork) {
        if work.eos {
            log::debug!("{}: end of stream at frame {}", self.kind.name(), work.frame_index);
            self.output.mark_end_of_stream();
            if let Some(recon_queue) = &self.recon_out {
                recon_queue.mark_end_of_stream();
            }
            return;
        }

        let mut input = work.input.expect("teardown without input");
        let mut output = work.output.expect("teardown without output");
        let bits = work.bits.load(Ordering::Acquire);

        let valid = input.payload().meta.is_some_and(|m| m.valid);
        if valid && self.kind == StageKind::EncodeLoop {
            let payload = input.payload();
            let meta = payload.meta.expect("valid frame without meta");
            let record = work.record.expect("encode teardown without a record");
            // The frame is a reference unless it is a non-reference B; the
            // lookahead picks slice types, so the type alone decides here.
            let is_reference = meta.slice_type != SliceType::B;
            {
                let mut pool = self.dpb.as_ref().expect("checked at construction").lock();
                pool.mark_record_used(
                    record,
                    is_reference,
                    meta.poc,
                    meta.gop_generation,
                    meta.slice_type,
                    work.qp,
                );
            }
            let mut gate =
                self.rc.as_ref().expect("checked at construction").gate(payload.instance).lock();
            gate.update_after_encode(&EncodeUpdate {
                poc: meta.poc,
                bits_used: bits,
                sad: payload.stats.satd,
                qp_used: work.qp,
                slice_type: meta.slice_type,
            });
        }

        // Forward the payload into the output slot.
        {
            let mut forwarded = input.payload().clone();
            if self.kind == StageKind::EncodeLoop {
                forwarded.record = work.record;
                forwarded.qp = work.qp;
                forwarded.lambda = work.lambda;
                forwarded.bits_used = bits;
            }
            *output.payload_mut() = forwarded;
        }
        if let Some(mut recon) = work.recon {
            let recon_payload = recon.payload_mut();
            recon_payload.clear();
            recon_payload.meta = input.payload().meta;
            recon_payload.record = work.record;
            recon_payload.qp = work.qp;
            self.recon_out.as_ref().expect("recon slot without recon queue").publish_filled(recon);
        }
        self.input.release(input);
        self.output.publish_filled(output);
    }
}

/// The worker thread body: one stage, one worker index.
pub(crate) fn stage_worker_loop(ctx: &StageContext, worker: usize) {
    log::debug!("{} worker {worker}: starting", ctx.kind.name());
    let mut frame_index: u64 = 0;
    loop {
        // Slot reuse: the frame that last used this physical slot must be
        // fully torn down.
        let slot_gate = frame_index as i64 - ctx.depth as i64;
        if ctx.done.wait_done_through(slot_gate, worker) == WaitOutcome::Shutdown {
            break;
        }
        // Encode loop: the previous frame's record must be resident before
        // this frame's lists are built.
        if ctx.kind.serializes_frames()
            && ctx.done.wait_done_through(frame_index as i64 - 1, worker) == WaitOutcome::Shutdown
        {
            break;
        }
        // Upstream stage must have completed this frame.
        if let Some(upstream) = &ctx.upstream {
            if upstream.wait_done_through(frame_index as i64, worker) == WaitOutcome::Shutdown {
                break;
            }
        }

        let slot = &ctx.slots[(frame_index % ctx.depth as u64) as usize];
        match slot.claim_init() {
            InitRole::Master => {
                // Keep master setups in frame order: queue FIFO order is the
                // frame order only if nobody overtakes.
                if ctx.init_done.wait_for_previous(frame_index, worker) == WaitOutcome::Shutdown {
                    break;
                }
                let work = ctx.begin_frame(frame_index);
                ctx.init_done.signal_done(frame_index);
                slot.publish_ready(work);
            }
            InitRole::Follower => {
                if slot.wait_ready(|| ctx.is_shutdown()) == ReadyOutcome::Shutdown {
                    break;
                }
            }
        }

        let eos = {
            let guard = slot.read_work();
            let work = guard.as_ref().expect("slot ready without work");
            if work.runs_compute() {
                let payload =
                    work.input.as_ref().expect("runs_compute implies input").payload();
                let compute_ctx = ComputeContext::new(
                    ctx.kind,
                    worker,
                    ctx.num_threads,
                    work.frame_index,
                    payload,
                    work.ref_lists.as_ref(),
                    work.qp,
                    work.lambda,
                    &work.bits,
                );
                ctx.compute.process(&compute_ctx);
            }
            work.eos
        };

        if slot.finish_one(ctx.num_threads) {
            let work = slot.take_work();
            ctx.end_frame(work);
            slot.reset();
            ctx.done.signal_done(frame_index);
        }

        if eos {
            break;
        }
        frame_index += 1;
    }
    log::debug!("{} worker {worker}: exiting at frame {frame_index}", ctx.kind.name());
}
