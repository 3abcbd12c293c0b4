//! Pipeline ownership, thread lifecycle and the host-facing surface.
//!
//! The orchestrator wires the six stages together with buffer queues, owns
//! the DPB pool and the rate-control table, and spawns the per-stage worker
//! pools. The host pushes raw frames in, drains encoded and recon frames
//! out, and ends the stream with either [`PipelineOrchestrator::flush`]
//! (graceful: an end-of-stream sentinel flows through every stage) or
//! [`PipelineOrchestrator::force_end`] (cooperative cancellation: every
//! suspension point wakes and unwinds).
//!
//! Worker panics are contained per thread: the first panic is recorded, the
//! whole pipeline is force-ended, and the error surfaces once from
//! [`PipelineOrchestrator::join`]. No partial frame is ever emitted after a
//! fatal error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;

use crate::collab::{LookaheadAnalysis, StageComputeSet};
use crate::config::PipelineConfig;
use crate::dpb::{DpbPool, RecordId};
use crate::error::{PipelineError, Result};
use crate::frame::{FrameMeta, PixelHandle, SideInfoHandle, SliceType};
use crate::pipeline::queue::{Acquired, BufferQueue};
use crate::pipeline::stage::{stage_worker_loop, StageContext, StageKind};
use crate::pipeline::FramePayload;
use crate::rate_control::RcTable;
use crate::stats::{format_duration, format_fps, PipelineStats, StageSnapshot};

/// One encoded frame drained from the bitstream queue.
#[derive(Debug, Clone, Copy)]
pub struct EncodedFrame {
    /// Picture order count.
    pub poc: i32,
    /// GOP generation.
    pub gop_generation: u32,
    /// Slice type the frame was encoded as.
    pub slice_type: SliceType,
    /// Frame QP decided by rate control.
    pub qp: i32,
    /// Bits the encode loop reported for the frame.
    pub bits_used: u64,
}

/// One reconstructed picture drained from the recon queue.
#[derive(Debug, Clone, Copy)]
pub struct ReconFrame {
    /// Picture order count.
    pub poc: i32,
    /// DPB record the recon lives in.
    pub record: Option<RecordId>,
    /// Frame QP the picture was encoded with.
    pub qp: i32,
}

/// Shared fan-out used to wake the whole pipeline from any thread.
struct Shutdown {
    flag: Arc<AtomicBool>,
    queues: Vec<Arc<BufferQueue<FramePayload>>>,
    stages: Vec<Arc<StageContext>>,
    first_panic: Mutex<Option<PipelineError>>,
}

impl Shutdown {
    /// Set the force-end flag and wake every suspension point.
    fn force_end(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("pipeline: force end");
        for queue in &self.queues {
            queue.mark_end_of_stream();
        }
        for stage in &self.stages {
            stage.interrupt_all();
        }
    }

    fn record_panic(&self, thread: String, payload: &(dyn std::any::Any + Send)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        log::error!("pipeline: worker '{thread}' panicked: {message}");
        let mut guard = self.first_panic.lock();
        if guard.is_none() {
            *guard = Some(PipelineError::WorkerPanicked { thread, message });
        }
    }
}

/// Owns every pipeline resource and the worker threads.
pub struct PipelineOrchestrator {
    input: Arc<BufferQueue<FramePayload>>,
    bitstream: Arc<BufferQueue<FramePayload>>,
    recon: Arc<BufferQueue<FramePayload>>,
    dpb: Arc<Mutex<DpbPool>>,
    shutdown: Arc<Shutdown>,
    handles: Vec<JoinHandle<()>>,
    frames_pushed: AtomicU64,
    frames_encoded: AtomicU64,
    flushed: AtomicBool,
    started: Instant,
}

impl PipelineOrchestrator {
    /// Build the pipeline and spawn all worker threads.
    ///
    /// Workers idle on their barriers/queues until the host pushes frames.
    pub fn new(
        cfg: PipelineConfig,
        lookahead: Arc<dyn LookaheadAnalysis>,
        computes: StageComputeSet,
    ) -> Result<Self> {
        cfg.validate()?;

        let dpb = Arc::new(Mutex::new(DpbPool::new(cfg.dpb_capacity)));
        let rc = Arc::new(RcTable::new(&cfg.rc));
        let flag = Arc::new(AtomicBool::new(false));

        // One queue in front of every stage, plus bitstream and recon out.
        let queue_names =
            ["input", "la-out", "cme-out", "ipe-out", "me-out", "enc-out", "bitstream"];
        let queues: Vec<Arc<BufferQueue<FramePayload>>> = queue_names
            .iter()
            .map(|name| Arc::new(BufferQueue::with_capacity(*name, cfg.queue_capacity)))
            .collect();
        let recon = Arc::new(BufferQueue::with_capacity("recon", cfg.queue_capacity));

        let mut stages: Vec<Arc<StageContext>> = Vec::with_capacity(StageKind::COUNT);
        let mut upstream_done = None;
        for kind in StageKind::all() {
            let idx = kind.index();
            let ctx = Arc::new(StageContext::new(
                kind,
                cfg.stage_threads(kind),
                cfg.pipeline_depth,
                upstream_done.take(),
                Arc::clone(&queues[idx]),
                Arc::clone(&queues[idx + 1]),
                (kind == StageKind::EncodeLoop).then(|| Arc::clone(&recon)),
                (kind == StageKind::EncodeLoop).then(|| Arc::clone(&dpb)),
                (kind == StageKind::EncodeLoop).then(|| Arc::clone(&rc)),
                (kind == StageKind::Lookahead).then(|| Arc::clone(&lookahead)),
                computes.get(kind),
                Arc::clone(&flag),
            ));
            upstream_done = Some(Arc::clone(&ctx.done));
            stages.push(ctx);
        }

        let mut all_queues = queues.clone();
        all_queues.push(Arc::clone(&recon));
        let shutdown = Arc::new(Shutdown {
            flag,
            queues: all_queues,
            stages: stages.clone(),
            first_panic: Mutex::new(None),
        });

        let mut handles = Vec::new();
        for stage in &stages {
            for worker in 0..stage.num_threads {
                let stage = Arc::clone(stage);
                let shutdown = Arc::clone(&shutdown);
                let name = format!("{}-{worker}", stage.kind.short_name());
                let thread_name = name.clone();
                let handle = thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || stage_worker_loop(&stage, worker),
                        ));
                        if let Err(payload) = result {
                            shutdown.record_panic(thread_name, payload.as_ref());
                            shutdown.force_end();
                        }
                    })
                    .expect("failed to spawn worker thread");
                handles.push(handle);
            }
        }
        log::info!(
            "pipeline: started {} workers across {} stages (depth {})",
            handles.len(),
            StageKind::COUNT,
            cfg.pipeline_depth
        );

        Ok(Self {
            input: Arc::clone(&queues[0]),
            bitstream: Arc::clone(&queues[queues.len() - 1]),
            recon,
            dpb,
            shutdown,
            handles,
            frames_pushed: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            flushed: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    /// Push one raw input frame. Blocks while the input queue is full.
    pub fn push_frame(
        &self,
        meta: FrameMeta,
        pixels: PixelHandle,
        side_info: SideInfoHandle,
    ) -> Result<()> {
        if self.flushed.load(Ordering::Acquire) {
            return Err(PipelineError::PushAfterFlush);
        }
        match self.input.acquire_free(true) {
            Acquired::Slot(mut handle) => {
                let payload = handle.payload_mut();
                payload.clear();
                payload.meta = Some(meta);
                payload.pixels = pixels;
                payload.side_info = side_info;
                self.input.publish_filled(handle);
                self.frames_pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Acquired::EndOfStream => Err(PipelineError::PushAfterFlush),
            Acquired::WouldBlock => unreachable!("blocking acquire returned WouldBlock"),
        }
    }

    /// Signal end of stream: no more frames will be pushed. In-flight frames
    /// finish normally; the sentinel then flows through every stage.
    pub fn flush(&self) {
        if !self.flushed.swap(true, Ordering::AcqRel) {
            log::info!(
                "pipeline: flush after {} frames",
                self.frames_pushed.load(Ordering::Relaxed)
            );
            self.input.mark_end_of_stream();
        }
    }

    /// Cooperative cancellation: wake every blocked thread and unwind
    /// without finishing in-flight frames.
    pub fn force_end(&self) {
        self.flushed.store(true, Ordering::Release);
        self.shutdown.force_end();
    }

    /// Drain the next encoded frame, blocking until one is available.
    /// Returns `None` once the stream has fully drained. Placeholder frames
    /// are consumed internally and never surface.
    pub fn next_encoded(&self) -> Option<EncodedFrame> {
        loop {
            match self.bitstream.acquire_filled(true) {
                Acquired::Slot(handle) => {
                    let payload = handle.payload();
                    let frame = payload.meta.filter(|m| m.valid).map(|meta| EncodedFrame {
                        poc: meta.poc,
                        gop_generation: meta.gop_generation,
                        slice_type: meta.slice_type,
                        qp: payload.qp,
                        bits_used: payload.bits_used,
                    });
                    self.bitstream.release(handle);
                    match frame {
                        Some(frame) => {
                            self.frames_encoded.fetch_add(1, Ordering::Relaxed);
                            return Some(frame);
                        }
                        None => continue,
                    }
                }
                Acquired::EndOfStream => return None,
                Acquired::WouldBlock => unreachable!("blocking acquire returned WouldBlock"),
            }
        }
    }

    /// Drain the next reconstructed picture, blocking until one is
    /// available. Returns `None` once the stream has fully drained.
    pub fn next_recon(&self) -> Option<ReconFrame> {
        loop {
            match self.recon.acquire_filled(true) {
                Acquired::Slot(handle) => {
                    let payload = handle.payload();
                    let frame = payload.meta.filter(|m| m.valid).map(|meta| ReconFrame {
                        poc: meta.poc,
                        record: payload.record,
                        qp: payload.qp,
                    });
                    self.recon.release(handle);
                    match frame {
                        Some(frame) => return Some(frame),
                        None => continue,
                    }
                }
                Acquired::EndOfStream => return None,
                Acquired::WouldBlock => unreachable!("blocking acquire returned WouldBlock"),
            }
        }
    }

    /// Wait for every worker to exit and surface the first recorded error.
    pub fn join(mut self) -> Result<PipelineStats> {
        for handle in self.handles.drain(..) {
            // A panicked worker already recorded its error; the join error
            // itself carries no extra information.
            let _ = handle.join();
        }
        let stats = self.snapshot();
        let elapsed = self.started.elapsed();
        log::info!(
            "pipeline: joined after {} ({}) ({stats})",
            format_duration(elapsed),
            format_fps(stats.frames_encoded, elapsed)
        );
        if let Some(error) = self.shutdown.first_panic.lock().take() {
            return Err(error);
        }
        Ok(stats)
    }

    /// Live snapshot of pipeline progress.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            stages: self
                .shutdown
                .stages
                .iter()
                .map(|stage| {
                    let (_, _, _, _, blocked_waits) = stage.input.counters();
                    StageSnapshot {
                        name: stage.kind.name(),
                        frames_completed: stage.done.completed(),
                        input_filled: stage.input.filled_len(),
                        output_free: stage.output.free_len(),
                        blocked_waits,
                    }
                })
                .collect(),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            dpb_resident: self.dpb.lock().resident_count(),
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        log::warn!("pipeline: dropped without join; force-ending");
        self.shutdown.force_end();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
