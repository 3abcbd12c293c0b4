//! Concurrency tests for the frame pipeline.
//!
//! These verify thread-safety of the stage scheduler: order preservation
//! through every stage, exactly-once master initialization (observed as
//! exactly `num_threads` compute calls per stage per frame), clean flush
//! and force-end behavior, and progress under different per-stage thread
//! counts.

use std::sync::Arc;

use encpipe::collab::{NullCompute, StageComputeSet};
use encpipe::config::PipelineConfig;
use encpipe::frame::{FrameMeta, PixelHandle, SideInfoHandle};
use encpipe::pipeline::{PipelineOrchestrator, StageKind};

use crate::helpers::{
    hierarchical_gop_frames, init_test_logging, run_pipeline, CountingCompute, GopLookahead,
};

fn concurrent_config() -> PipelineConfig {
    PipelineConfig::new(3)
        .with_pipeline_depth(2)
        .with_queue_capacity(4)
        .with_dpb_capacity(6)
        .with_stage_threads(StageKind::EntropyOut, 1)
}

#[test]
fn test_multithreaded_run_preserves_frame_order() {
    init_test_logging();
    let frames = hierarchical_gop_frames(4);
    let (encoded, recon, stats) = run_pipeline(
        concurrent_config(),
        Arc::new(GopLookahead),
        StageComputeSet::default(),
        &frames,
    );

    let pushed_pocs: Vec<i32> = frames.iter().map(|f| f.0).collect();
    let encoded_pocs: Vec<i32> = encoded.iter().map(|f| f.poc).collect();
    assert_eq!(encoded_pocs, pushed_pocs, "bitstream order must match encode order");

    let recon_pocs: Vec<i32> = recon.iter().map(|f| f.poc).collect();
    assert_eq!(recon_pocs, pushed_pocs, "recon order must match encode order");

    assert_eq!(stats.frames_pushed, frames.len() as u64);
    assert_eq!(stats.frames_encoded, frames.len() as u64);
}

#[test]
fn test_every_worker_computes_every_frame_exactly_once() {
    let frames = hierarchical_gop_frames(3);
    let compute = Arc::new(CountingCompute::default());
    let cfg = concurrent_config();
    let expected_threads = cfg.threads_per_stage;

    let (encoded, _recon, _stats) = run_pipeline(
        cfg,
        Arc::new(GopLookahead),
        StageComputeSet::uniform(Arc::clone(&compute) as Arc<_>),
        &frames,
    );
    assert_eq!(encoded.len(), frames.len());

    let counts = compute.counts();
    for stage in StageKind::all() {
        for frame_index in 0..frames.len() as u64 {
            let count = counts.get(&(stage.index(), frame_index)).copied().unwrap_or(0);
            assert_eq!(
                count,
                expected_threads[stage.index()],
                "stage {} frame {frame_index}: {count} compute calls",
                stage.name()
            );
        }
    }
}

#[test]
fn test_stage_completion_counters_are_monotone_and_equal() {
    let frames = hierarchical_gop_frames(2);
    let (_encoded, _recon, stats) = run_pipeline(
        concurrent_config(),
        Arc::new(GopLookahead),
        StageComputeSet::default(),
        &frames,
    );
    // After a clean flush every stage has torn down every real frame plus
    // the end-of-stream placeholder (frame indices 0..=len).
    for stage in &stats.stages {
        assert_eq!(
            stage.frames_completed,
            frames.len() as i64,
            "stage {} completion counter",
            stage.name
        );
    }
}

#[test]
fn test_flush_with_no_frames_drains_cleanly() {
    let (encoded, recon, stats) = run_pipeline(
        concurrent_config(),
        Arc::new(GopLookahead),
        StageComputeSet::default(),
        &[],
    );
    assert!(encoded.is_empty());
    assert!(recon.is_empty());
    assert_eq!(stats.frames_encoded, 0);
}

#[test]
fn test_single_worker_stages_still_pipeline() {
    let cfg = PipelineConfig::new(1)
        .with_pipeline_depth(2)
        .with_queue_capacity(4)
        .with_dpb_capacity(6);
    let frames = hierarchical_gop_frames(3);
    let (encoded, _recon, _stats) =
        run_pipeline(cfg, Arc::new(GopLookahead), StageComputeSet::default(), &frames);
    assert_eq!(encoded.len(), frames.len());
}

#[test]
fn test_force_end_mid_stream_never_deadlocks() {
    init_test_logging();
    let pipe = PipelineOrchestrator::new(
        concurrent_config(),
        Arc::new(GopLookahead),
        StageComputeSet::uniform(Arc::new(NullCompute)),
    )
    .expect("construction failed");

    std::thread::scope(|scope| {
        let encoded = scope.spawn(|| {
            let mut count = 0usize;
            while pipe.next_encoded().is_some() {
                count += 1;
            }
            count
        });
        let recon = scope.spawn(|| while pipe.next_recon().is_some() {});

        for (index, &(poc, generation, ty)) in hierarchical_gop_frames(8).iter().enumerate() {
            if index == 9 {
                break;
            }
            if pipe
                .push_frame(
                    FrameMeta::new(poc, generation, ty),
                    PixelHandle(poc as u32),
                    SideInfoHandle(0),
                )
                .is_err()
            {
                break;
            }
        }
        pipe.force_end();

        let drained = encoded.join().expect("drain panicked");
        recon.join().expect("recon drain panicked");
        assert!(drained <= 9);
    });

    pipe.join().expect("pipeline error");
}

/// Longer run exercising slot-ring reuse many times over.
#[test]
fn test_sustained_run_reuses_slots() {
    let frames = hierarchical_gop_frames(12); // 49 frames through depth-2 rings
    let (encoded, _recon, stats) = run_pipeline(
        concurrent_config(),
        Arc::new(GopLookahead),
        StageComputeSet::default(),
        &frames,
    );
    assert_eq!(encoded.len(), frames.len());
    assert!(stats.dpb_resident <= 6);
}

#[cfg(feature = "stress-tests")]
mod stress {
    use super::*;
    use rand::Rng;

    /// Hammer the pipeline with many frames and a jittered host drain.
    #[test]
    fn test_stress_many_frames_with_jittered_host() {
        let frames = hierarchical_gop_frames(100);
        let pipe = PipelineOrchestrator::new(
            concurrent_config(),
            Arc::new(GopLookahead),
            StageComputeSet::default(),
        )
        .expect("construction failed");

        let total = std::thread::scope(|scope| {
            let encoded = scope.spawn(|| {
                let mut rng = rand::thread_rng();
                let mut count = 0usize;
                while pipe.next_encoded().is_some() {
                    count += 1;
                    if rng.gen_range(0..16) == 0 {
                        std::thread::sleep(std::time::Duration::from_micros(200));
                    }
                }
                count
            });
            let recon = scope.spawn(|| while pipe.next_recon().is_some() {});

            for &(poc, generation, ty) in &frames {
                pipe.push_frame(
                    FrameMeta::new(poc, generation, ty),
                    PixelHandle(poc as u32),
                    SideInfoHandle(0),
                )
                .expect("push failed");
            }
            pipe.flush();
            recon.join().expect("recon drain panicked");
            encoded.join().expect("drain panicked")
        });

        assert_eq!(total, frames.len());
        pipe.join().expect("pipeline error");
    }
}
