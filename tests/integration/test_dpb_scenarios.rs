//! DPB lifetime and reference-list scenarios, driven both through the pool
//! API and through a full pipeline run where a recording compute observes
//! the lists the encode loop actually built.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use encpipe::collab::{ComputeContext, StageCompute, StageComputeSet};
use encpipe::config::PipelineConfig;
use encpipe::dpb::DpbPool;
use encpipe::frame::{RefRequest, SliceType, WeightOffset};
use encpipe::pipeline::StageKind;

use crate::helpers::{hierarchical_gop_frames, run_pipeline, GopLookahead};

/// Captures the reference lists the encode loop built, keyed by POC.
#[derive(Default)]
struct ListRecorder {
    lists: Mutex<HashMap<i32, (Vec<i32>, Vec<i32>)>>,
}

impl StageCompute for ListRecorder {
    fn process(&self, ctx: &ComputeContext<'_>) {
        if ctx.stage != StageKind::EncodeLoop || ctx.worker != 0 {
            return;
        }
        let poc = ctx.payload.meta.expect("valid frame without meta").poc;
        let lists = ctx.ref_lists.expect("encode loop without lists");
        self.lists.lock().insert(poc, (lists.l0.pocs(), lists.l1.pocs()));
    }
}

#[test]
fn test_eviction_scenario_from_pool_api() {
    // Pool capacity 4; POCs 0 (ref), 4 (ref), 2, 1 resident; allocating for
    // POC 3 must evict POC 1 (the lowest POC among the evictable
    // non-reference candidates), not POC 2.
    let mut pool = DpbPool::new(4);
    for (poc, is_ref) in [(0, true), (4, true), (2, false), (1, false)] {
        let id = pool.allocate_free_record();
        let ty = if is_ref { SliceType::P } else { SliceType::B };
        pool.mark_record_used(id, is_ref, poc, 0, ty, 30);
    }

    let granted = pool.allocate_free_record();
    pool.mark_record_used(granted, false, 3, 0, SliceType::B, 30);

    let surviving: Vec<i32> = (0..=4).filter(|&poc| pool.find_resident(poc).is_some()).collect();
    assert!(surviving.contains(&2), "POC 2 must survive eviction");
    assert!(!surviving.contains(&1), "POC 1 must have been evicted");
}

#[test]
fn test_duplicate_expansion_scenario_from_pool_api() {
    // Requests for deltas -4 (aliased twice) and -2 at current POC 8 build
    // three L0 entries sorted descending [6, 4, 4]; the alias pair shares a
    // record but keeps distinct weight rows in request order.
    let mut pool = DpbPool::new(4);
    for poc in [4, 6] {
        let id = pool.allocate_free_record();
        pool.mark_record_used(id, true, poc, 0, SliceType::P, 30);
    }

    let request = vec![
        RefRequest::duplicated(
            -4,
            vec![WeightOffset { weight: 3, offset: 1 }, WeightOffset { weight: 5, offset: -2 }],
        ),
        RefRequest::simple(-2),
    ];
    let lists = pool.build_reference_lists(&request, 8);
    assert_eq!(lists.l0.pocs(), vec![6, 4, 4]);

    let entries = lists.l0.entries();
    assert_eq!(entries[1].record, entries[2].record, "aliases must share a record");
    assert_eq!(entries[1].weight, WeightOffset { weight: 3, offset: 1 });
    assert_eq!(entries[2].weight, WeightOffset { weight: 5, offset: -2 });
}

#[test]
fn test_pipeline_builds_ordered_lists_for_b_frames() {
    let recorder = Arc::new(ListRecorder::default());
    let frames = hierarchical_gop_frames(3);
    let cfg = PipelineConfig::new(2)
        .with_pipeline_depth(2)
        .with_queue_capacity(4)
        .with_dpb_capacity(6);

    let (encoded, _recon, _stats) = run_pipeline(
        cfg,
        Arc::new(GopLookahead),
        StageComputeSet::uniform(Arc::clone(&recorder) as Arc<_>),
        &frames,
    );
    assert_eq!(encoded.len(), frames.len());

    let lists = recorder.lists.lock();
    for &(poc, _, ty) in &frames {
        let (l0, l1) = lists.get(&poc).expect("missing lists for frame");
        match ty {
            SliceType::Idr => {
                assert!(l0.is_empty() && l1.is_empty(), "IDR at poc 0 must have empty lists");
            }
            SliceType::P => {
                // Anchors reference the previous anchor only.
                assert_eq!(l0, &vec![poc - 4]);
                assert_eq!(l1, &vec![poc - 4], "cross-append mirrors L0 into L1");
            }
            SliceType::B => {
                // Both anchors, past first in L0, future first in L1.
                let lo = poc & !3;
                let hi = lo + 4;
                assert_eq!(l0, &vec![lo, hi], "L0 for poc {poc}");
                assert_eq!(l1, &vec![hi, lo], "L1 for poc {poc}");
            }
            SliceType::I => unreachable!("pattern has no plain I frames"),
        }
    }
}

#[test]
fn test_dpb_occupancy_stays_bounded_through_pipeline() {
    let frames = hierarchical_gop_frames(6);
    let cfg = PipelineConfig::new(2)
        .with_pipeline_depth(2)
        .with_queue_capacity(4)
        .with_dpb_capacity(6);
    let (_encoded, recon, stats) =
        run_pipeline(cfg, Arc::new(GopLookahead), StageComputeSet::default(), &frames);

    assert!(stats.dpb_resident <= 6, "resident {} exceeds capacity", stats.dpb_resident);
    // Every frame got a DPB record.
    assert!(recon.iter().all(|r| r.record.is_some()));
}
