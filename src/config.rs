//! Pipeline configuration.
//!
//! Plain config structs with builder-style setters. Validation happens once,
//! when the orchestrator is constructed; a bad configuration is reported as
//! [`PipelineError::InvalidConfig`](crate::error::PipelineError) rather than
//! surfacing later as a stalled pipeline.

use crate::error::{PipelineError, Result};
use crate::pipeline::stage::StageKind;
use crate::rate_control::RcMode;

/// Default number of in-flight frame slots per stage.
pub const DEFAULT_PIPELINE_DEPTH: usize = 2;

/// Default capacity of inter-stage buffer queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// Default DPB pool capacity.
pub const DEFAULT_DPB_CAPACITY: usize = 8;

/// Rate-control settings for one bitrate instance.
#[derive(Debug, Clone)]
pub struct RcConfig {
    /// QP decision mode.
    pub mode: RcMode,
    /// Lower clamp for returned QPs.
    pub qp_min: i32,
    /// Upper clamp for returned QPs.
    pub qp_max: i32,
    /// Bit budget per frame the model steers toward.
    pub target_bits_per_frame: u64,
}

impl Default for RcConfig {
    fn default() -> Self {
        Self {
            mode: RcMode::SingleEstimate,
            qp_min: 1,
            qp_max: 51,
            target_bits_per_frame: 200_000,
        }
    }
}

impl RcConfig {
    /// Set the QP decision mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RcMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the QP clamp range.
    #[must_use]
    pub fn with_qp_range(mut self, qp_min: i32, qp_max: i32) -> Self {
        self.qp_min = qp_min;
        self.qp_max = qp_max;
        self
    }

    /// Set the per-frame bit budget.
    #[must_use]
    pub fn with_target_bits_per_frame(mut self, bits: u64) -> Self {
        self.target_bits_per_frame = bits;
        self
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker threads per stage, indexed by [`StageKind::index`].
    pub threads_per_stage: [usize; StageKind::COUNT],
    /// Number of frame slots in flight per stage (ring size).
    pub pipeline_depth: usize,
    /// Capacity of each inter-stage buffer queue.
    pub queue_capacity: usize,
    /// Number of recon/reference records in the DPB pool.
    pub dpb_capacity: usize,
    /// One rate-control config per bitrate instance; the length defines the
    /// number of instances.
    pub rc: Vec<RcConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads_per_stage: [1; StageKind::COUNT],
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dpb_capacity: DEFAULT_DPB_CAPACITY,
            rc: vec![RcConfig::default()],
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with `threads` workers on every stage.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self { threads_per_stage: [threads; StageKind::COUNT], ..Default::default() }
    }

    /// Set the worker count for one stage.
    #[must_use]
    pub fn with_stage_threads(mut self, stage: StageKind, threads: usize) -> Self {
        self.threads_per_stage[stage.index()] = threads;
        self
    }

    /// Set the pipeline depth (frame slots in flight per stage).
    #[must_use]
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Set the inter-stage queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the DPB pool capacity.
    #[must_use]
    pub fn with_dpb_capacity(mut self, capacity: usize) -> Self {
        self.dpb_capacity = capacity;
        self
    }

    /// Replace the rate-control instance table.
    #[must_use]
    pub fn with_rc_instances(mut self, rc: Vec<RcConfig>) -> Self {
        self.rc = rc;
        self
    }

    /// Worker count for a stage.
    #[must_use]
    pub fn stage_threads(&self, stage: StageKind) -> usize {
        self.threads_per_stage[stage.index()]
    }

    /// Validate the configuration.
    ///
    /// The DPB sizing rule mirrors the resource-exhaustion contract: the pool
    /// must be able to hold every in-flight frame plus at least one evictable
    /// record, otherwise eviction could be asked to run on an empty candidate
    /// set at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(PipelineError::InvalidConfig {
                parameter: "pipeline_depth".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }
        if self.queue_capacity < self.pipeline_depth {
            return Err(PipelineError::InvalidConfig {
                parameter: "queue_capacity".to_string(),
                reason: format!(
                    "must be >= pipeline_depth ({}), got {}",
                    self.pipeline_depth, self.queue_capacity
                ),
            });
        }
        if self.dpb_capacity <= self.pipeline_depth {
            return Err(PipelineError::InvalidConfig {
                parameter: "dpb_capacity".to_string(),
                reason: format!(
                    "must exceed pipeline_depth ({}) to guarantee an evictable record",
                    self.pipeline_depth
                ),
            });
        }
        for (idx, &threads) in self.threads_per_stage.iter().enumerate() {
            if threads == 0 {
                return Err(PipelineError::InvalidConfig {
                    parameter: format!("threads_per_stage[{idx}]"),
                    reason: "every stage needs at least one worker".to_string(),
                });
            }
        }
        if self.rc.is_empty() {
            return Err(PipelineError::InvalidConfig {
                parameter: "rc".to_string(),
                reason: "at least one bitrate instance is required".to_string(),
            });
        }
        for (idx, rc) in self.rc.iter().enumerate() {
            if rc.qp_min > rc.qp_max {
                return Err(PipelineError::InvalidConfig {
                    parameter: format!("rc[{idx}].qp_range"),
                    reason: format!("qp_min {} > qp_max {}", rc.qp_min, rc.qp_max),
                });
            }
        }
        Ok(())
    }
}
