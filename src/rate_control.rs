//! Rate-control gate: the single serialization point for QP decisions.
//!
//! One [`RateControlGate`] exists per bitrate instance, always behind a
//! mutex ([`RcTable`] owns the locks). Every worker that needs a QP queries
//! the gate; every finished frame feeds actual bit costs back, strictly in
//! frame order per instance. The adaptive model is a running estimate and
//! out-of-order updates would silently corrupt it, so they fail fast
//! instead.
//!
//! The numeric model here is deliberately small: an exponentially weighted
//! complexity estimate per picture type driving a log-domain QP step, plus
//! the scene-cut refinement loop. The gate's contract is about ordering,
//! clamping and determinism, not about matching any particular encoder's
//! curves; cost inputs are opaque aggregates from lookahead.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::config::RcConfig;
use crate::frame::{BitrateInstanceId, FrameStats, SliceType};

/// QP decision mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcMode {
    /// Fixed QP for every frame (still clamped to the configured range).
    ConstantQp(i32),
    /// One model estimate per frame.
    SingleEstimate,
    /// Scene cuts re-estimate iteratively until the estimate stabilizes or
    /// the iteration cap is hit.
    SceneCutRefine {
        /// Upper bound on refinement iterations (typically 4).
        max_iterations: u32,
    },
}

/// Per-frame input to [`RateControlGate::query_qp`].
#[derive(Debug, Clone, Copy)]
pub struct FrameRcStats {
    /// POC of the frame being decided.
    pub poc: i32,
    /// Slice type decided by lookahead.
    pub slice_type: SliceType,
    /// Lookahead cost aggregates.
    pub stats: FrameStats,
}

/// Post-encode feedback for [`RateControlGate::update_after_encode`].
#[derive(Debug, Clone, Copy)]
pub struct EncodeUpdate {
    /// POC of the encoded frame; must match the oldest unanswered query.
    pub poc: i32,
    /// Actual bits produced.
    pub bits_used: u64,
    /// Post-encode SAD aggregate.
    pub sad: u64,
    /// QP the frame was actually encoded with.
    pub qp_used: i32,
    /// Picture type the frame was encoded as.
    pub slice_type: SliceType,
}

/// Cached per-frame record kept by the gate for inspection and tests.
#[derive(Debug, Clone, Copy)]
pub struct RcFrameRecord {
    /// POC of the frame.
    pub poc: i32,
    /// Picture type at query time.
    pub slice_type: SliceType,
    /// QP the gate returned.
    pub qp: i32,
    /// Actual bits, filled in by the update.
    pub bits_used: Option<u64>,
}

/// Maximum cached frame records.
const HISTORY_CAP: usize = 32;

/// QP around which the log-domain step is anchored.
const QP_ANCHOR: f64 = 32.0;

/// Per-type QP offsets (I/P/B rows); deeper prediction levels pay more QP.
const TYPE_QP_OFFSET: [i32; SliceType::NUM_TABLE_ROWS] = [0, 1, 2];

/// EWMA smoothing factor for the complexity model.
const COMPLEXITY_ALPHA: f64 = 0.5;

/// Lambda modifiers per picture type (I/P/B rows).
const LAMBDA_MODIFIER: [f64; SliceType::NUM_TABLE_ROWS] = [0.57, 0.68, 0.85];

/// Lagrangian weighting factor for a QP and picture type.
#[must_use]
pub fn lambda_for(qp: i32, slice_type: SliceType) -> f64 {
    LAMBDA_MODIFIER[slice_type.table_index()] * 2.0_f64.powf((f64::from(qp) - 12.0) / 3.0)
}

/// Mutex-serialized rate-control context for one bitrate instance.
pub struct RateControlGate {
    cfg: RcConfig,
    /// EWMA of lookahead cost per picture type; 0 = no sample yet.
    complexity: [f64; SliceType::NUM_TABLE_ROWS],
    /// Running bits-vs-target balance, positive = over budget.
    bits_balance: i64,
    /// POCs queried but not yet updated, in query order.
    pending_updates: VecDeque<i32>,
    history: VecDeque<RcFrameRecord>,
    /// One-shot flag: drop the adaptive state before the next estimate.
    reset_pending: bool,
}

impl RateControlGate {
    /// Create a gate with fresh model state.
    #[must_use]
    pub fn new(cfg: RcConfig) -> Self {
        Self {
            cfg,
            complexity: [0.0; SliceType::NUM_TABLE_ROWS],
            bits_balance: 0,
            pending_updates: VecDeque::new(),
            history: VecDeque::new(),
            reset_pending: false,
        }
    }

    /// Clamp a QP into the configured range. Out-of-range requests are a
    /// normal condition, never an error.
    #[must_use]
    pub fn clamp_qp(&self, qp: i32) -> i32 {
        qp.clamp(self.cfg.qp_min, self.cfg.qp_max)
    }

    /// Decide the QP for a frame.
    pub fn query_qp(&mut self, frame: &FrameRcStats) -> i32 {
        if self.reset_pending {
            log::debug!("rc: model reset before poc {}", frame.poc);
            self.complexity = [0.0; SliceType::NUM_TABLE_ROWS];
            self.bits_balance = 0;
            self.reset_pending = false;
        }

        let qp = match self.cfg.mode {
            RcMode::ConstantQp(qp) => self.clamp_qp(qp),
            RcMode::SingleEstimate => self.estimate(frame),
            RcMode::SceneCutRefine { max_iterations } => {
                if frame.stats.is_scene_cut {
                    self.refine_scene_cut(frame, max_iterations)
                } else {
                    self.estimate(frame)
                }
            }
        };

        self.pending_updates.push_back(frame.poc);
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(RcFrameRecord {
            poc: frame.poc,
            slice_type: frame.slice_type,
            qp,
            bits_used: None,
        });
        qp
    }

    /// One model estimate: log-domain step off the complexity-to-budget
    /// ratio, plus the per-type offset and a budget-balance correction.
    fn estimate(&self, frame: &FrameRcStats) -> i32 {
        let row = frame.slice_type.table_index();
        let cost = frame.stats.satd.max(1) as f64;
        let modeled = if self.complexity[row] > 0.0 {
            COMPLEXITY_ALPHA * cost + (1.0 - COMPLEXITY_ALPHA) * self.complexity[row]
        } else {
            cost
        };
        let target = self.cfg.target_bits_per_frame.max(1) as f64;
        let ratio = (modeled / target).max(1.0 / 1024.0);

        // One QP step changes rate by ~2^(1/6); invert that here.
        let mut qp = QP_ANCHOR + 6.0 * ratio.log2();
        if self.bits_balance > 0 {
            qp += (self.bits_balance as f64 / target).min(4.0);
        }
        self.clamp_qp(qp.round() as i32 + TYPE_QP_OFFSET[row])
    }

    /// Scene-cut refinement: re-estimate with the candidate QP's implied
    /// bit cost folded in until the estimate stops moving or the cap hits.
    fn refine_scene_cut(&self, frame: &FrameRcStats, max_iterations: u32) -> i32 {
        let mut qp = self.estimate(frame);
        for iteration in 0..max_iterations {
            let refined = self.reestimate_with_offset(frame, qp);
            log::trace!(
                "rc: scene-cut poc {} iteration {iteration}: {qp} -> {refined}",
                frame.poc
            );
            if refined == qp {
                break;
            }
            qp = refined;
        }
        qp
    }

    /// Recompute the estimate assuming the frame spends the bits implied by
    /// `candidate_qp`, and move halfway toward the result. Halving the step
    /// makes the iteration contractive, so it terminates well inside the cap
    /// for any input.
    fn reestimate_with_offset(&self, frame: &FrameRcStats, candidate_qp: i32) -> i32 {
        let cost = frame.stats.satd.max(1) as f64;
        let implied_bits = cost / 2.0_f64.powf((f64::from(candidate_qp) - QP_ANCHOR) / 6.0);
        let target = self.cfg.target_bits_per_frame.max(1) as f64;
        let correction = 6.0 * (implied_bits / target).max(1.0 / 1024.0).log2();
        let moved = f64::from(candidate_qp) + correction / 2.0;
        self.clamp_qp(moved.round() as i32)
    }

    /// Feed actual post-encode costs back into the model.
    ///
    /// Must be called exactly once per encoded frame, in the order the
    /// frames were queried. A mismatched POC means the caller broke the
    /// serialization contract and is fatal.
    pub fn update_after_encode(&mut self, update: &EncodeUpdate) {
        let expected = self
            .pending_updates
            .pop_front()
            .expect("rc: update_after_encode with no outstanding query");
        assert_eq!(
            expected, update.poc,
            "rc: out-of-order update (expected poc {expected}, got {})",
            update.poc
        );

        let row = update.slice_type.table_index();
        let sad = update.sad.max(1) as f64;
        self.complexity[row] = if self.complexity[row] > 0.0 {
            COMPLEXITY_ALPHA * sad + (1.0 - COMPLEXITY_ALPHA) * self.complexity[row]
        } else {
            sad
        };
        self.bits_balance +=
            update.bits_used as i64 - self.cfg.target_bits_per_frame as i64;

        if let Some(record) = self.history.iter_mut().rev().find(|r| r.poc == update.poc) {
            record.bits_used = Some(update.bits_used);
        }
        log::trace!(
            "rc: poc {} used {} bits at qp {} (balance {})",
            update.poc,
            update.bits_used,
            update.qp_used,
            self.bits_balance
        );
    }

    /// Detect a transient complexity spike from a sliding window of
    /// lookahead flags.
    ///
    /// If `window[current]` is flagged high-complexity while no frame on
    /// either side of it is, the adaptive model would be biased by a
    /// one-frame spike; a reset is armed for the next query and `true` is
    /// returned.
    pub fn detect_complexity_reset(&mut self, window: &[FrameStats], current: usize) -> bool {
        assert!(current < window.len(), "rc: current index outside window");
        if !window[current].is_high_complexity {
            return false;
        }
        let before_spike = window[..current].iter().any(|s| s.is_high_complexity);
        let after_spike = window[current + 1..].iter().any(|s| s.is_high_complexity);
        if before_spike || after_spike {
            return false;
        }
        self.reset_pending = true;
        true
    }

    /// Cached per-frame records, oldest first.
    #[must_use]
    pub fn history(&self) -> impl Iterator<Item = &RcFrameRecord> {
        self.history.iter()
    }

    /// Number of queries still awaiting their update.
    #[must_use]
    pub fn pending_update_count(&self) -> usize {
        self.pending_updates.len()
    }
}

/// The per-instance gate table: one lock per bitrate instance.
pub struct RcTable {
    gates: Vec<Mutex<RateControlGate>>,
}

impl RcTable {
    /// Create one gate per config entry.
    #[must_use]
    pub fn new(configs: &[RcConfig]) -> Self {
        Self {
            gates: configs.iter().map(|cfg| Mutex::new(RateControlGate::new(cfg.clone()))).collect(),
        }
    }

    /// The lock for one bitrate instance.
    #[must_use]
    pub fn gate(&self, instance: BitrateInstanceId) -> &Mutex<RateControlGate> {
        &self.gates[instance.0]
    }

    /// Number of bitrate instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// True when no instances are configured (never the case after validation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
