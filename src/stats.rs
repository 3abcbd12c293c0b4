//! Pipeline statistics and log formatting helpers.

use std::fmt;
use std::time::Duration;

/// Snapshot of one stage's progress.
#[derive(Debug, Clone)]
pub struct StageSnapshot {
    /// Stage display name.
    pub name: &'static str,
    /// Frames fully completed (teardown + barrier signaled).
    pub frames_completed: i64,
    /// Filled depth of the stage's input queue.
    pub input_filled: usize,
    /// Free depth of the stage's output queue.
    pub output_free: usize,
    /// Times a worker parked on the stage's input queue.
    pub blocked_waits: u64,
}

/// Snapshot of the whole pipeline, taken without stopping it.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Per-stage progress, in pipeline order.
    pub stages: Vec<StageSnapshot>,
    /// Frames the host has pushed.
    pub frames_pushed: u64,
    /// Encoded frames the host has drained.
    pub frames_encoded: u64,
    /// DPB records currently resident.
    pub dpb_resident: usize,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {} encoded {} dpb {}",
            self.frames_pushed, self.frames_encoded, self.dpb_resident
        )?;
        for stage in &self.stages {
            write!(
                f,
                " | {} done {} in {} out-free {} blocked {}",
                stage.name,
                stage.frames_completed,
                stage.input_filled,
                stage.output_free,
                stage.blocked_waits
            )?;
        }
        Ok(())
    }
}

/// Formats a duration in human-readable form ("45s", "2m 15s", "1h 30m").
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Formats frames-per-second with one decimal.
#[must_use]
pub fn format_fps(frames: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "n/a".to_string();
    }
    format!("{:.1} fps", frames as f64 / secs)
}
