//! Frame-level pipeline orchestrator for a software video encoder.
//!
//! `encpipe` schedules a fixed pool of worker threads across the dependent
//! stages of a frame encode (lookahead, coarse motion search, intra
//! pre-analysis, motion estimation, mode-decision/encode loop, entropy
//! output), manages the lifetime of reference picture buffers, and
//! serializes every rate-control decision behind one gate per bitrate
//! instance. Pixel math lives outside: motion search, transforms and
//! entropy coding are collaborator callbacks invoked with already-scheduled
//! buffers.
//!
//! # What lives where
//!
//! - [`pipeline`]: the worker-pool machinery — buffer queues, dependency
//!   barriers, the frame-slot master election, the per-stage worker loop
//!   and the orchestrator that owns it all.
//! - [`dpb`]: the reference-picture pool and L0/L1 list construction.
//! - [`rate_control`]: the mutex-serialized QP/lambda gate.
//! - [`collab`]: the traits a host implements to supply the actual encoding
//!   work.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use encpipe::collab::{AnalysisOutput, LookaheadAnalysis, NullCompute, StageComputeSet};
//! use encpipe::config::PipelineConfig;
//! use encpipe::frame::{FrameMeta, PixelHandle, RefRequest, SideInfoHandle, SliceType};
//! use encpipe::pipeline::PipelineOrchestrator;
//!
//! struct Ipp;
//! impl LookaheadAnalysis for Ipp {
//!     fn analyze(&self, meta: &FrameMeta) -> AnalysisOutput {
//!         let mut out = AnalysisOutput::default();
//!         if meta.poc > 0 {
//!             out.requests = vec![RefRequest::simple(-1)];
//!         }
//!         out
//!     }
//! }
//!
//! let pipe = PipelineOrchestrator::new(
//!     PipelineConfig::new(2),
//!     Arc::new(Ipp),
//!     StageComputeSet::uniform(Arc::new(NullCompute)),
//! )?;
//! pipe.push_frame(FrameMeta::new(0, 0, SliceType::Idr), PixelHandle(0), SideInfoHandle(0))?;
//! pipe.flush();
//! while let Some(frame) = pipe.next_encoded() {
//!     println!("poc {} qp {}", frame.poc, frame.qp);
//! }
//! pipe.join()?;
//! # Ok::<(), encpipe::error::PipelineError>(())
//! ```

pub mod collab;
pub mod config;
pub mod dpb;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod rate_control;
pub mod stats;

pub use config::{PipelineConfig, RcConfig};
pub use error::{PipelineError, Result};
pub use pipeline::{EncodedFrame, PipelineOrchestrator, ReconFrame, StageKind};
