//! Integration tests for the frame pipeline.
//!
//! These tests validate end-to-end behavior that spans multiple modules:
//! multi-threaded stage scheduling, DPB lifetime across realistic GOPs, and
//! the rate-control ordering contract.

mod helpers;
mod test_dpb_scenarios;
mod test_pipeline_concurrency;
mod test_rate_control_contract;
