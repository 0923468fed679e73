//! Build orchestration for minici.
//!
//! [`Orchestrator`] owns the registry of running builds and enforces one
//! active build per project. Each accepted build runs as a background
//! [`BuildPipeline`] task that records its own progress.

pub mod orchestrator;
pub mod pipeline;

pub use orchestrator::Orchestrator;
pub use pipeline::{BuildOutcome, BuildPipeline, PipelineSettings};
