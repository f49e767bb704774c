//! Generation pipeline: run state, stage workers and the orchestrator.

pub mod orchestrator;
pub mod state;
pub mod worker;

pub use orchestrator::{PipelineOrchestrator, PipelineRun};
pub use state::{
    GenerationResult, PipelineState, PipelineStatus, StageResult, StageStatus,
};
pub use worker::{classify_status, HttpStageWorker, StageContext, StageWorker};
