//! Workflow orchestration module

pub mod definition;
pub mod orchestrator;
pub mod persistence;
pub mod step;
pub mod validator;

pub use definition::Workflow;
pub use orchestrator::WorkflowOrchestrator;
pub use persistence::{
    Checkpoint, CheckpointStore, CompletedStep, InMemoryCheckpointStore, JsonFileCheckpointStore,
    CHECKPOINT_VERSION,
};
pub use step::{step_fn, FnStep, StepAction, StepContext, StepRegistry};
pub use validator::WorkflowValidator;
