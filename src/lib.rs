// nckh-flow - research proposal approval workflow
// Proposal state machine, council evaluation protocol and idempotent transitions

pub mod api;
pub mod config;
pub mod council;
pub mod database;
pub mod domain;
pub mod effects;
pub mod errors;
pub mod evaluation;
pub mod idempotency;
pub mod observability;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use api::{dispatch, ApiRequest, ApiResponse};
pub use config::NckhFlowConfig;
pub use council::{CouncilRegistry, FacultyDirectory, StaticFacultyDirectory};
pub use domain::{
    ActionOutcome, ActionRequest, ActionType, Actor, Conclusion, Council, CouncilSpec,
    CouncilType, Evaluation, EvaluationOutcome, EvaluationPatch, EvaluationSection, NewProposal,
    Proposal, ProposalState, UserRole,
};
pub use effects::{ChannelEffectSink, Effect, EffectSink, NoopEffectSink};
pub use errors::WorkflowError;
pub use evaluation::{compute_aggregate, EvaluationRoster};
pub use idempotency::{Execution, IdempotencyGuard, IdempotencyRecord};
pub use observability::{OperationTimer, WorkflowMetrics, WorkflowStats};
pub use service::WorkflowService;
pub use store::{FileSystemPersistence, MemoryStore, Repository, SnapshotPersistence};
pub use telemetry::{create_action_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflows::{ProposalStateMachine, TransitionContext, WorkflowAction};
