// Domain model shared by the store, the state machine and the council protocol

pub mod action;
pub mod actor;
pub mod council;
pub mod evaluation;
pub mod proposal;

pub use action::{
    ActionOutcome, ActionRequest, ActionType, ChangeCouncilPayload, CouncilPayload,
    EvaluationOutcome, FinalizePayload, FormPayload, ReasonPayload, ReturnPayload,
};
pub use actor::{Actor, UserRole};
pub use council::{Council, CouncilRole, CouncilSpec, CouncilType};
pub use evaluation::{
    Conclusion, Evaluation, EvaluationPatch, EvaluationSection, EvaluationState, ScoreAggregate,
    SectionAggregate, SectionPatch, SectionScore,
};
pub use proposal::{
    CouncilAssignment, CouncilFinalization, HolderUnit, NewProposal, Proposal, ProposalState,
    ReturnLog, WorkflowLogEntry,
};
