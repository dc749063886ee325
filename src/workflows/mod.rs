// Proposal workflow: permission table and transition logic

pub mod permissions;
pub mod state_machine;

pub use permissions::{
    available_actions, authorize, Destination, GateContext, RoleGate, SourceStates,
};
pub use state_machine::{
    holder_for, ProposalStateMachine, Transition, TransitionContext, WorkflowAction,
};
