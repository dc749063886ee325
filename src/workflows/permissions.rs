// Role/state permission table for proposal transitions.
//
// Every legal (action, source state) pair is listed exactly once per role gate.
// Lookup checks the state first so that an action that is never legal from the
// current state reports InvalidStateTransition rather than Unauthorized.

use serde::Serialize;

use crate::domain::{ActionType, Actor, Council, Proposal, ProposalState, UserRole};
use crate::errors::WorkflowError;

/// Which source states a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStates {
    Exactly(ProposalState),
    OwnerEditable,
    FacultyReview,
    SchoolReview,
    NonTerminal,
    Pausable,
}

impl SourceStates {
    pub fn contains(&self, state: ProposalState) -> bool {
        match self {
            SourceStates::Exactly(expected) => *expected == state,
            SourceStates::OwnerEditable => state.is_editable(),
            SourceStates::FacultyReview => state.is_faculty_review(),
            SourceStates::SchoolReview => state.is_school_review(),
            SourceStates::NonTerminal => !state.is_terminal(),
            SourceStates::Pausable => {
                !state.is_terminal()
                    && !matches!(state, ProposalState::Draft | ProposalState::Paused)
            }
        }
    }
}

/// Who may perform the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoleGate {
    /// GIANG_VIEN who owns the proposal.
    Owner,
    /// QUAN_LY_KHOA of the proposal's faculty.
    FacultyManager,
    ScienceOffice,
    Board,
    /// Secretary of the assigned council, only through council finalization.
    CouncilSecretary,
}

/// Where a rule sends the proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    To(ProposalState),
    Stay,
    NextStage,
    /// Review state recorded by the latest return log.
    ReturnOrigin,
    /// State the proposal was paused from.
    PausedOrigin,
}

impl Destination {
    pub fn resolve(
        &self,
        action: ActionType,
        proposal: &Proposal,
    ) -> Result<ProposalState, WorkflowError> {
        match self {
            Destination::To(state) => Ok(*state),
            Destination::Stay => Ok(proposal.state),
            Destination::NextStage => {
                proposal
                    .state
                    .next_stage()
                    .ok_or(WorkflowError::InvalidStateTransition {
                        action,
                        from: proposal.state,
                    })
            }
            Destination::ReturnOrigin => proposal
                .latest_return_log()
                .map(|log| log.returned_from)
                .ok_or_else(|| {
                    WorkflowError::precondition(format!(
                        "proposal '{}' has no return log to resubmit against",
                        proposal.id
                    ))
                }),
            Destination::PausedOrigin => proposal.paused_from.ok_or_else(|| {
                WorkflowError::precondition(format!(
                    "proposal '{}' has no recorded state to resume to",
                    proposal.id
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub action: ActionType,
    pub from: SourceStates,
    pub gates: &'static [RoleGate],
    pub to: Destination,
}

const fn rule(
    action: ActionType,
    from: SourceStates,
    gates: &'static [RoleGate],
    to: Destination,
) -> TransitionRule {
    TransitionRule {
        action,
        from,
        gates,
        to,
    }
}

use ActionType as A;
use Destination as D;
use ProposalState as S;
use RoleGate as G;
use SourceStates as F;

pub static RULES: &[TransitionRule] = &[
    rule(A::SubmitProposal, F::Exactly(S::Draft), &[G::Owner], D::To(S::FacultyCouncilOutlineReview)),
    rule(A::SubmitProposal, F::Exactly(S::ChangesRequested), &[G::Owner], D::ReturnOrigin),
    rule(A::SubmitProposal, F::Exactly(S::InProgress), &[G::Owner], D::To(S::FacultyCouncilAcceptanceReview)),
    rule(A::UpdateProposalForm, F::OwnerEditable, &[G::Owner], D::Stay),
    rule(A::AssignCouncil, F::FacultyReview, &[G::FacultyManager], D::Stay),
    rule(A::AssignCouncil, F::SchoolReview, &[G::ScienceOffice], D::Stay),
    rule(A::ChangeCouncil, F::FacultyReview, &[G::FacultyManager], D::Stay),
    rule(A::ChangeCouncil, F::SchoolReview, &[G::ScienceOffice], D::Stay),
    rule(A::RequestChanges, F::FacultyReview, &[G::FacultyManager, G::CouncilSecretary], D::To(S::ChangesRequested)),
    rule(A::RequestChanges, F::SchoolReview, &[G::ScienceOffice, G::CouncilSecretary], D::To(S::ChangesRequested)),
    rule(A::Approve, F::FacultyReview, &[G::CouncilSecretary], D::NextStage),
    rule(A::Approve, F::SchoolReview, &[G::CouncilSecretary, G::Board], D::NextStage),
    rule(A::Reject, F::FacultyReview, &[G::FacultyManager], D::To(S::Rejected)),
    rule(A::Reject, F::SchoolReview, &[G::ScienceOffice, G::Board], D::To(S::Rejected)),
    rule(A::StartImplementation, F::Exactly(S::Approved), &[G::ScienceOffice], D::To(S::InProgress)),
    rule(A::Withdraw, F::OwnerEditable, &[G::Owner], D::To(S::Withdrawn)),
    rule(A::Cancel, F::NonTerminal, &[G::ScienceOffice], D::To(S::Cancelled)),
    rule(A::Pause, F::Pausable, &[G::ScienceOffice], D::To(S::Paused)),
    rule(A::Resume, F::Exactly(S::Paused), &[G::ScienceOffice], D::PausedOrigin),
];

/// Who is asking, and through which channel.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub actor: &'a Actor,
    pub council: Option<&'a Council>,
    pub via_finalization: bool,
}

impl RoleGate {
    pub fn admits(&self, proposal: &Proposal, ctx: &GateContext<'_>) -> bool {
        let actor = ctx.actor;
        match self {
            RoleGate::Owner => actor.role == UserRole::GiangVien && proposal.is_owned_by(&actor.id),
            RoleGate::FacultyManager => {
                actor.role == UserRole::QuanLyKhoa && actor.belongs_to_faculty(&proposal.faculty_id)
            }
            RoleGate::ScienceOffice => actor.role == UserRole::PhongKhcn,
            RoleGate::Board => actor.role == UserRole::BanGiamHoc,
            RoleGate::CouncilSecretary => {
                ctx.via_finalization
                    && match (ctx.council, proposal.council_id.as_deref()) {
                        (Some(council), Some(assigned)) => {
                            council.id == assigned && council.is_secretary(&actor.id)
                        }
                        _ => false,
                    }
            }
        }
    }
}

/// Finds the rule allowing `action` on `proposal` for the caller.
pub fn authorize(
    action: ActionType,
    proposal: &Proposal,
    ctx: &GateContext<'_>,
) -> Result<&'static TransitionRule, WorkflowError> {
    let mut candidates = RULES
        .iter()
        .filter(|r| r.action == action && r.from.contains(proposal.state))
        .peekable();

    if candidates.peek().is_none() {
        return Err(WorkflowError::InvalidStateTransition {
            action,
            from: proposal.state,
        });
    }

    candidates
        .find(|r| r.gates.iter().any(|gate| gate.admits(proposal, ctx)))
        .ok_or_else(|| {
            WorkflowError::unauthorized(format!(
                "{} '{}' may not {} proposal '{}' in {}",
                ctx.actor.role, ctx.actor.id, action, proposal.id, proposal.state
            ))
        })
}

/// Table-driven actions the caller may take right now. Council evaluation
/// actions are not part of the table and are added by the caller.
pub fn available_actions(proposal: &Proposal, actor: &Actor) -> Vec<ActionType> {
    let ctx = GateContext {
        actor,
        council: None,
        via_finalization: false,
    };
    let mut actions: Vec<ActionType> = Vec::new();
    for rule in RULES {
        if rule.from.contains(proposal.state)
            && rule.gates.iter().any(|gate| gate.admits(proposal, &ctx))
            && !actions.contains(&rule.action)
        {
            actions.push(rule.action);
        }
    }
    actions
}
