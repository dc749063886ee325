// Proposal workflow state machine
//
// Pure transition logic: takes a proposal snapshot, an action and the context
// the caller resolved (actor, council, evaluation readiness) and returns the
// next snapshot plus the effects it produced. Nothing here touches storage, so
// the caller can commit the result with a single compare-and-swap.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::permissions::{self, GateContext};
use crate::domain::{
    ActionType, Actor, Council, CouncilAssignment, CouncilFinalization, HolderUnit, Proposal,
    ProposalState, ReturnLog, WorkflowLogEntry,
};
use crate::effects::{Effect, Recipient};
use crate::errors::WorkflowError;

/// Actions the state machine understands, with their validated payloads.
#[derive(Debug, Clone)]
pub enum WorkflowAction {
    Submit,
    AssignCouncil {
        council: Council,
    },
    ChangeCouncil {
        council: Council,
        reason: Option<String>,
    },
    RequestChanges {
        reason: String,
        requested_revisions: Vec<String>,
    },
    Approve {
        reason: Option<String>,
    },
    Reject {
        reason: Option<String>,
    },
    Cancel {
        reason: Option<String>,
    },
    Withdraw {
        reason: Option<String>,
    },
    Pause {
        reason: Option<String>,
    },
    Resume,
    StartImplementation,
}

impl WorkflowAction {
    pub fn action_type(&self) -> ActionType {
        match self {
            WorkflowAction::Submit => ActionType::SubmitProposal,
            WorkflowAction::AssignCouncil { .. } => ActionType::AssignCouncil,
            WorkflowAction::ChangeCouncil { .. } => ActionType::ChangeCouncil,
            WorkflowAction::RequestChanges { .. } => ActionType::RequestChanges,
            WorkflowAction::Approve { .. } => ActionType::Approve,
            WorkflowAction::Reject { .. } => ActionType::Reject,
            WorkflowAction::Cancel { .. } => ActionType::Cancel,
            WorkflowAction::Withdraw { .. } => ActionType::Withdraw,
            WorkflowAction::Pause { .. } => ActionType::Pause,
            WorkflowAction::Resume => ActionType::Resume,
            WorkflowAction::StartImplementation => ActionType::StartImplementation,
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            WorkflowAction::ChangeCouncil { reason, .. }
            | WorkflowAction::Approve { reason }
            | WorkflowAction::Reject { reason }
            | WorkflowAction::Cancel { reason }
            | WorkflowAction::Withdraw { reason }
            | WorkflowAction::Pause { reason } => reason.as_deref(),
            WorkflowAction::RequestChanges { reason, .. } => Some(reason.as_str()),
            _ => None,
        }
    }

    fn requires_reason(&self) -> bool {
        matches!(
            self,
            WorkflowAction::RequestChanges { .. }
                | WorkflowAction::Reject { .. }
                | WorkflowAction::Cancel { .. }
                | WorkflowAction::Pause { .. }
        )
    }
}

/// Everything the caller resolved before asking for a transition.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    pub actor: &'a Actor,
    /// Council currently assigned to the proposal, if any.
    pub council: Option<&'a Council>,
    /// Every voting member has submitted for the current cycle.
    pub evaluations_complete: bool,
    /// Present only when the transition is driven by council finalization.
    pub finalization: Option<CouncilFinalization>,
    pub expected_target: Option<ProposalState>,
    pub now: DateTime<Utc>,
}

impl<'a> TransitionContext<'a> {
    pub fn new(actor: &'a Actor, now: DateTime<Utc>) -> Self {
        Self {
            actor,
            council: None,
            evaluations_complete: false,
            finalization: None,
            expected_target: None,
            now,
        }
    }

    pub fn with_council(mut self, council: Option<&'a Council>) -> Self {
        self.council = council;
        self
    }

    pub fn with_evaluations_complete(mut self, complete: bool) -> Self {
        self.evaluations_complete = complete;
        self
    }

    pub fn with_finalization(mut self, finalization: CouncilFinalization) -> Self {
        self.finalization = Some(finalization);
        self
    }

    pub fn with_expected_target(mut self, target: Option<ProposalState>) -> Self {
        self.expected_target = target;
        self
    }
}

/// Outcome of a successful transition, not yet committed.
#[derive(Debug, Clone)]
pub struct Transition {
    pub proposal: Proposal,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProposalStateMachine;

impl ProposalStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Validates `action` against the permission table and the proposal's
    /// current state, then builds the next snapshot.
    pub fn apply(
        &self,
        proposal: &Proposal,
        action: &WorkflowAction,
        ctx: &TransitionContext<'_>,
    ) -> Result<Transition, WorkflowError> {
        let action_type = action.action_type();
        let gate = GateContext {
            actor: ctx.actor,
            council: ctx.council,
            via_finalization: ctx.finalization.is_some(),
        };

        let rule = permissions::authorize(action_type, proposal, &gate).inspect_err(|e| {
            warn!(
                proposal_id = %proposal.id,
                action = %action_type,
                actor_id = %ctx.actor.id,
                state = %proposal.state,
                error = %e,
                "Workflow action rejected"
            );
        })?;
        let target = rule.to.resolve(action_type, proposal)?;

        if let Some(expected) = ctx.expected_target {
            if expected != target {
                return Err(WorkflowError::InvalidStateTransition {
                    action: action_type,
                    from: proposal.state,
                });
            }
        }

        if action.requires_reason() && !action.reason().is_some_and(|r| !r.trim().is_empty()) {
            return Err(WorkflowError::invalid_field(
                "reason",
                format!("{action_type} requires a reason"),
            ));
        }

        self.check_preconditions(proposal, action, ctx)?;

        let from = proposal.state;
        let mut next = proposal.clone();
        let mut effects = vec![Effect::Transitioned {
            proposal_id: proposal.id.clone(),
            action: action_type,
            from,
            to: target,
        }];

        match action {
            WorkflowAction::Submit => {
                next.review_cycle += 1;
                if from != ProposalState::ChangesRequested {
                    next.council_id = None;
                }
                effects.push(Effect::RenderDocument {
                    proposal_id: proposal.id.clone(),
                    template: "submission_receipt".to_string(),
                });
            }
            WorkflowAction::AssignCouncil { council } => {
                next.council_id = Some(council.id.clone());
                next.council_history.push(CouncilAssignment {
                    council_id: council.id.clone(),
                    cycle: next.review_cycle,
                    assigned_by: ctx.actor.id.clone(),
                    assigned_at: ctx.now,
                    replaced_at: None,
                });
                effects.push(Effect::CouncilAssigned {
                    proposal_id: proposal.id.clone(),
                    council_id: council.id.clone(),
                    cycle: next.review_cycle,
                });
            }
            WorkflowAction::ChangeCouncil { council, .. } => {
                if let Some(previous) = next
                    .council_history
                    .iter_mut()
                    .rev()
                    .find(|a| a.replaced_at.is_none())
                {
                    previous.replaced_at = Some(ctx.now);
                }
                if let Some(old) = &proposal.council_id {
                    effects.push(Effect::EvaluationsSuperseded {
                        proposal_id: proposal.id.clone(),
                        council_id: old.clone(),
                        cycle: proposal.review_cycle,
                    });
                }
                next.review_cycle += 1;
                next.council_id = Some(council.id.clone());
                next.council_history.push(CouncilAssignment {
                    council_id: council.id.clone(),
                    cycle: next.review_cycle,
                    assigned_by: ctx.actor.id.clone(),
                    assigned_at: ctx.now,
                    replaced_at: None,
                });
                effects.push(Effect::CouncilAssigned {
                    proposal_id: proposal.id.clone(),
                    council_id: council.id.clone(),
                    cycle: next.review_cycle,
                });
            }
            WorkflowAction::RequestChanges {
                reason,
                requested_revisions,
            } => {
                next.return_logs.push(ReturnLog {
                    returned_from: from,
                    reason: reason.clone(),
                    requested_revisions: requested_revisions.clone(),
                    returned_by: ctx.actor.id.clone(),
                    cycle: proposal.review_cycle,
                    returned_at: ctx.now,
                });
                effects.push(Effect::ReturnLogged {
                    proposal_id: proposal.id.clone(),
                    returned_from: from,
                    reason: reason.clone(),
                });
            }
            WorkflowAction::Approve { .. } => {
                next.council_id = None;
                if target.is_review() {
                    next.review_cycle += 1;
                }
                if matches!(target, ProposalState::Approved | ProposalState::Completed) {
                    effects.push(Effect::RenderDocument {
                        proposal_id: proposal.id.clone(),
                        template: if target == ProposalState::Approved {
                            "approval_decision".to_string()
                        } else {
                            "acceptance_certificate".to_string()
                        },
                    });
                }
            }
            WorkflowAction::Pause { .. } => {
                next.paused_from = Some(from);
            }
            WorkflowAction::Resume => {
                next.paused_from = None;
            }
            WorkflowAction::Reject { .. }
            | WorkflowAction::Cancel { .. }
            | WorkflowAction::Withdraw { .. }
            | WorkflowAction::StartImplementation => {}
        }

        if let Some(finalization) = &ctx.finalization {
            next.finalizations.push(finalization.clone());
            effects.insert(
                0,
                Effect::CouncilFinalized {
                    proposal_id: proposal.id.clone(),
                    council_id: finalization.council_id.clone(),
                    cycle: finalization.cycle,
                    conclusion: finalization.final_conclusion,
                },
            );
        }

        next.state = target;
        next.updated_at = ctx.now;
        let (holder_user_id, holder_unit) = holder_for(&next);
        next.holder_user_id = holder_user_id;
        next.holder_unit = holder_unit;
        if target.is_review() && ctx.evaluations_complete {
            if let Some(council) = ctx
                .council
                .filter(|c| next.council_id.as_deref() == Some(c.id.as_str()))
            {
                next.holder_user_id = Some(council.secretary_id.clone());
            }
        }

        next.workflow_log.push(WorkflowLogEntry {
            action: action_type,
            actor_id: ctx.actor.id.clone(),
            actor_role: ctx.actor.role,
            from_state: from,
            to_state: target,
            timestamp: ctx.now,
            reason: action.reason().map(str::to_string),
        });

        let recipient = match (&next.holder_user_id, &next.holder_unit) {
            (Some(user), _) => Recipient::User(user.clone()),
            (None, Some(unit)) => Recipient::Unit(unit.clone()),
            // terminal: tell the owner
            (None, None) => Recipient::User(next.owner_id.clone()),
        };
        effects.push(Effect::Notify {
            proposal_id: proposal.id.clone(),
            recipient,
            subject: format!("{} {} -> {}", next.code, from, target),
        });

        info!(
            proposal_id = %proposal.id,
            action = %action_type,
            actor_id = %ctx.actor.id,
            from_state = %from,
            to_state = %target,
            review_cycle = next.review_cycle,
            "Workflow transition applied"
        );

        Ok(Transition {
            proposal: next,
            effects,
        })
    }

    fn check_preconditions(
        &self,
        proposal: &Proposal,
        action: &WorkflowAction,
        ctx: &TransitionContext<'_>,
    ) -> Result<(), WorkflowError> {
        match action {
            WorkflowAction::AssignCouncil { council } => {
                if let Some(current) = &proposal.council_id {
                    return Err(WorkflowError::invalid_field(
                        "council_id",
                        format!(
                            "proposal '{}' already has council '{current}'; use CHANGE_COUNCIL",
                            proposal.id
                        ),
                    ));
                }
                check_council_fits(proposal, council)
            }
            WorkflowAction::ChangeCouncil { council, .. } => {
                match proposal.council_id.as_deref() {
                    None => Err(WorkflowError::precondition(format!(
                        "proposal '{}' has no council to change",
                        proposal.id
                    ))),
                    Some(current) if current == council.id => Err(WorkflowError::invalid_field(
                        "council_id",
                        format!("council '{current}' is already assigned"),
                    )),
                    Some(_) => check_council_fits(proposal, council),
                }
            }
            WorkflowAction::Approve { .. } => match &ctx.finalization {
                Some(finalization) => {
                    if proposal.current_finalization().is_some() {
                        return Err(WorkflowError::precondition(format!(
                            "review cycle {} of proposal '{}' is already finalized",
                            proposal.review_cycle, proposal.id
                        )));
                    }
                    check_finalization_matches(proposal, finalization)
                }
                None => {
                    if proposal.council_id.is_none() || !ctx.evaluations_complete {
                        return Err(WorkflowError::precondition(
                            "board approval requires every council evaluation to be submitted",
                        ));
                    }
                    Ok(())
                }
            },
            WorkflowAction::RequestChanges { .. } => match &ctx.finalization {
                Some(finalization) => {
                    if proposal.current_finalization().is_some() {
                        return Err(WorkflowError::precondition(format!(
                            "review cycle {} of proposal '{}' is already finalized",
                            proposal.review_cycle, proposal.id
                        )));
                    }
                    check_finalization_matches(proposal, finalization)
                }
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

fn check_council_fits(proposal: &Proposal, council: &Council) -> Result<(), WorkflowError> {
    if !proposal
        .state
        .accepted_council_types()
        .contains(&council.council_type)
    {
        return Err(WorkflowError::invalid_field(
            "council_id",
            format!(
                "a {} council cannot review a proposal in {}",
                council.council_type, proposal.state
            ),
        ));
    }
    if council.council_type.is_faculty()
        && council.faculty_id.as_deref() != Some(proposal.faculty_id.as_str())
    {
        return Err(WorkflowError::invalid_field(
            "council_id",
            format!(
                "council '{}' does not belong to faculty '{}'",
                council.id, proposal.faculty_id
            ),
        ));
    }
    Ok(())
}

fn check_finalization_matches(
    proposal: &Proposal,
    finalization: &CouncilFinalization,
) -> Result<(), WorkflowError> {
    if proposal.council_id.as_deref() != Some(finalization.council_id.as_str())
        || finalization.cycle != proposal.review_cycle
    {
        return Err(WorkflowError::precondition(format!(
            "finalization for council '{}' cycle {} does not match the current review of proposal '{}'",
            finalization.council_id, finalization.cycle, proposal.id
        )));
    }
    Ok(())
}

/// Holder derived from state and council assignment. Narrowing to the
/// secretary once every evaluation is in is layered on top by `apply` and by
/// the service after the last submission.
pub fn holder_for(proposal: &Proposal) -> (Option<String>, Option<HolderUnit>) {
    match proposal.state {
        ProposalState::Draft | ProposalState::ChangesRequested | ProposalState::InProgress => {
            (Some(proposal.owner_id.clone()), None)
        }
        state if state.is_review() => match &proposal.council_id {
            Some(council_id) => (None, Some(HolderUnit::Council(council_id.clone()))),
            None if state.is_faculty_review() => {
                (None, Some(HolderUnit::Faculty(proposal.faculty_id.clone())))
            }
            None => (None, Some(HolderUnit::ScienceOffice)),
        },
        ProposalState::Approved | ProposalState::Paused => (None, Some(HolderUnit::ScienceOffice)),
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Conclusion, CouncilType, NewProposal, ScoreAggregate, UserRole};

    fn owner() -> Actor {
        Actor::new("gv01", UserRole::GiangVien).with_faculty("CNTT")
    }

    fn manager() -> Actor {
        Actor::new("qlk", UserRole::QuanLyKhoa).with_faculty("CNTT")
    }

    fn office() -> Actor {
        Actor::new("khcn", UserRole::PhongKhcn)
    }

    fn draft() -> Proposal {
        Proposal::new(
            "gv01",
            NewProposal {
                code: "NCKH-2025-007".to_string(),
                title: "Edge inference".to_string(),
                faculty_id: "CNTT".to_string(),
                form_data: serde_json::json!({"budget": 120}),
            },
            Utc::now(),
        )
    }

    fn faculty_council(id: &str) -> Council {
        Council {
            id: id.to_string(),
            name: "HD khoa".to_string(),
            council_type: CouncilType::FacultyOutline,
            faculty_id: Some("CNTT".to_string()),
            secretary_id: "tk".to_string(),
            chair_id: None,
            member_ids: ["tk", "m1", "m2", "m3"].into_iter().map(String::from).collect(),
            created_at: Utc::now(),
        }
    }

    fn apply(proposal: &Proposal, action: WorkflowAction, actor: &Actor) -> Result<Proposal, WorkflowError> {
        let ctx = TransitionContext::new(actor, Utc::now());
        ProposalStateMachine::new()
            .apply(proposal, &action, &ctx)
            .map(|t| t.proposal)
    }

    #[test]
    fn test_submit_moves_draft_to_faculty_review_held_by_faculty() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();

        assert_eq!(submitted.state, ProposalState::FacultyCouncilOutlineReview);
        assert_eq!(submitted.review_cycle, 1);
        assert_eq!(submitted.holder_user_id, None);
        assert_eq!(
            submitted.holder_unit,
            Some(HolderUnit::Faculty("CNTT".to_string()))
        );
        assert_eq!(submitted.workflow_log.len(), 1);
        assert_eq!(submitted.workflow_log[0].from_state, ProposalState::Draft);
    }

    #[test]
    fn test_non_owner_lecturer_cannot_submit() {
        let stranger = Actor::new("gv02", UserRole::GiangVien);
        let err = apply(&draft(), WorkflowAction::Submit, &stranger).unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
    }

    #[test]
    fn test_expected_target_mismatch_is_not_coerced() {
        let actor = owner();
        let ctx = TransitionContext::new(&actor, Utc::now())
            .with_expected_target(Some(ProposalState::SchoolCouncilOutlineReview));
        let err = ProposalStateMachine::new()
            .apply(&draft(), &WorkflowAction::Submit, &ctx)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_assigning_council_sets_council_holder() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let assigned = apply(
            &submitted,
            WorkflowAction::AssignCouncil {
                council: faculty_council("c1"),
            },
            &manager(),
        )
        .unwrap();

        assert_eq!(assigned.state, ProposalState::FacultyCouncilOutlineReview);
        assert_eq!(assigned.council_id.as_deref(), Some("c1"));
        assert_eq!(assigned.holder_unit, Some(HolderUnit::Council("c1".to_string())));
        assert_eq!(assigned.review_cycle, 1);
    }

    #[test]
    fn test_council_type_must_match_stage() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let mut school = faculty_council("c2");
        school.council_type = CouncilType::Outline;
        school.faculty_id = None;

        let err = apply(
            &submitted,
            WorkflowAction::AssignCouncil { council: school },
            &manager(),
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("council_id"));
    }

    #[test]
    fn test_change_council_starts_new_cycle() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let assigned = apply(
            &submitted,
            WorkflowAction::AssignCouncil {
                council: faculty_council("c1"),
            },
            &manager(),
        )
        .unwrap();
        let changed = apply(
            &assigned,
            WorkflowAction::ChangeCouncil {
                council: faculty_council("c2"),
                reason: Some("conflict of interest".to_string()),
            },
            &manager(),
        )
        .unwrap();

        assert_eq!(changed.review_cycle, assigned.review_cycle + 1);
        assert_eq!(changed.council_id.as_deref(), Some("c2"));
        assert!(changed.council_history[0].replaced_at.is_some());
        assert!(changed.council_history[1].replaced_at.is_none());
    }

    #[test]
    fn test_request_changes_requires_reason_and_logs_return() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let err = apply(
            &submitted,
            WorkflowAction::RequestChanges {
                reason: "  ".to_string(),
                requested_revisions: vec![],
            },
            &manager(),
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("reason"));

        let returned = apply(
            &submitted,
            WorkflowAction::RequestChanges {
                reason: "budget unclear".to_string(),
                requested_revisions: vec!["itemize budget".to_string()],
            },
            &manager(),
        )
        .unwrap();
        assert_eq!(returned.state, ProposalState::ChangesRequested);
        assert_eq!(returned.holder_user_id.as_deref(), Some("gv01"));
        let log = returned.latest_return_log().unwrap();
        assert_eq!(log.returned_from, ProposalState::FacultyCouncilOutlineReview);
        assert_eq!(log.requested_revisions, vec!["itemize budget".to_string()]);

        let resubmitted = apply(&returned, WorkflowAction::Submit, &owner()).unwrap();
        assert_eq!(resubmitted.state, ProposalState::FacultyCouncilOutlineReview);
        assert_eq!(resubmitted.review_cycle, returned.review_cycle + 1);
    }

    #[test]
    fn test_pause_and_resume_restore_origin() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let paused = apply(
            &submitted,
            WorkflowAction::Pause {
                reason: Some("funding freeze".to_string()),
            },
            &office(),
        )
        .unwrap();
        assert_eq!(paused.state, ProposalState::Paused);
        assert_eq!(paused.holder_unit, Some(HolderUnit::ScienceOffice));

        let resumed = apply(&paused, WorkflowAction::Resume, &office()).unwrap();
        assert_eq!(resumed.state, ProposalState::FacultyCouncilOutlineReview);
        assert_eq!(resumed.paused_from, None);
    }

    #[test]
    fn test_resume_with_complete_roster_narrows_to_secretary() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let council = faculty_council("c1");
        let assigned = apply(
            &submitted,
            WorkflowAction::AssignCouncil {
                council: council.clone(),
            },
            &manager(),
        )
        .unwrap();
        let paused = apply(&assigned, WorkflowAction::Pause { reason: Some("audit".to_string()) }, &office())
            .unwrap();

        let actor = office();
        let ctx = TransitionContext::new(&actor, Utc::now())
            .with_council(Some(&council))
            .with_evaluations_complete(true);
        let resumed = ProposalStateMachine::new()
            .apply(&paused, &WorkflowAction::Resume, &ctx)
            .unwrap()
            .proposal;
        assert_eq!(resumed.holder_user_id.as_deref(), Some("tk"));
        assert_eq!(resumed.holder_unit, Some(HolderUnit::Council("c1".to_string())));

        let ctx = TransitionContext::new(&actor, Utc::now()).with_council(Some(&council));
        let resumed = ProposalStateMachine::new()
            .apply(&paused, &WorkflowAction::Resume, &ctx)
            .unwrap()
            .proposal;
        assert_eq!(resumed.holder_user_id, None);
    }

    #[test]
    fn test_withdraw_only_from_editable_states() {
        let withdrawn = apply(&draft(), WorkflowAction::Withdraw { reason: None }, &owner()).unwrap();
        assert_eq!(withdrawn.state, ProposalState::Withdrawn);
        assert_eq!(withdrawn.holder_user_id, None);

        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let err = apply(&submitted, WorkflowAction::Withdraw { reason: None }, &owner()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_finalization_records_and_advances_in_one_snapshot() {
        let submitted = apply(&draft(), WorkflowAction::Submit, &owner()).unwrap();
        let council = faculty_council("c1");
        let assigned = apply(
            &submitted,
            WorkflowAction::AssignCouncil {
                council: council.clone(),
            },
            &manager(),
        )
        .unwrap();

        let secretary = Actor::new("tk", UserRole::GiangVien);
        let finalization = CouncilFinalization {
            proposal_id: assigned.id.clone(),
            council_id: "c1".to_string(),
            cycle: assigned.review_cycle,
            final_conclusion: Conclusion::Pass,
            final_comments: "sound".to_string(),
            finalized_by: "tk".to_string(),
            finalized_at: Utc::now(),
            aggregate: ScoreAggregate::default(),
        };
        let ctx = TransitionContext::new(&secretary, Utc::now())
            .with_council(Some(&council))
            .with_evaluations_complete(true)
            .with_finalization(finalization);

        let transition = ProposalStateMachine::new()
            .apply(
                &assigned,
                &WorkflowAction::Approve {
                    reason: Some("sound".to_string()),
                },
                &ctx,
            )
            .unwrap();

        let next = transition.proposal;
        assert_eq!(next.state, ProposalState::SchoolCouncilOutlineReview);
        assert_eq!(next.finalizations.len(), 1);
        assert_eq!(next.council_id, None);
        assert_eq!(next.review_cycle, assigned.review_cycle + 1);
        assert_eq!(next.holder_unit, Some(HolderUnit::ScienceOffice));
        assert!(matches!(transition.effects[0], Effect::CouncilFinalized { .. }));
    }

    #[test]
    fn test_board_approval_requires_complete_evaluations() {
        let mut proposal = draft();
        proposal.state = ProposalState::SchoolCouncilOutlineReview;
        proposal.council_id = Some("c9".to_string());
        let board = Actor::new("bgh", UserRole::BanGiamHoc);

        let err = apply(&proposal, WorkflowAction::Approve { reason: None }, &board).unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));

        let ctx = TransitionContext::new(&board, Utc::now()).with_evaluations_complete(true);
        let approved = ProposalStateMachine::new()
            .apply(&proposal, &WorkflowAction::Approve { reason: None }, &ctx)
            .unwrap()
            .proposal;
        assert_eq!(approved.state, ProposalState::Approved);
    }
}
