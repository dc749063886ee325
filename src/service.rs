//! Workflow service: the action-oriented facade over the state machine,
//! council registry, evaluation roster and idempotency guard.
//!
//! Every mutating operation follows the same path: the idempotency guard
//! decides whether to run it, the current proposal snapshot is read, the state
//! machine (or the evaluation rules) validates and builds the next snapshot,
//! and one compare-and-swap commits it. Effects are dispatched only after the
//! commit and only for fresh executions, never for replays.

use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn, Instrument};

use crate::config::NckhFlowConfig;
use crate::council::{CouncilRegistry, FacultyDirectory};
use crate::domain::{
    ActionOutcome, ActionRequest, ActionType, Actor, ChangeCouncilPayload, Conclusion, Council,
    CouncilFinalization, CouncilPayload, CouncilSpec, Evaluation, EvaluationOutcome,
    EvaluationPatch, FinalizePayload, FormPayload, NewProposal, Proposal, ReasonPayload,
    ReturnPayload, ScoreAggregate, UserRole, WorkflowLogEntry,
};
use crate::effects::{Effect, EffectSink, NoopEffectSink, Recipient};
use crate::errors::WorkflowError;
use crate::evaluation::{compute_aggregate, EvaluationRoster};
use crate::idempotency::{Execution, IdempotencyGuard};
use crate::observability::{OperationTimer, WorkflowMetrics, WorkflowStats};
use crate::store::{bounded, Repository};
use crate::telemetry::{create_action_span, generate_correlation_id};
use crate::workflows::{self, GateContext, ProposalStateMachine, TransitionContext, WorkflowAction};

static PROPOSAL_CODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{1,63}$").ok());

const HOLDER_NARROWING_ATTEMPTS: usize = 3;
const MAX_RETENTION_HOURS: u64 = 24 * 365 * 100;

/// Results that carry post-commit effects.
trait HasEffects {
    fn effects(&self) -> &[Effect];
}

impl HasEffects for ActionOutcome {
    fn effects(&self) -> &[Effect] {
        &self.effects
    }
}

impl HasEffects for EvaluationOutcome {
    fn effects(&self) -> &[Effect] {
        &self.effects
    }
}

/// Transition whose inputs may still need loading.
enum PendingAction {
    Ready(WorkflowAction),
    AssignCouncil {
        council_id: String,
    },
    ChangeCouncil {
        council_id: String,
        reason: Option<String>,
    },
}

impl PendingAction {
    fn action_type(&self) -> ActionType {
        match self {
            PendingAction::Ready(action) => action.action_type(),
            PendingAction::AssignCouncil { .. } => ActionType::AssignCouncil,
            PendingAction::ChangeCouncil { .. } => ActionType::ChangeCouncil,
        }
    }
}

pub struct WorkflowService {
    repo: Repository,
    registry: CouncilRegistry,
    guard: IdempotencyGuard,
    machine: ProposalStateMachine,
    sink: Arc<dyn EffectSink>,
    metrics: Arc<WorkflowMetrics>,
    timeout: Duration,
    retention: chrono::Duration,
}

impl std::fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowService")
            .field("registry", &self.registry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WorkflowService {
    pub fn new(
        repo: Repository,
        directory: Arc<dyn FacultyDirectory>,
        config: &NckhFlowConfig,
    ) -> Self {
        let timeout = Duration::from_millis(config.store.timeout_ms);
        Self {
            guard: IdempotencyGuard::new(repo.idempotency.clone(), timeout),
            registry: CouncilRegistry::new(directory, config.council.clone()),
            repo,
            machine: ProposalStateMachine::new(),
            sink: Arc::new(NoopEffectSink),
            metrics: Arc::new(WorkflowMetrics::new()),
            timeout,
            retention: chrono::Duration::hours(
                i64::try_from(config.idempotency.retention_hours.min(MAX_RETENTION_HOURS))
                    .unwrap_or(0),
            ),
        }
    }

    pub fn with_effect_sink(mut self, sink: Arc<dyn EffectSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn metrics(&self) -> WorkflowStats {
        self.metrics.get_stats()
    }

    pub fn log_metrics(&self) {
        self.metrics.log_stats();
    }

    // ---- proposal lifecycle -------------------------------------------------

    /// Creates a DRAFT owned by `actor`.
    pub async fn create_proposal(
        &self,
        actor: &Actor,
        input: NewProposal,
    ) -> Result<Proposal, WorkflowError> {
        require_identity(actor)?;
        if actor.role != UserRole::GiangVien {
            return Err(WorkflowError::unauthorized(format!(
                "{} may not create proposals",
                actor.role
            )));
        }
        let code_ok = PROPOSAL_CODE
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&input.code));
        if !code_ok {
            return Err(WorkflowError::invalid_field(
                "code",
                format!("'{}' is not a valid proposal code", input.code),
            ));
        }
        if input.title.trim().is_empty() {
            return Err(WorkflowError::invalid_field("title", "title is required"));
        }
        if let Some(own) = &actor.faculty_id {
            if *own != input.faculty_id {
                return Err(WorkflowError::invalid_field(
                    "faculty_id",
                    format!("lecturer of faculty '{own}' cannot file for '{}'", input.faculty_id),
                ));
            }
        }
        check_form_data(&input.form_data)?;

        let proposal = Proposal::new(actor.id.clone(), input, Utc::now());
        bounded(
            "proposal.insert",
            self.timeout,
            self.repo.proposals.insert(proposal.clone()),
        )
        .await?;
        info!(proposal_id = %proposal.id, code = %proposal.code, owner_id = %actor.id, "Proposal created");
        Ok(proposal)
    }

    /// Owner edits the form while the proposal is DRAFT or CHANGES_REQUESTED.
    pub async fn update_proposal_form(
        &self,
        request: ActionRequest<FormPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let span = self.span(ActionType::UpdateProposalForm, &request);
        async {
            let result = self
                .guard
                .execute(
                    request.idempotency_key.as_deref(),
                    &request.proposal_id,
                    ActionType::UpdateProposalForm,
                    || async {
                        let proposal = self.load_proposal(&request.proposal_id).await?;
                        check_expected_version(&proposal, request.expected_version)?;
                        let gate = GateContext {
                            actor: &request.actor,
                            council: None,
                            via_finalization: false,
                        };
                        workflows::authorize(ActionType::UpdateProposalForm, &proposal, &gate)?;
                        check_form_data(&request.payload.form_data)?;

                        let mut next = proposal.clone();
                        next.form_data = request.payload.form_data.clone();
                        next.updated_at = Utc::now();
                        let committed = self.commit(proposal.version, next).await?;
                        Ok(ActionOutcome {
                            proposal_id: committed.id,
                            new_state: committed.state,
                            version: committed.version,
                            effects: Vec::new(),
                        })
                    },
                )
                .await;
            self.settle(result)
        }
        .instrument(span)
        .await
    }

    pub async fn submit_proposal(
        &self,
        request: ActionRequest<()>,
    ) -> Result<ActionOutcome, WorkflowError> {
        self.apply_action(&request, PendingAction::Ready(WorkflowAction::Submit))
            .await
    }

    pub async fn assign_council(
        &self,
        request: ActionRequest<CouncilPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let pending = PendingAction::AssignCouncil {
            council_id: request.payload.council_id.clone(),
        };
        self.apply_action(&request, pending).await
    }

    pub async fn change_council(
        &self,
        request: ActionRequest<ChangeCouncilPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let pending = PendingAction::ChangeCouncil {
            council_id: request.payload.council_id.clone(),
            reason: request.payload.reason.clone(),
        };
        self.apply_action(&request, pending).await
    }

    pub async fn request_changes(
        &self,
        request: ActionRequest<ReturnPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action = WorkflowAction::RequestChanges {
            reason: request.payload.reason.clone(),
            requested_revisions: request.payload.requested_revisions.clone(),
        };
        self.apply_action(&request, PendingAction::Ready(action)).await
    }

    /// Direct approval. Council members approve through
    /// [`finalize_council_evaluation`](Self::finalize_council_evaluation).
    pub async fn approve(
        &self,
        request: ActionRequest<ReasonPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action = WorkflowAction::Approve {
            reason: request.payload.reason.clone(),
        };
        self.apply_action(&request, PendingAction::Ready(action)).await
    }

    pub async fn reject(
        &self,
        request: ActionRequest<ReasonPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action = WorkflowAction::Reject {
            reason: request.payload.reason.clone(),
        };
        self.apply_action(&request, PendingAction::Ready(action)).await
    }

    pub async fn cancel(
        &self,
        request: ActionRequest<ReasonPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action = WorkflowAction::Cancel {
            reason: request.payload.reason.clone(),
        };
        self.apply_action(&request, PendingAction::Ready(action)).await
    }

    pub async fn withdraw(
        &self,
        request: ActionRequest<ReasonPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action = WorkflowAction::Withdraw {
            reason: request.payload.reason.clone(),
        };
        self.apply_action(&request, PendingAction::Ready(action)).await
    }

    pub async fn pause(
        &self,
        request: ActionRequest<ReasonPayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action = WorkflowAction::Pause {
            reason: request.payload.reason.clone(),
        };
        self.apply_action(&request, PendingAction::Ready(action)).await
    }

    pub async fn resume(&self, request: ActionRequest<()>) -> Result<ActionOutcome, WorkflowError> {
        self.apply_action(&request, PendingAction::Ready(WorkflowAction::Resume))
            .await
    }

    pub async fn start_implementation(
        &self,
        request: ActionRequest<()>,
    ) -> Result<ActionOutcome, WorkflowError> {
        self.apply_action(
            &request,
            PendingAction::Ready(WorkflowAction::StartImplementation),
        )
        .await
    }

    // ---- councils -----------------------------------------------------------

    /// Faculty councils are created by the faculty's manager, school councils
    /// by the science office.
    pub async fn create_council(
        &self,
        actor: &Actor,
        spec: CouncilSpec,
    ) -> Result<Council, WorkflowError> {
        require_identity(actor)?;
        authorize_council_admin(actor, spec.council_type.is_faculty(), spec.faculty_id.as_deref())?;
        let council = self.registry.build(spec, Utc::now())?;
        bounded(
            "council.insert",
            self.timeout,
            self.repo.councils.insert(council.clone()),
        )
        .await?;
        info!(
            council_id = %council.id,
            council_type = %council.council_type,
            created_by = %actor.id,
            "Council created"
        );
        Ok(council)
    }

    pub async fn delete_council(&self, actor: &Actor, council_id: &str) -> Result<(), WorkflowError> {
        require_identity(actor)?;
        let council = self.load_council(council_id).await?;
        authorize_council_admin(
            actor,
            council.council_type.is_faculty(),
            council.faculty_id.as_deref(),
        )?;
        let ensure_unreferenced =
            |proposals: &[Proposal]| self.registry.ensure_deletable(council_id, proposals);
        let deleted = bounded(
            "council.delete",
            self.timeout,
            self.repo
                .councils
                .delete_if_unreferenced(council_id, &ensure_unreferenced),
        )
        .await?;
        if !deleted {
            return Err(WorkflowError::not_found("council", council_id));
        }
        info!(council_id, deleted_by = %actor.id, "Council deleted");
        Ok(())
    }

    // ---- evaluations --------------------------------------------------------

    /// Opens the caller's evaluation for the current review cycle, creating a
    /// DRAFT on first access.
    pub async fn get_or_create_evaluation(
        &self,
        request: ActionRequest<()>,
    ) -> Result<EvaluationOutcome, WorkflowError> {
        let span = self.span(ActionType::GetOrCreateEvaluation, &request);
        async {
            let result = self
                .guard
                .execute(
                    request.idempotency_key.as_deref(),
                    &request.proposal_id,
                    ActionType::GetOrCreateEvaluation,
                    || async {
                        let (proposal, council) = self.eligible_evaluator(&request).await?;
                        let role = council
                            .role_of(&request.actor.id)
                            .unwrap_or(crate::domain::CouncilRole::Member);
                        let draft = Evaluation::new_draft(
                            proposal.id.clone(),
                            council.id.clone(),
                            proposal.review_cycle,
                            request.actor.id.clone(),
                            role,
                            Utc::now(),
                        );
                        let (evaluation, created) = bounded(
                            "evaluation.get_or_insert",
                            self.timeout,
                            self.repo.evaluations.get_or_insert(draft),
                        )
                        .await?;

                        let mut effects = Vec::new();
                        if created {
                            effects.push(Effect::EvaluationOpened {
                                proposal_id: proposal.id.clone(),
                                evaluator_id: request.actor.id.clone(),
                                cycle: proposal.review_cycle,
                            });
                        }
                        Ok(EvaluationOutcome {
                            proposal_state: proposal.state,
                            evaluation,
                            effects,
                        })
                    },
                )
                .await;
            self.settle(result)
        }
        .instrument(span)
        .await
    }

    pub async fn update_evaluation_draft(
        &self,
        request: ActionRequest<EvaluationPatch>,
    ) -> Result<EvaluationOutcome, WorkflowError> {
        let span = self.span(ActionType::UpdateEvaluationDraft, &request);
        async {
            let result = self
                .guard
                .execute(
                    request.idempotency_key.as_deref(),
                    &request.proposal_id,
                    ActionType::UpdateEvaluationDraft,
                    || async {
                        let (proposal, _council) = self.eligible_evaluator(&request).await?;
                        let mut evaluation = self.load_evaluation(&proposal, &request.actor).await?;
                        let loaded_version = evaluation.version;
                        evaluation.apply_patch(&request.payload, Utc::now())?;
                        let evaluation = bounded(
                            "evaluation.replace",
                            self.timeout,
                            self.repo.evaluations.replace_draft(loaded_version, evaluation),
                        )
                        .await?;
                        Ok(EvaluationOutcome {
                            proposal_state: proposal.state,
                            evaluation,
                            effects: Vec::new(),
                        })
                    },
                )
                .await;
            self.settle(result)
        }
        .instrument(span)
        .await
    }

    /// Submits the caller's evaluation. Once every voting member has
    /// submitted, the holder narrows to the council secretary.
    pub async fn submit_evaluation(
        &self,
        request: ActionRequest<()>,
    ) -> Result<EvaluationOutcome, WorkflowError> {
        let span = self.span(ActionType::SubmitEvaluation, &request);
        async {
            let result = self
                .guard
                .execute(
                    request.idempotency_key.as_deref(),
                    &request.proposal_id,
                    ActionType::SubmitEvaluation,
                    || async {
                        let (proposal, council) = self.eligible_evaluator(&request).await?;
                        let mut evaluation = self.load_evaluation(&proposal, &request.actor).await?;
                        let loaded_version = evaluation.version;
                        evaluation.submit(Utc::now())?;
                        let evaluation = bounded(
                            "evaluation.replace",
                            self.timeout,
                            self.repo.evaluations.replace_draft(loaded_version, evaluation),
                        )
                        .await?;
                        self.metrics.record_evaluation_submitted();

                        let roster = self.roster(&proposal, &council).await?;
                        let mut effects = vec![Effect::EvaluationSubmitted {
                            proposal_id: proposal.id.clone(),
                            evaluator_id: request.actor.id.clone(),
                            submitted_count: roster.submitted_count,
                            total_members: roster.total_members,
                        }];
                        info!(
                            proposal_id = %proposal.id,
                            evaluator_id = %request.actor.id,
                            submitted = roster.submitted_count,
                            total = roster.total_members,
                            "Evaluation submitted"
                        );
                        if roster.all_submitted {
                            self.narrow_holder_to_secretary(&proposal.id, &council, proposal.review_cycle)
                                .await;
                            effects.push(Effect::Notify {
                                proposal_id: proposal.id.clone(),
                                recipient: Recipient::User(council.secretary_id.clone()),
                                subject: format!(
                                    "{}: all {} evaluations submitted, ready to finalize",
                                    proposal.code, roster.total_members
                                ),
                            });
                        }
                        Ok(EvaluationOutcome {
                            proposal_state: proposal.state,
                            evaluation,
                            effects,
                        })
                    },
                )
                .await;
            self.settle(result)
        }
        .instrument(span)
        .await
    }

    /// The secretary's binding decision: records the finalization and moves
    /// the proposal (APPROVE on PASS, REQUEST_CHANGES on FAIL) in one commit.
    pub async fn finalize_council_evaluation(
        &self,
        request: ActionRequest<FinalizePayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let span = self.span(ActionType::FinalizeCouncilEvaluation, &request);
        async {
            let result = self
                .guard
                .execute(
                    request.idempotency_key.as_deref(),
                    &request.proposal_id,
                    ActionType::FinalizeCouncilEvaluation,
                    || self.finalize_once(&request),
                )
                .await;
            if result.as_ref().is_ok_and(|r| !r.is_replay()) {
                self.metrics.record_finalization();
            }
            self.settle(result)
        }
        .instrument(span)
        .await
    }

    async fn finalize_once(
        &self,
        request: &ActionRequest<FinalizePayload>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action_type = ActionType::FinalizeCouncilEvaluation;
        let proposal = self.load_proposal(&request.proposal_id).await?;
        check_expected_version(&proposal, request.expected_version)?;
        if !proposal.state.is_review() {
            return Err(WorkflowError::InvalidStateTransition {
                action: action_type,
                from: proposal.state,
            });
        }
        let council_id = proposal.council_id.clone().ok_or_else(|| {
            WorkflowError::precondition(format!("proposal '{}' has no council assigned", proposal.id))
        })?;
        let council = self.load_council(&council_id).await?;
        if !council.is_secretary(&request.actor.id) {
            return Err(WorkflowError::unauthorized(format!(
                "only the secretary of council '{}' may finalize",
                council.id
            )));
        }
        let conclusion = request.payload.final_conclusion.ok_or_else(|| {
            WorkflowError::invalid_field("final_conclusion", "a final conclusion is required")
        })?;
        let comments = request.payload.final_comments.trim().to_string();
        if conclusion == Conclusion::Fail && comments.is_empty() {
            return Err(WorkflowError::invalid_field(
                "final_comments",
                "a failing conclusion must explain what to change",
            ));
        }

        let roster = self.roster(&proposal, &council).await?;
        if !roster.all_submitted {
            return Err(WorkflowError::precondition(format!(
                "{} of {} evaluations submitted",
                roster.submitted_count, roster.total_members
            )));
        }

        let now = Utc::now();
        let finalization = CouncilFinalization {
            proposal_id: proposal.id.clone(),
            council_id: council.id.clone(),
            cycle: proposal.review_cycle,
            final_conclusion: conclusion,
            final_comments: comments.clone(),
            finalized_by: request.actor.id.clone(),
            finalized_at: now,
            aggregate: roster.aggregate,
        };
        let action = match conclusion {
            Conclusion::Pass => WorkflowAction::Approve {
                reason: Some(comments).filter(|c| !c.is_empty()),
            },
            Conclusion::Fail => WorkflowAction::RequestChanges {
                reason: comments,
                requested_revisions: Vec::new(),
            },
        };
        let ctx = TransitionContext::new(&request.actor, now)
            .with_council(Some(&council))
            .with_evaluations_complete(true)
            .with_finalization(finalization)
            .with_expected_target(request.expected_target);
        let transition = self.machine.apply(&proposal, &action, &ctx)?;
        let committed = self.commit(proposal.version, transition.proposal).await?;

        info!(
            proposal_id = %committed.id,
            council_id = %council.id,
            conclusion = ?conclusion,
            new_state = %committed.state,
            "Council evaluation finalized"
        );
        Ok(ActionOutcome {
            proposal_id: committed.id,
            new_state: committed.state,
            version: committed.version,
            effects: transition.effects,
        })
    }

    // ---- reads --------------------------------------------------------------

    pub async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, WorkflowError> {
        self.load_proposal(proposal_id).await
    }

    pub async fn get_council(&self, council_id: &str) -> Result<Council, WorkflowError> {
        self.load_council(council_id).await
    }

    /// Roster of the current cycle. Only the assigned council's secretary may read it.
    pub async fn get_all_evaluations(
        &self,
        proposal_id: &str,
        requester: &Actor,
    ) -> Result<EvaluationRoster, WorkflowError> {
        let proposal = self.load_proposal(proposal_id).await?;
        let council_id = proposal.council_id.clone().ok_or_else(|| {
            WorkflowError::precondition(format!("proposal '{proposal_id}' has no council assigned"))
        })?;
        let council = self.load_council(&council_id).await?;
        if !council.is_secretary(&requester.id) {
            return Err(WorkflowError::unauthorized(format!(
                "only the secretary of council '{}' may read all evaluations",
                council.id
            )));
        }
        self.roster(&proposal, &council).await
    }

    /// Aggregate over the submitted evaluations of the current cycle.
    pub async fn get_aggregate_scores(
        &self,
        proposal_id: &str,
    ) -> Result<ScoreAggregate, WorkflowError> {
        let proposal = self.load_proposal(proposal_id).await?;
        let evaluations = self.evaluations_of(&proposal.id).await?;
        Ok(compute_aggregate(
            evaluations.iter().filter(|e| e.cycle == proposal.review_cycle),
        ))
    }

    pub async fn get_workflow_log(
        &self,
        proposal_id: &str,
    ) -> Result<Vec<WorkflowLogEntry>, WorkflowError> {
        Ok(self.load_proposal(proposal_id).await?.workflow_log)
    }

    /// Actions `actor` could take on the proposal right now.
    pub async fn available_actions(
        &self,
        proposal_id: &str,
        actor: &Actor,
    ) -> Result<Vec<ActionType>, WorkflowError> {
        let proposal = self.load_proposal(proposal_id).await?;
        let mut actions = workflows::available_actions(&proposal, actor);

        let council = self.current_council(&proposal).await?;
        let roster = match (&council, proposal.state.is_review()) {
            (Some(council), true) => Some(self.roster(&proposal, council).await?),
            _ => None,
        };
        let all_submitted = roster.as_ref().is_some_and(|r| r.all_submitted);
        if actor.role == UserRole::BanGiamHoc && !all_submitted {
            actions.retain(|a| *a != ActionType::Approve);
        }

        if let (Some(council), Some(roster)) = (&council, &roster) {
            if council.is_voting_member(&actor.id) && actor.role.can_sit_on_council() {
                let own = roster
                    .entries
                    .iter()
                    .find(|e| e.evaluator_id == actor.id)
                    .and_then(|e| e.evaluation.as_ref());
                actions.push(ActionType::GetOrCreateEvaluation);
                if own.is_some_and(|e| !e.is_submitted()) {
                    actions.push(ActionType::UpdateEvaluationDraft);
                    actions.push(ActionType::SubmitEvaluation);
                }
            }
            if council.is_secretary(&actor.id)
                && roster.all_submitted
                && proposal.current_finalization().is_none()
            {
                actions.push(ActionType::FinalizeCouncilEvaluation);
            }
        }
        Ok(actions)
    }

    /// Drops idempotency records older than the configured retention.
    pub async fn purge_expired_idempotency(&self) -> Result<usize, WorkflowError> {
        self.guard.purge_expired(self.retention).await
    }

    // ---- internals ----------------------------------------------------------

    fn span<P>(&self, action: ActionType, request: &ActionRequest<P>) -> tracing::Span {
        create_action_span(
            action.as_str(),
            Some(&request.proposal_id),
            Some(&request.actor.id),
            &generate_correlation_id(),
        )
    }

    async fn apply_action<P: Sync>(
        &self,
        request: &ActionRequest<P>,
        pending: PendingAction,
    ) -> Result<ActionOutcome, WorkflowError> {
        let action_type = pending.action_type();
        let span = self.span(action_type, request);
        async {
            let timer = OperationTimer::new("apply_action");
            let result = self
                .guard
                .execute(
                    request.idempotency_key.as_deref(),
                    &request.proposal_id,
                    action_type,
                    || self.transition_once(request, pending),
                )
                .await;
            timer.finish();
            self.settle(result)
        }
        .instrument(span)
        .await
    }

    async fn transition_once<P: Sync>(
        &self,
        request: &ActionRequest<P>,
        pending: PendingAction,
    ) -> Result<ActionOutcome, WorkflowError> {
        require_identity(&request.actor)?;
        let action = match pending {
            PendingAction::Ready(action) => action,
            PendingAction::AssignCouncil { council_id } => WorkflowAction::AssignCouncil {
                council: self.load_council(&council_id).await?,
            },
            PendingAction::ChangeCouncil { council_id, reason } => WorkflowAction::ChangeCouncil {
                council: self.load_council(&council_id).await?,
                reason,
            },
        };

        let proposal = self.load_proposal(&request.proposal_id).await?;
        check_expected_version(&proposal, request.expected_version)?;
        let council = self.current_council(&proposal).await?;
        let evaluations_complete = match (&action, &council) {
            (WorkflowAction::Approve { .. }, Some(council)) if proposal.state.is_review() => {
                self.roster(&proposal, council).await?.all_submitted
            }
            (WorkflowAction::Resume, Some(council))
                if proposal.paused_from.is_some_and(|s| s.is_review()) =>
            {
                self.roster(&proposal, council).await?.all_submitted
            }
            _ => false,
        };

        let ctx = TransitionContext::new(&request.actor, Utc::now())
            .with_council(council.as_ref())
            .with_evaluations_complete(evaluations_complete)
            .with_expected_target(request.expected_target);
        let transition = self.machine.apply(&proposal, &action, &ctx)?;
        let committed = self.commit(proposal.version, transition.proposal).await?;

        Ok(ActionOutcome {
            proposal_id: committed.id,
            new_state: committed.state,
            version: committed.version,
            effects: transition.effects,
        })
    }

    /// Records metrics and dispatches effects for fresh executions.
    fn settle<T: HasEffects>(
        &self,
        result: Result<Execution<T>, WorkflowError>,
    ) -> Result<T, WorkflowError> {
        match result {
            Ok(Execution::Executed(outcome)) => {
                self.metrics.record_applied();
                self.sink.dispatch(outcome.effects());
                Ok(outcome)
            }
            Ok(Execution::Replayed(outcome)) => {
                self.metrics.record_replay();
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_error(&e);
                if e.is_retryable() {
                    warn!(error = %e, code = e.code(), "Workflow action failed; retryable");
                } else {
                    warn!(error = %e, code = e.code(), "Workflow action failed");
                }
                Err(e)
            }
        }
    }

    /// Proposal and council for an evaluator acting on the current review.
    async fn eligible_evaluator<P: Sync>(
        &self,
        request: &ActionRequest<P>,
    ) -> Result<(Proposal, Council), WorkflowError> {
        require_identity(&request.actor)?;
        let proposal = self.load_proposal(&request.proposal_id).await?;
        let not_eligible = |reason: String| WorkflowError::NotEligible {
            proposal_id: proposal.id.clone(),
            evaluator_id: request.actor.id.clone(),
            reason,
        };

        let council_id = match (proposal.state.is_review(), proposal.council_id.as_deref()) {
            (true, Some(council_id)) => council_id.to_string(),
            _ => {
                return Err(not_eligible(format!(
                    "proposal is in {} without a reviewing council",
                    proposal.state
                )))
            }
        };
        let council = self.load_council(&council_id).await?;
        if council.is_secretary(&request.actor.id) {
            return Err(not_eligible("the council secretary does not score".to_string()));
        }
        if !council.is_voting_member(&request.actor.id) {
            return Err(not_eligible(format!(
                "not a member of council '{}'",
                council.id
            )));
        }
        if !request.actor.role.can_sit_on_council() {
            return Err(not_eligible(format!(
                "role {} cannot evaluate",
                request.actor.role
            )));
        }
        Ok((proposal, council))
    }

    async fn load_evaluation(
        &self,
        proposal: &Proposal,
        actor: &Actor,
    ) -> Result<Evaluation, WorkflowError> {
        bounded(
            "evaluation.find",
            self.timeout,
            self.repo
                .evaluations
                .find(&proposal.id, proposal.review_cycle, &actor.id),
        )
        .await?
        .ok_or_else(|| {
            WorkflowError::not_found(
                "evaluation",
                format!("{}/{}/{}", proposal.id, proposal.review_cycle, actor.id),
            )
        })
    }

    async fn narrow_holder_to_secretary(&self, proposal_id: &str, council: &Council, cycle: u32) {
        for _ in 0..HOLDER_NARROWING_ATTEMPTS {
            let proposal = match self.load_proposal(proposal_id).await {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(proposal_id, error = %e, "Could not reload proposal to narrow holder");
                    return;
                }
            };
            if !proposal.state.is_review()
                || proposal.review_cycle != cycle
                || proposal.council_id.as_deref() != Some(council.id.as_str())
                || proposal.holder_user_id.as_deref() == Some(council.secretary_id.as_str())
            {
                return;
            }
            let mut next = proposal.clone();
            next.holder_user_id = Some(council.secretary_id.clone());
            next.updated_at = Utc::now();
            match self.commit(proposal.version, next).await {
                Ok(_) => {
                    info!(proposal_id, secretary_id = %council.secretary_id, "Holder narrowed to council secretary");
                    return;
                }
                Err(WorkflowError::ConcurrentModification { .. }) => continue,
                Err(e) => {
                    warn!(proposal_id, error = %e, "Could not narrow holder");
                    return;
                }
            }
        }
    }

    async fn roster(
        &self,
        proposal: &Proposal,
        council: &Council,
    ) -> Result<EvaluationRoster, WorkflowError> {
        let evaluations = self.evaluations_of(&proposal.id).await?;
        Ok(EvaluationRoster::build(
            &proposal.id,
            council,
            proposal.review_cycle,
            &evaluations,
        ))
    }

    async fn evaluations_of(&self, proposal_id: &str) -> Result<Vec<Evaluation>, WorkflowError> {
        bounded(
            "evaluation.list",
            self.timeout,
            self.repo.evaluations.list_for_proposal(proposal_id),
        )
        .await
    }

    async fn load_proposal(&self, proposal_id: &str) -> Result<Proposal, WorkflowError> {
        bounded("proposal.get", self.timeout, self.repo.proposals.get(proposal_id))
            .await?
            .ok_or_else(|| WorkflowError::not_found("proposal", proposal_id))
    }

    async fn load_council(&self, council_id: &str) -> Result<Council, WorkflowError> {
        bounded("council.get", self.timeout, self.repo.councils.get(council_id))
            .await?
            .ok_or_else(|| WorkflowError::not_found("council", council_id))
    }

    async fn current_council(&self, proposal: &Proposal) -> Result<Option<Council>, WorkflowError> {
        match &proposal.council_id {
            Some(council_id) => self.load_council(council_id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn commit(&self, expected_version: u64, proposal: Proposal) -> Result<Proposal, WorkflowError> {
        bounded(
            "proposal.compare_and_swap",
            self.timeout,
            self.repo.proposals.compare_and_swap(expected_version, proposal),
        )
        .await
        .inspect_err(|e| {
            if let WorkflowError::ConcurrentModification { proposal_id, expected, actual } = e {
                warn!(proposal_id = %proposal_id, expected, actual, "Proposal write lost the race");
            }
        })
    }
}

fn require_identity(actor: &Actor) -> Result<(), WorkflowError> {
    if actor.id.trim().is_empty() {
        return Err(WorkflowError::unauthorized("actor id is required"));
    }
    Ok(())
}

fn check_expected_version(proposal: &Proposal, expected: Option<u64>) -> Result<(), WorkflowError> {
    match expected {
        Some(expected) if expected != proposal.version => Err(WorkflowError::ConcurrentModification {
            proposal_id: proposal.id.clone(),
            expected,
            actual: proposal.version,
        }),
        _ => Ok(()),
    }
}

fn check_form_data(form_data: &serde_json::Value) -> Result<(), WorkflowError> {
    if form_data.is_object() || form_data.is_null() {
        Ok(())
    } else {
        Err(WorkflowError::invalid_field(
            "form_data",
            "form data must be a JSON object",
        ))
    }
}

fn authorize_council_admin(
    actor: &Actor,
    faculty_council: bool,
    faculty_id: Option<&str>,
) -> Result<(), WorkflowError> {
    let allowed = if faculty_council {
        actor.role == UserRole::QuanLyKhoa
            && faculty_id.is_some_and(|faculty| actor.belongs_to_faculty(faculty))
    } else {
        actor.role == UserRole::PhongKhcn
    };
    if allowed {
        Ok(())
    } else {
        Err(WorkflowError::unauthorized(format!(
            "{} '{}' may not manage this council",
            actor.role, actor.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_code_pattern_compiles_and_matches() {
        let pattern = PROPOSAL_CODE.as_ref().unwrap();
        assert!(pattern.is_match("NCKH-2025-001"));
        assert!(pattern.is_match("DT.CNTT/12"));
        assert!(!pattern.is_match(""));
        assert!(!pattern.is_match("-leading-dash"));
        assert!(!pattern.is_match("has space"));
    }

    #[test]
    fn test_expected_version_mismatch_is_a_conflict() {
        let proposal = Proposal::new(
            "gv01",
            NewProposal {
                code: "NCKH-1".to_string(),
                title: "t".to_string(),
                faculty_id: "CNTT".to_string(),
                form_data: serde_json::Value::Null,
            },
            Utc::now(),
        );
        assert!(check_expected_version(&proposal, None).is_ok());
        assert!(check_expected_version(&proposal, Some(0)).is_ok());
        let err = check_expected_version(&proposal, Some(3)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_faculty_council_admin_must_match_faculty() {
        let manager = Actor::new("qlk", UserRole::QuanLyKhoa).with_faculty("CNTT");
        assert!(authorize_council_admin(&manager, true, Some("CNTT")).is_ok());
        assert!(authorize_council_admin(&manager, true, Some("KT")).is_err());
        assert!(authorize_council_admin(&manager, false, None).is_err());

        let office = Actor::new("khcn", UserRole::PhongKhcn);
        assert!(authorize_council_admin(&office, false, None).is_ok());
    }
}
