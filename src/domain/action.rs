use serde::{Deserialize, Serialize};
use std::fmt;

use super::actor::Actor;
use super::evaluation::{Conclusion, Evaluation};
use super::proposal::ProposalState;
use crate::effects::Effect;

/// Every mutating operation, as recorded in audit logs and idempotency records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    SubmitProposal,
    AssignCouncil,
    ChangeCouncil,
    RequestChanges,
    Approve,
    Reject,
    Cancel,
    Withdraw,
    Pause,
    Resume,
    StartImplementation,
    UpdateProposalForm,
    GetOrCreateEvaluation,
    UpdateEvaluationDraft,
    SubmitEvaluation,
    FinalizeCouncilEvaluation,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SubmitProposal => "SUBMIT_PROPOSAL",
            ActionType::AssignCouncil => "ASSIGN_COUNCIL",
            ActionType::ChangeCouncil => "CHANGE_COUNCIL",
            ActionType::RequestChanges => "REQUEST_CHANGES",
            ActionType::Approve => "APPROVE",
            ActionType::Reject => "REJECT",
            ActionType::Cancel => "CANCEL",
            ActionType::Withdraw => "WITHDRAW",
            ActionType::Pause => "PAUSE",
            ActionType::Resume => "RESUME",
            ActionType::StartImplementation => "START_IMPLEMENTATION",
            ActionType::UpdateProposalForm => "UPDATE_PROPOSAL_FORM",
            ActionType::GetOrCreateEvaluation => "GET_OR_CREATE_EVALUATION",
            ActionType::UpdateEvaluationDraft => "UPDATE_EVALUATION_DRAFT",
            ActionType::SubmitEvaluation => "SUBMIT_EVALUATION",
            ActionType::FinalizeCouncilEvaluation => "FINALIZE_COUNCIL_EVALUATION",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope shared by every action operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest<P> {
    pub proposal_id: String,
    pub actor: Actor,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Optimistic-concurrency precondition on the proposal version.
    #[serde(default)]
    pub expected_version: Option<u64>,
    /// Destination the caller believes the action leads to.
    #[serde(default)]
    pub expected_target: Option<ProposalState>,
    #[serde(default)]
    pub payload: P,
}

impl<P> ActionRequest<P> {
    pub fn new(proposal_id: impl Into<String>, actor: Actor, payload: P) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            actor,
            idempotency_key: None,
            expected_version: None,
            expected_target: None,
            payload,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_expected_target(mut self, target: ProposalState) -> Self {
        self.expected_target = Some(target);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CouncilPayload {
    pub council_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeCouncilPayload {
    pub council_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnPayload {
    pub reason: String,
    #[serde(default)]
    pub requested_revisions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasonPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

impl ReasonPayload {
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizePayload {
    /// Required; `None` is rejected as a field-level error.
    #[serde(default)]
    pub final_conclusion: Option<Conclusion>,
    #[serde(default)]
    pub final_comments: String,
}

impl FinalizePayload {
    pub fn new(conclusion: Conclusion, comments: impl Into<String>) -> Self {
        Self {
            final_conclusion: Some(conclusion),
            final_comments: comments.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormPayload {
    pub form_data: serde_json::Value,
}

/// Result of a proposal-level action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub proposal_id: String,
    pub new_state: ProposalState,
    pub version: u64,
    pub effects: Vec<Effect>,
}

/// Result of an evaluation-level action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub proposal_state: ProposalState,
    pub evaluation: Evaluation,
    pub effects: Vec<Effect>,
}
