//! JSON request/response envelope over [`WorkflowService`].
//!
//! One request names one operation. Responses are either `ok` with the
//! operation's result or `error` with a stable code, the offending field when
//! there is one, and whether retrying can help.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    ActionRequest, Actor, ChangeCouncilPayload, CouncilPayload, CouncilSpec, EvaluationPatch,
    FinalizePayload, FormPayload, NewProposal, ReasonPayload, ReturnPayload,
};
use crate::errors::WorkflowError;
use crate::service::WorkflowService;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ApiRequest {
    CreateProposal {
        actor: Actor,
        proposal: NewProposal,
    },
    UpdateProposalForm(ActionRequest<FormPayload>),
    SubmitProposal(ActionRequest<()>),
    AssignCouncil(ActionRequest<CouncilPayload>),
    ChangeCouncil(ActionRequest<ChangeCouncilPayload>),
    RequestChanges(ActionRequest<ReturnPayload>),
    Approve(ActionRequest<ReasonPayload>),
    Reject(ActionRequest<ReasonPayload>),
    Cancel(ActionRequest<ReasonPayload>),
    Withdraw(ActionRequest<ReasonPayload>),
    Pause(ActionRequest<ReasonPayload>),
    Resume(ActionRequest<()>),
    StartImplementation(ActionRequest<()>),
    CreateCouncil {
        actor: Actor,
        council: CouncilSpec,
    },
    DeleteCouncil {
        actor: Actor,
        council_id: String,
    },
    GetOrCreateEvaluation(ActionRequest<()>),
    UpdateEvaluationDraft(ActionRequest<EvaluationPatch>),
    SubmitEvaluation(ActionRequest<()>),
    FinalizeCouncilEvaluation(ActionRequest<FinalizePayload>),
    GetProposal {
        proposal_id: String,
    },
    GetCouncil {
        council_id: String,
    },
    GetAllEvaluations {
        proposal_id: String,
        actor: Actor,
    },
    GetAggregateScores {
        proposal_id: String,
    },
    GetWorkflowLog {
        proposal_id: String,
    },
    AvailableActions {
        proposal_id: String,
        actor: Actor,
    },
    PurgeIdempotency,
    Metrics,
}

impl ApiRequest {
    /// Proposal the request targets, if any.
    pub fn proposal_id(&self) -> Option<&str> {
        match self {
            ApiRequest::UpdateProposalForm(r) => Some(&r.proposal_id),
            ApiRequest::SubmitProposal(r)
            | ApiRequest::Resume(r)
            | ApiRequest::StartImplementation(r)
            | ApiRequest::GetOrCreateEvaluation(r)
            | ApiRequest::SubmitEvaluation(r) => Some(&r.proposal_id),
            ApiRequest::AssignCouncil(r) => Some(&r.proposal_id),
            ApiRequest::ChangeCouncil(r) => Some(&r.proposal_id),
            ApiRequest::RequestChanges(r) => Some(&r.proposal_id),
            ApiRequest::Approve(r)
            | ApiRequest::Reject(r)
            | ApiRequest::Cancel(r)
            | ApiRequest::Withdraw(r)
            | ApiRequest::Pause(r) => Some(&r.proposal_id),
            ApiRequest::UpdateEvaluationDraft(r) => Some(&r.proposal_id),
            ApiRequest::FinalizeCouncilEvaluation(r) => Some(&r.proposal_id),
            ApiRequest::GetProposal { proposal_id }
            | ApiRequest::GetAllEvaluations { proposal_id, .. }
            | ApiRequest::GetAggregateScores { proposal_id }
            | ApiRequest::GetWorkflowLog { proposal_id }
            | ApiRequest::AvailableActions { proposal_id, .. } => Some(proposal_id),
            ApiRequest::CreateProposal { .. }
            | ApiRequest::CreateCouncil { .. }
            | ApiRequest::DeleteCouncil { .. }
            | ApiRequest::GetCouncil { .. }
            | ApiRequest::PurgeIdempotency
            | ApiRequest::Metrics => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiResponse {
    Ok {
        result: Value,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing: Vec<String>,
    },
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiResponse::Ok { .. })
    }

    fn ok<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(result) => ApiResponse::Ok { result },
            Err(e) => ApiResponse::from(WorkflowError::from(e)),
        }
    }
}

impl From<WorkflowError> for ApiResponse {
    fn from(error: WorkflowError) -> Self {
        let missing = match &error {
            WorkflowError::IncompleteForm { missing } => missing.clone(),
            _ => Vec::new(),
        };
        ApiResponse::Error {
            code: error.code().to_string(),
            retryable: error.is_retryable(),
            field: error.field().map(str::to_string),
            message: error.to_string(),
            missing,
        }
    }
}

fn respond<T: Serialize>(result: Result<T, WorkflowError>) -> ApiResponse {
    match result {
        Ok(value) => ApiResponse::ok(value),
        Err(error) => ApiResponse::from(error),
    }
}

/// Executes one request against the service.
pub async fn dispatch(service: &WorkflowService, request: ApiRequest) -> ApiResponse {
    match request {
        ApiRequest::CreateProposal { actor, proposal } => {
            respond(service.create_proposal(&actor, proposal).await)
        }
        ApiRequest::UpdateProposalForm(r) => respond(service.update_proposal_form(r).await),
        ApiRequest::SubmitProposal(r) => respond(service.submit_proposal(r).await),
        ApiRequest::AssignCouncil(r) => respond(service.assign_council(r).await),
        ApiRequest::ChangeCouncil(r) => respond(service.change_council(r).await),
        ApiRequest::RequestChanges(r) => respond(service.request_changes(r).await),
        ApiRequest::Approve(r) => respond(service.approve(r).await),
        ApiRequest::Reject(r) => respond(service.reject(r).await),
        ApiRequest::Cancel(r) => respond(service.cancel(r).await),
        ApiRequest::Withdraw(r) => respond(service.withdraw(r).await),
        ApiRequest::Pause(r) => respond(service.pause(r).await),
        ApiRequest::Resume(r) => respond(service.resume(r).await),
        ApiRequest::StartImplementation(r) => respond(service.start_implementation(r).await),
        ApiRequest::CreateCouncil { actor, council } => {
            respond(service.create_council(&actor, council).await)
        }
        ApiRequest::DeleteCouncil { actor, council_id } => respond(
            service
                .delete_council(&actor, &council_id)
                .await
                .map(|()| serde_json::json!({ "deleted": council_id })),
        ),
        ApiRequest::GetOrCreateEvaluation(r) => respond(service.get_or_create_evaluation(r).await),
        ApiRequest::UpdateEvaluationDraft(r) => respond(service.update_evaluation_draft(r).await),
        ApiRequest::SubmitEvaluation(r) => respond(service.submit_evaluation(r).await),
        ApiRequest::FinalizeCouncilEvaluation(r) => {
            respond(service.finalize_council_evaluation(r).await)
        }
        ApiRequest::GetProposal { proposal_id } => respond(service.get_proposal(&proposal_id).await),
        ApiRequest::GetCouncil { council_id } => respond(service.get_council(&council_id).await),
        ApiRequest::GetAllEvaluations { proposal_id, actor } => {
            respond(service.get_all_evaluations(&proposal_id, &actor).await)
        }
        ApiRequest::GetAggregateScores { proposal_id } => {
            respond(service.get_aggregate_scores(&proposal_id).await)
        }
        ApiRequest::GetWorkflowLog { proposal_id } => {
            respond(service.get_workflow_log(&proposal_id).await)
        }
        ApiRequest::AvailableActions { proposal_id, actor } => {
            respond(service.available_actions(&proposal_id, &actor).await)
        }
        ApiRequest::PurgeIdempotency => respond(
            service
                .purge_expired_idempotency()
                .await
                .map(|purged| serde_json::json!({ "purged": purged })),
        ),
        ApiRequest::Metrics => ApiResponse::ok(service.metrics()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProposalState;
    use serde_json::json;

    #[test]
    fn test_action_request_parses_with_tag_and_optional_fields() {
        let raw = json!({
            "operation": "submit_proposal",
            "proposal_id": "p1",
            "actor": {"id": "gv01", "role": "GIANG_VIEN", "faculty_id": "CNTT"},
            "idempotency_key": "k-1",
            "expected_target": "FACULTY_COUNCIL_OUTLINE_REVIEW"
        });
        let request: ApiRequest = serde_json::from_value(raw).unwrap();
        match request {
            ApiRequest::SubmitProposal(r) => {
                assert_eq!(r.proposal_id, "p1");
                assert_eq!(r.idempotency_key.as_deref(), Some("k-1"));
                assert_eq!(r.expected_target, Some(ProposalState::FacultyCouncilOutlineReview));
                assert_eq!(r.expected_version, None);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_finalize_request_without_conclusion_still_parses() {
        let raw = json!({
            "operation": "finalize_council_evaluation",
            "proposal_id": "p1",
            "actor": {"id": "tk01", "role": "HOI_DONG"},
            "payload": {"final_comments": "ok"}
        });
        let request: ApiRequest = serde_json::from_value(raw).unwrap();
        let ApiRequest::FinalizeCouncilEvaluation(r) = request else {
            panic!("wrong variant");
        };
        assert!(r.payload.final_conclusion.is_none());
    }

    #[test]
    fn test_error_response_carries_field_and_retryability() {
        let response = ApiResponse::from(WorkflowError::invalid_field("final_comments", "required"));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["field"], "final_comments");
        assert_eq!(value["retryable"], false);
        assert!(value.get("missing").is_none());

        let conflict = ApiResponse::from(WorkflowError::ConcurrentModification {
            proposal_id: "p1".to_string(),
            expected: 1,
            actual: 2,
        });
        assert!(matches!(conflict, ApiResponse::Error { retryable: true, .. }));
    }

    #[test]
    fn test_incomplete_form_lists_missing_fields() {
        let response = ApiResponse::from(WorkflowError::IncompleteForm {
            missing: vec!["scores.relevance".to_string(), "conclusion".to_string()],
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["code"], "INCOMPLETE_FORM");
        assert_eq!(value["missing"], json!(["scores.relevance", "conclusion"]));
    }
}
