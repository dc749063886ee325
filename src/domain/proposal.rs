use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::action::ActionType;
use super::actor::UserRole;
use super::council::CouncilType;
use super::evaluation::{Conclusion, ScoreAggregate};

/// Lifecycle states of a research proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Draft,
    FacultyCouncilOutlineReview,
    SchoolCouncilOutlineReview,
    Approved,
    ChangesRequested,
    Rejected,
    InProgress,
    FacultyCouncilAcceptanceReview,
    SchoolCouncilAcceptanceReview,
    Completed,
    Cancelled,
    Withdrawn,
    Paused,
}

impl ProposalState {
    pub const ALL: [ProposalState; 13] = [
        ProposalState::Draft,
        ProposalState::FacultyCouncilOutlineReview,
        ProposalState::SchoolCouncilOutlineReview,
        ProposalState::Approved,
        ProposalState::ChangesRequested,
        ProposalState::Rejected,
        ProposalState::InProgress,
        ProposalState::FacultyCouncilAcceptanceReview,
        ProposalState::SchoolCouncilAcceptanceReview,
        ProposalState::Completed,
        ProposalState::Cancelled,
        ProposalState::Withdrawn,
        ProposalState::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalState::Draft => "DRAFT",
            ProposalState::FacultyCouncilOutlineReview => "FACULTY_COUNCIL_OUTLINE_REVIEW",
            ProposalState::SchoolCouncilOutlineReview => "SCHOOL_COUNCIL_OUTLINE_REVIEW",
            ProposalState::Approved => "APPROVED",
            ProposalState::ChangesRequested => "CHANGES_REQUESTED",
            ProposalState::Rejected => "REJECTED",
            ProposalState::InProgress => "IN_PROGRESS",
            ProposalState::FacultyCouncilAcceptanceReview => "FACULTY_COUNCIL_ACCEPTANCE_REVIEW",
            ProposalState::SchoolCouncilAcceptanceReview => "SCHOOL_COUNCIL_ACCEPTANCE_REVIEW",
            ProposalState::Completed => "COMPLETED",
            ProposalState::Cancelled => "CANCELLED",
            ProposalState::Withdrawn => "WITHDRAWN",
            ProposalState::Paused => "PAUSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalState::Rejected
                | ProposalState::Completed
                | ProposalState::Cancelled
                | ProposalState::Withdrawn
        )
    }

    pub fn is_faculty_review(&self) -> bool {
        matches!(
            self,
            ProposalState::FacultyCouncilOutlineReview
                | ProposalState::FacultyCouncilAcceptanceReview
        )
    }

    pub fn is_school_review(&self) -> bool {
        matches!(
            self,
            ProposalState::SchoolCouncilOutlineReview
                | ProposalState::SchoolCouncilAcceptanceReview
        )
    }

    /// States in which a council evaluates the proposal.
    pub fn is_review(&self) -> bool {
        self.is_faculty_review() || self.is_school_review()
    }

    /// States in which the owner may edit the form data.
    pub fn is_editable(&self) -> bool {
        matches!(self, ProposalState::Draft | ProposalState::ChangesRequested)
    }

    /// Destination of a passing review.
    pub fn next_stage(&self) -> Option<ProposalState> {
        match self {
            ProposalState::FacultyCouncilOutlineReview => {
                Some(ProposalState::SchoolCouncilOutlineReview)
            }
            ProposalState::SchoolCouncilOutlineReview => Some(ProposalState::Approved),
            ProposalState::FacultyCouncilAcceptanceReview => {
                Some(ProposalState::SchoolCouncilAcceptanceReview)
            }
            ProposalState::SchoolCouncilAcceptanceReview => Some(ProposalState::Completed),
            _ => None,
        }
    }

    /// Council types that may sit for this review stage.
    pub fn accepted_council_types(&self) -> &'static [CouncilType] {
        match self {
            ProposalState::FacultyCouncilOutlineReview => &[CouncilType::FacultyOutline],
            ProposalState::SchoolCouncilOutlineReview => {
                &[CouncilType::Outline, CouncilType::Review]
            }
            ProposalState::FacultyCouncilAcceptanceReview => &[CouncilType::FacultyAcceptance],
            ProposalState::SchoolCouncilAcceptanceReview => {
                &[CouncilType::Acceptance, CouncilType::Review]
            }
            _ => &[],
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organisational unit currently expected to act on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum HolderUnit {
    Faculty(String),
    Council(String),
    ScienceOffice,
}

/// Append-only audit entry written for every committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLogEntry {
    pub action: ActionType,
    pub actor_id: String,
    pub actor_role: UserRole,
    pub from_state: ProposalState,
    pub to_state: ProposalState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Context handed back to the owner when a review returns the proposal for changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnLog {
    pub returned_from: ProposalState,
    pub reason: String,
    pub requested_revisions: Vec<String>,
    pub returned_by: String,
    pub cycle: u32,
    pub returned_at: DateTime<Utc>,
}

/// The secretary's single binding decision for one review cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilFinalization {
    pub proposal_id: String,
    pub council_id: String,
    pub cycle: u32,
    pub final_conclusion: Conclusion,
    pub final_comments: String,
    pub finalized_by: String,
    pub finalized_at: DateTime<Utc>,
    pub aggregate: ScoreAggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilAssignment {
    pub council_id: String,
    pub cycle: u32,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub replaced_at: Option<DateTime<Utc>>,
}

/// Input for creating a DRAFT proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProposal {
    pub code: String,
    pub title: String,
    pub faculty_id: String,
    #[serde(default)]
    pub form_data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub code: String,
    pub title: String,
    pub owner_id: String,
    pub faculty_id: String,
    pub state: ProposalState,
    pub council_id: Option<String>,
    pub holder_user_id: Option<String>,
    pub holder_unit: Option<HolderUnit>,
    pub form_data: serde_json::Value,
    pub version: u64,
    pub review_cycle: u32,
    pub paused_from: Option<ProposalState>,
    pub workflow_log: Vec<WorkflowLogEntry>,
    pub return_logs: Vec<ReturnLog>,
    pub finalizations: Vec<CouncilFinalization>,
    pub council_history: Vec<CouncilAssignment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(owner_id: impl Into<String>, input: NewProposal, now: DateTime<Utc>) -> Self {
        let owner_id = owner_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            code: input.code,
            title: input.title,
            holder_user_id: Some(owner_id.clone()),
            owner_id,
            faculty_id: input.faculty_id,
            state: ProposalState::Draft,
            council_id: None,
            holder_unit: None,
            form_data: input.form_data,
            version: 0,
            review_cycle: 0,
            paused_from: None,
            workflow_log: Vec::new(),
            return_logs: Vec::new(),
            finalizations: Vec::new(),
            council_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn latest_return_log(&self) -> Option<&ReturnLog> {
        self.return_logs.last()
    }

    /// Finalization recorded for the current review cycle, if any.
    pub fn current_finalization(&self) -> Option<&CouncilFinalization> {
        self.finalizations
            .iter()
            .find(|f| f.cycle == self.review_cycle)
    }
}
