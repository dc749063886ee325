// Council evaluation roster and score aggregation

pub mod aggregate;

use serde::{Deserialize, Serialize};

use crate::domain::{Council, CouncilRole, Evaluation, ScoreAggregate};

pub use aggregate::compute_aggregate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub evaluator_id: String,
    pub role: CouncilRole,
    /// `None` until the member first opens the evaluation.
    pub evaluation: Option<Evaluation>,
}

/// Secretary's view of one review cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRoster {
    pub proposal_id: String,
    pub council_id: String,
    pub cycle: u32,
    pub entries: Vec<RosterEntry>,
    pub total_members: usize,
    pub submitted_count: usize,
    pub all_submitted: bool,
    pub aggregate: ScoreAggregate,
}

impl EvaluationRoster {
    /// Lines up every voting member with their evaluation for `cycle`.
    /// Evaluations from other cycles or councils are ignored.
    pub fn build(
        proposal_id: &str,
        council: &Council,
        cycle: u32,
        evaluations: &[Evaluation],
    ) -> Self {
        let current: Vec<&Evaluation> = evaluations
            .iter()
            .filter(|e| e.cycle == cycle && e.council_id == council.id)
            .collect();

        let entries: Vec<RosterEntry> = council
            .voting_members()
            .map(|member| RosterEntry {
                evaluator_id: member.clone(),
                role: council.role_of(member).unwrap_or(CouncilRole::Member),
                evaluation: current
                    .iter()
                    .find(|e| e.evaluator_id == *member)
                    .map(|e| (*e).clone()),
            })
            .collect();

        let total_members = entries.len();
        let submitted_count = entries
            .iter()
            .filter(|entry| entry.evaluation.as_ref().is_some_and(Evaluation::is_submitted))
            .count();

        Self {
            proposal_id: proposal_id.to_string(),
            council_id: council.id.clone(),
            cycle,
            aggregate: compute_aggregate(current.iter().copied()),
            total_members,
            submitted_count,
            all_submitted: total_members > 0 && submitted_count == total_members,
            entries,
        }
    }
}
