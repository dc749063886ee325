use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::council::CouncilRole;
use crate::errors::WorkflowError;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;
pub const DEFAULT_SCORE: u8 = 3;

/// The four scored sections of the evaluation form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationSection {
    Relevance,
    Feasibility,
    Methodology,
    ExpectedResults,
}

impl EvaluationSection {
    pub const ALL: [EvaluationSection; 4] = [
        EvaluationSection::Relevance,
        EvaluationSection::Feasibility,
        EvaluationSection::Methodology,
        EvaluationSection::ExpectedResults,
    ];

    /// Field path segment used in validation errors.
    pub fn field_name(&self) -> &'static str {
        match self {
            EvaluationSection::Relevance => "relevance",
            EvaluationSection::Feasibility => "feasibility",
            EvaluationSection::Methodology => "methodology",
            EvaluationSection::ExpectedResults => "expected_results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Pass,
    Fail,
}

/// `Finalized` is the evaluator's own submission, not the council decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationState {
    Draft,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionScore {
    pub score: Option<u8>,
    #[serde(default)]
    pub comments: String,
}

impl Default for SectionScore {
    fn default() -> Self {
        Self {
            score: Some(DEFAULT_SCORE),
            comments: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub proposal_id: String,
    pub council_id: String,
    pub cycle: u32,
    pub evaluator_id: String,
    pub evaluator_role: CouncilRole,
    pub state: EvaluationState,
    pub scores: BTreeMap<EvaluationSection, SectionScore>,
    pub conclusion: Option<Conclusion>,
    pub other_comments: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Bumped by every stored write; see [`crate::store::EvaluationStore::replace_draft`].
    #[serde(default)]
    pub version: u64,
}

/// Partial edit of a DRAFT evaluation. Absent fields are left untouched;
/// `score: null` clears a section score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationPatch {
    #[serde(default)]
    pub scores: BTreeMap<EvaluationSection, SectionPatch>,
    #[serde(default)]
    pub conclusion: Option<Conclusion>,
    #[serde(default)]
    pub other_comments: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionPatch {
    #[serde(default, deserialize_with = "present_or_null")]
    pub score: Option<Option<u8>>,
    #[serde(default)]
    pub comments: Option<String>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl EvaluationPatch {
    pub fn with_score(mut self, section: EvaluationSection, score: u8) -> Self {
        self.scores.entry(section).or_default().score = Some(Some(score));
        self
    }

    pub fn without_score(mut self, section: EvaluationSection) -> Self {
        self.scores.entry(section).or_default().score = Some(None);
        self
    }

    pub fn with_comments(mut self, section: EvaluationSection, comments: impl Into<String>) -> Self {
        self.scores.entry(section).or_default().comments = Some(comments.into());
        self
    }

    pub fn with_conclusion(mut self, conclusion: Conclusion) -> Self {
        self.conclusion = Some(conclusion);
        self
    }

    pub fn with_other_comments(mut self, comments: impl Into<String>) -> Self {
        self.other_comments = Some(comments.into());
        self
    }
}

impl Evaluation {
    /// Fresh DRAFT with every section at the mid-range default and no conclusion.
    pub fn new_draft(
        proposal_id: impl Into<String>,
        council_id: impl Into<String>,
        cycle: u32,
        evaluator_id: impl Into<String>,
        evaluator_role: CouncilRole,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            proposal_id: proposal_id.into(),
            council_id: council_id.into(),
            cycle,
            evaluator_id: evaluator_id.into(),
            evaluator_role,
            state: EvaluationState::Draft,
            scores: EvaluationSection::ALL
                .into_iter()
                .map(|section| (section, SectionScore::default()))
                .collect(),
            conclusion: None,
            other_comments: String::new(),
            created_at: now,
            updated_at: now,
            submitted_at: None,
            version: 0,
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.state == EvaluationState::Finalized
    }

    pub fn score(&self, section: EvaluationSection) -> Option<u8> {
        self.scores.get(&section).and_then(|s| s.score)
    }

    /// Required fields not yet filled in, as field paths.
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing: Vec<String> = EvaluationSection::ALL
            .iter()
            .filter(|section| self.score(**section).is_none())
            .map(|section| format!("scores.{}", section.field_name()))
            .collect();
        if self.conclusion.is_none() {
            missing.push("conclusion".to_string());
        }
        missing
    }

    /// Applies a patch atomically: nothing changes if any score is out of range.
    pub fn apply_patch(
        &mut self,
        patch: &EvaluationPatch,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        if self.is_submitted() {
            return Err(WorkflowError::precondition(format!(
                "evaluation '{}' has already been submitted",
                self.id
            )));
        }

        for (section, section_patch) in &patch.scores {
            if let Some(Some(score)) = section_patch.score {
                if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
                    return Err(WorkflowError::invalid_field(
                        format!("scores.{}", section.field_name()),
                        format!("score must be between {MIN_SCORE} and {MAX_SCORE}, got {score}"),
                    ));
                }
            }
        }

        for (section, section_patch) in &patch.scores {
            let entry = self.scores.entry(*section).or_default();
            if let Some(score) = section_patch.score {
                entry.score = score;
            }
            if let Some(comments) = &section_patch.comments {
                entry.comments = comments.clone();
            }
        }
        if let Some(conclusion) = patch.conclusion {
            self.conclusion = Some(conclusion);
        }
        if let Some(comments) = &patch.other_comments {
            self.other_comments = comments.clone();
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn submit(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        if self.is_submitted() {
            return Err(WorkflowError::precondition(format!(
                "evaluation '{}' has already been submitted",
                self.id
            )));
        }
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(WorkflowError::IncompleteForm { missing });
        }
        self.state = EvaluationState::Finalized;
        self.submitted_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionAggregate {
    pub avg: f64,
    pub min: u8,
    pub max: u8,
}

/// Score statistics over the submitted evaluations of one review cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreAggregate {
    pub sections: BTreeMap<EvaluationSection, SectionAggregate>,
    /// Mean of the section averages; `None` until something is submitted.
    pub overall: Option<f64>,
    pub submitted_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> Evaluation {
        Evaluation::new_draft("p1", "c1", 1, "m1", CouncilRole::Member, Utc::now())
    }

    #[test]
    fn test_new_draft_defaults_every_section_to_three() {
        let evaluation = draft();
        for section in EvaluationSection::ALL {
            assert_eq!(evaluation.score(section), Some(DEFAULT_SCORE));
        }
        assert_eq!(evaluation.missing_fields(), vec!["conclusion".to_string()]);
    }

    #[test]
    fn test_out_of_range_score_rejects_whole_patch() {
        let mut evaluation = draft();
        let patch = EvaluationPatch::default()
            .with_score(EvaluationSection::Relevance, 5)
            .with_score(EvaluationSection::Methodology, 6);

        let err = evaluation.apply_patch(&patch, Utc::now()).unwrap_err();
        assert_eq!(err.field(), Some("scores.methodology"));
        assert_eq!(evaluation.score(EvaluationSection::Relevance), Some(DEFAULT_SCORE));
    }

    #[test]
    fn test_submit_requires_conclusion_and_all_scores() {
        let mut evaluation = draft();
        let patch = EvaluationPatch::default().without_score(EvaluationSection::Feasibility);
        evaluation.apply_patch(&patch, Utc::now()).unwrap();

        match evaluation.submit(Utc::now()) {
            Err(WorkflowError::IncompleteForm { missing }) => {
                assert_eq!(missing, vec!["scores.feasibility", "conclusion"]);
            }
            other => panic!("expected IncompleteForm, got {other:?}"),
        }
        assert_eq!(evaluation.state, EvaluationState::Draft);
    }

    #[test]
    fn test_submitted_evaluation_is_immutable() {
        let mut evaluation = draft();
        evaluation
            .apply_patch(
                &EvaluationPatch::default().with_conclusion(Conclusion::Pass),
                Utc::now(),
            )
            .unwrap();
        evaluation.submit(Utc::now()).unwrap();

        let err = evaluation
            .apply_patch(
                &EvaluationPatch::default().with_other_comments("late edit"),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));
        assert!(evaluation.other_comments.is_empty());
    }

    #[test]
    fn test_patch_null_score_clears_section() {
        let patch: EvaluationPatch =
            serde_json::from_str(r#"{"scores": {"RELEVANCE": {"score": null}}}"#).unwrap();
        let mut evaluation = draft();
        evaluation.apply_patch(&patch, Utc::now()).unwrap();
        assert_eq!(evaluation.score(EvaluationSection::Relevance), None);
        assert_eq!(evaluation.score(EvaluationSection::Feasibility), Some(DEFAULT_SCORE));
    }
}
