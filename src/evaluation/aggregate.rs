use std::collections::BTreeMap;

use crate::domain::{Evaluation, EvaluationSection, ScoreAggregate, SectionAggregate};

/// Per-section `{avg, min, max}` over submitted evaluations only.
///
/// Drafts are ignored, so the result is meaningful while submissions are still
/// coming in. A section nobody has scored is left out, and `overall` is the
/// mean of the section averages that exist.
pub fn compute_aggregate<'a, I>(evaluations: I) -> ScoreAggregate
where
    I: IntoIterator<Item = &'a Evaluation>,
{
    let submitted: Vec<&Evaluation> = evaluations
        .into_iter()
        .filter(|e| e.is_submitted())
        .collect();

    let mut sections = BTreeMap::new();
    for section in EvaluationSection::ALL {
        let scores: Vec<u8> = submitted.iter().filter_map(|e| e.score(section)).collect();
        let (Some(&min), Some(&max)) = (scores.iter().min(), scores.iter().max()) else {
            continue;
        };
        let sum: u32 = scores.iter().map(|s| u32::from(*s)).sum();
        sections.insert(
            section,
            SectionAggregate {
                avg: f64::from(sum) / scores.len() as f64,
                min,
                max,
            },
        );
    }

    let overall = if sections.is_empty() {
        None
    } else {
        Some(sections.values().map(|s| s.avg).sum::<f64>() / sections.len() as f64)
    };

    ScoreAggregate {
        sections,
        overall,
        submitted_count: submitted.len(),
    }
}
