use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::snapshot::StoreSnapshot;
use super::{CouncilStore, EvaluationStore, IdempotencyStore, ProposalStore};
use crate::domain::{Council, Evaluation, Proposal};
use crate::errors::WorkflowError;
use crate::idempotency::IdempotencyRecord;

type EvaluationKey = (String, u32, String);

fn evaluation_key(evaluation: &Evaluation) -> EvaluationKey {
    (
        evaluation.proposal_id.clone(),
        evaluation.cycle,
        evaluation.evaluator_id.clone(),
    )
}

/// In-process store used by tests, the CLI and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    proposals: RwLock<HashMap<String, Proposal>>,
    councils: RwLock<HashMap<String, Council>>,
    evaluations: RwLock<HashMap<EvaluationKey, Evaluation>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            proposals: RwLock::new(
                snapshot
                    .proposals
                    .into_iter()
                    .map(|p| (p.id.clone(), p))
                    .collect(),
            ),
            councils: RwLock::new(
                snapshot
                    .councils
                    .into_iter()
                    .map(|c| (c.id.clone(), c))
                    .collect(),
            ),
            evaluations: RwLock::new(
                snapshot
                    .evaluations
                    .into_iter()
                    .map(|e| (evaluation_key(&e), e))
                    .collect(),
            ),
            idempotency: RwLock::new(
                snapshot
                    .idempotency
                    .into_iter()
                    .map(|r| (r.key.clone(), r))
                    .collect(),
            ),
        }
    }

    /// Copies the current contents, sorted for stable output.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let mut proposals: Vec<Proposal> = self.proposals.read().await.values().cloned().collect();
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut councils: Vec<Council> = self.councils.read().await.values().cloned().collect();
        councils.sort_by(|a, b| a.id.cmp(&b.id));
        let mut evaluations: Vec<Evaluation> =
            self.evaluations.read().await.values().cloned().collect();
        evaluations.sort_by_key(evaluation_key);
        let mut idempotency: Vec<IdempotencyRecord> =
            self.idempotency.read().await.values().cloned().collect();
        idempotency.sort_by(|a, b| a.key.cmp(&b.key));

        StoreSnapshot::new(proposals, councils, evaluations, idempotency)
    }
}

#[async_trait]
impl ProposalStore for MemoryStore {
    async fn insert(&self, proposal: Proposal) -> Result<(), WorkflowError> {
        let mut proposals = self.proposals.write().await;
        if proposals.contains_key(&proposal.id) {
            return Err(WorkflowError::invalid_field(
                "id",
                format!("proposal '{}' already exists", proposal.id),
            ));
        }
        if proposals.values().any(|p| p.code == proposal.code) {
            return Err(WorkflowError::invalid_field(
                "code",
                format!("proposal code '{}' is already in use", proposal.code),
            ));
        }
        proposals.insert(proposal.id.clone(), proposal);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Proposal>, WorkflowError> {
        Ok(self.proposals.read().await.get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut proposal: Proposal,
    ) -> Result<Proposal, WorkflowError> {
        let mut proposals = self.proposals.write().await;
        let current = proposals
            .get(&proposal.id)
            .ok_or_else(|| WorkflowError::not_found("proposal", proposal.id.clone()))?;
        if current.version != expected_version {
            return Err(WorkflowError::ConcurrentModification {
                proposal_id: proposal.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        if let Some(council_id) = proposal.council_id.as_ref().filter(|_| !proposal.state.is_terminal()) {
            // lock order: proposals, then councils
            if !self.councils.read().await.contains_key(council_id) {
                return Err(WorkflowError::not_found("council", council_id.clone()));
            }
        }
        proposal.version = expected_version + 1;
        debug!(proposal_id = %proposal.id, version = proposal.version, "Proposal committed");
        proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }
}

#[async_trait]
impl CouncilStore for MemoryStore {
    async fn insert(&self, council: Council) -> Result<(), WorkflowError> {
        let mut councils = self.councils.write().await;
        if councils.contains_key(&council.id) {
            return Err(WorkflowError::invalid_field(
                "id",
                format!("council '{}' already exists", council.id),
            ));
        }
        councils.insert(council.id.clone(), council);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Council>, WorkflowError> {
        Ok(self.councils.read().await.get(id).cloned())
    }

    async fn delete_if_unreferenced(
        &self,
        id: &str,
        ensure_unreferenced: &(dyn for<'p> Fn(&'p [Proposal]) -> Result<(), WorkflowError> + Sync),
    ) -> Result<bool, WorkflowError> {
        let proposals = self.proposals.read().await;
        let stored: Vec<Proposal> = proposals.values().cloned().collect();
        ensure_unreferenced(&stored)?;
        let deleted = self.councils.write().await.remove(id).is_some();
        drop(proposals);
        Ok(deleted)
    }
}

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn get_or_insert(&self, draft: Evaluation) -> Result<(Evaluation, bool), WorkflowError> {
        let mut evaluations = self.evaluations.write().await;
        let key = evaluation_key(&draft);
        if let Some(existing) = evaluations.get(&key) {
            return Ok((existing.clone(), false));
        }
        evaluations.insert(key, draft.clone());
        Ok((draft, true))
    }

    async fn find(
        &self,
        proposal_id: &str,
        cycle: u32,
        evaluator_id: &str,
    ) -> Result<Option<Evaluation>, WorkflowError> {
        let key = (proposal_id.to_string(), cycle, evaluator_id.to_string());
        Ok(self.evaluations.read().await.get(&key).cloned())
    }

    async fn list_for_proposal(&self, proposal_id: &str) -> Result<Vec<Evaluation>, WorkflowError> {
        let mut found: Vec<Evaluation> = self
            .evaluations
            .read()
            .await
            .values()
            .filter(|e| e.proposal_id == proposal_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.cycle.cmp(&b.cycle).then(a.created_at.cmp(&b.created_at)));
        Ok(found)
    }

    async fn replace_draft(
        &self,
        expected_version: u64,
        mut evaluation: Evaluation,
    ) -> Result<Evaluation, WorkflowError> {
        let mut evaluations = self.evaluations.write().await;
        let key = evaluation_key(&evaluation);
        match evaluations.get(&key) {
            None => Err(WorkflowError::not_found("evaluation", evaluation.id.clone())),
            Some(stored) if stored.is_submitted() => Err(WorkflowError::precondition(format!(
                "evaluation '{}' has already been submitted",
                stored.id
            ))),
            Some(stored) if stored.version != expected_version => {
                Err(WorkflowError::ConcurrentModification {
                    proposal_id: evaluation.proposal_id.clone(),
                    expected: expected_version,
                    actual: stored.version,
                })
            }
            Some(_) => {
                evaluation.version = expected_version + 1;
                evaluations.insert(key, evaluation.clone());
                Ok(evaluation)
            }
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, WorkflowError> {
        Ok(self.idempotency.read().await.get(key).cloned())
    }

    async fn insert(&self, record: IdempotencyRecord) -> Result<(), WorkflowError> {
        let mut records = self.idempotency.write().await;
        if records.contains_key(&record.key) {
            return Err(WorkflowError::invalid_field(
                "idempotency_key",
                format!("key '{}' is already recorded", record.key),
            ));
        }
        records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, WorkflowError> {
        let mut records = self.idempotency.write().await;
        let before = records.len();
        records.retain(|_, record| record.created_at > cutoff);
        Ok(before - records.len())
    }

    async fn list(&self) -> Result<Vec<IdempotencyRecord>, WorkflowError> {
        Ok(self.idempotency.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CouncilRole, CouncilType, NewProposal, ProposalState};

    fn proposal(code: &str) -> Proposal {
        Proposal::new(
            "gv01",
            NewProposal {
                code: code.to_string(),
                title: "t".to_string(),
                faculty_id: "CNTT".to_string(),
                form_data: serde_json::Value::Null,
            },
            Utc::now(),
        )
    }

    fn council(id: &str) -> Council {
        Council {
            id: id.to_string(),
            name: "Hoi dong".to_string(),
            council_type: CouncilType::Outline,
            faculty_id: None,
            secretary_id: "tk".to_string(),
            chair_id: None,
            member_ids: ["tk", "m1", "m2", "m3"].iter().map(|m| m.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    fn refuse_live_references(council_id: &str, proposals: &[Proposal]) -> Result<(), WorkflowError> {
        let referencing: Vec<String> = proposals
            .iter()
            .filter(|p| !p.state.is_terminal() && p.council_id.as_deref() == Some(council_id))
            .map(|p| p.id.clone())
            .collect();
        if referencing.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::InUse {
                council_id: council_id.to_string(),
                proposals: referencing,
            })
        }
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let store = MemoryStore::new();
        let original = proposal("NCKH-1");
        ProposalStore::insert(&store, original.clone()).await.unwrap();

        let mut first = original.clone();
        first.title = "first".to_string();
        let committed = store.compare_and_swap(0, first).await.unwrap();
        assert_eq!(committed.version, 1);

        let mut second = original.clone();
        second.title = "second".to_string();
        match store.compare_and_swap(0, second).await {
            Err(WorkflowError::ConcurrentModification { expected, actual, .. }) => {
                assert_eq!((expected, actual), (0, 1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let stored = ProposalStore::get(&store, &original.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "first");
    }

    #[test]
    fn test_duplicate_code_is_rejected() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            ProposalStore::insert(&store, proposal("NCKH-1")).await.unwrap();
            let err = ProposalStore::insert(&store, proposal("NCKH-1")).await.unwrap_err();
            assert_eq!(err.field(), Some("code"));
        });
    }

    #[tokio::test]
    async fn test_get_or_insert_keeps_first_draft() {
        let store = MemoryStore::new();
        let first = Evaluation::new_draft("p1", "c1", 1, "m1", CouncilRole::Member, Utc::now());
        let second = Evaluation::new_draft("p1", "c1", 1, "m1", CouncilRole::Member, Utc::now());

        let (stored, created) = store.get_or_insert(first.clone()).await.unwrap();
        assert!(created);
        let (again, created) = store.get_or_insert(second).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, stored.id);

        let next_cycle = Evaluation::new_draft("p1", "c1", 2, "m1", CouncilRole::Member, Utc::now());
        let (_, created) = store.get_or_insert(next_cycle).await.unwrap();
        assert!(created);
        assert_eq!(store.list_for_proposal("p1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_naming_a_deleted_council_is_refused() {
        let store = MemoryStore::new();
        let original = proposal("NCKH-2");
        ProposalStore::insert(&store, original.clone()).await.unwrap();
        CouncilStore::insert(&store, council("c1")).await.unwrap();

        let deleted = store
            .delete_if_unreferenced("c1", &|proposals: &[Proposal]| refuse_live_references("c1", proposals))
            .await
            .unwrap();
        assert!(deleted);

        let mut assigned = original.clone();
        assigned.state = ProposalState::SchoolCouncilOutlineReview;
        assigned.council_id = Some("c1".to_string());
        match store.compare_and_swap(0, assigned).await {
            Err(WorkflowError::NotFound { entity: "council", id }) => assert_eq!(id, "c1"),
            other => panic!("expected missing council, got {other:?}"),
        }
        let stored = ProposalStore::get(&store, &original.id).await.unwrap().unwrap();
        assert_eq!((stored.version, stored.council_id), (0, None));

        // a closed proposal may keep pointing at a council that is gone
        let mut closed = original.clone();
        closed.state = ProposalState::Cancelled;
        closed.council_id = Some("c1".to_string());
        assert!(store.compare_and_swap(0, closed).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_refuses_council_with_live_reference() {
        let store = MemoryStore::new();
        CouncilStore::insert(&store, council("c1")).await.unwrap();
        let mut live = proposal("NCKH-3");
        live.state = ProposalState::FacultyCouncilOutlineReview;
        live.council_id = Some("c1".to_string());
        ProposalStore::insert(&store, live.clone()).await.unwrap();

        let err = store
            .delete_if_unreferenced("c1", &|proposals: &[Proposal]| refuse_live_references("c1", proposals))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InUse { ref proposals, .. } if proposals == &vec![live.id.clone()]));
        assert!(CouncilStore::get(&store, "c1").await.unwrap().is_some());

        let missing = store
            .delete_if_unreferenced("nope", &|proposals: &[Proposal]| refuse_live_references("nope", proposals))
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn test_replace_draft_rejects_stale_copy() {
        let store = MemoryStore::new();
        let draft = Evaluation::new_draft("p1", "c1", 1, "m1", CouncilRole::Member, Utc::now());
        store.get_or_insert(draft.clone()).await.unwrap();

        let mut patched = draft.clone();
        patched.other_comments = "patched".to_string();
        let saved = store.replace_draft(0, patched).await.unwrap();
        assert_eq!(saved.version, 1);

        // a writer still holding version 0 must not clobber the patch
        let mut stale = draft.clone();
        stale.other_comments = "stale".to_string();
        match store.replace_draft(0, stale).await {
            Err(WorkflowError::ConcurrentModification { expected, actual, .. }) => {
                assert_eq!((expected, actual), (0, 1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let stored = store.find("p1", 1, "m1").await.unwrap().unwrap();
        assert_eq!(stored.other_comments, "patched");
    }
}
