//! Storage seams for proposals, councils, evaluations and idempotency records.
//!
//! Proposals are only ever written through [`ProposalStore::compare_and_swap`];
//! the version check and the write happen under one lock, so two writers racing
//! on the same snapshot cannot both commit.
//!
//! A committed proposal never names a council that is not stored: the CAS
//! refuses dangling council ids, and [`CouncilStore::delete_if_unreferenced`]
//! holds proposal commits off while it checks references and deletes.

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Council, Evaluation, Proposal};
use crate::errors::WorkflowError;
use crate::idempotency::IdempotencyRecord;

pub use memory::MemoryStore;
pub use snapshot::{FileSystemPersistence, SnapshotError, SnapshotPersistence, StoreSnapshot};

#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Inserts a new proposal. Fails if the id or code is already taken.
    async fn insert(&self, proposal: Proposal) -> Result<(), WorkflowError>;

    async fn get(&self, id: &str) -> Result<Option<Proposal>, WorkflowError>;

    /// Replaces the stored proposal if its version still equals
    /// `expected_version`, bumping the version. Returns the stored snapshot.
    /// Fails with `NotFound` if a live proposal names a council that is gone.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        proposal: Proposal,
    ) -> Result<Proposal, WorkflowError>;
}

#[async_trait]
pub trait CouncilStore: Send + Sync {
    async fn insert(&self, council: Council) -> Result<(), WorkflowError>;

    async fn get(&self, id: &str) -> Result<Option<Council>, WorkflowError>;

    /// Deletes the council once `ensure_unreferenced` accepts the stored
    /// proposals. No proposal commit can land between the check and the
    /// delete. Returns false if there was nothing to delete.
    async fn delete_if_unreferenced(
        &self,
        id: &str,
        ensure_unreferenced: &(dyn for<'p> Fn(&'p [Proposal]) -> Result<(), WorkflowError> + Sync),
    ) -> Result<bool, WorkflowError>;
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Returns the evaluation for `(proposal, cycle, evaluator)` of `draft`,
    /// inserting `draft` if none exists. The flag is true when it was inserted.
    async fn get_or_insert(&self, draft: Evaluation) -> Result<(Evaluation, bool), WorkflowError>;

    async fn find(
        &self,
        proposal_id: &str,
        cycle: u32,
        evaluator_id: &str,
    ) -> Result<Option<Evaluation>, WorkflowError>;

    /// Every evaluation ever written for the proposal, all cycles.
    async fn list_for_proposal(&self, proposal_id: &str) -> Result<Vec<Evaluation>, WorkflowError>;

    /// Overwrites a stored evaluation that is still DRAFT and still at
    /// `expected_version`, bumping the version.
    async fn replace_draft(
        &self,
        expected_version: u64,
        evaluation: Evaluation,
    ) -> Result<Evaluation, WorkflowError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, WorkflowError>;

    /// Fails if the key is already recorded.
    async fn insert(&self, record: IdempotencyRecord) -> Result<(), WorkflowError>;

    /// Drops records created before `cutoff`, returning how many went.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, WorkflowError>;

    async fn list(&self) -> Result<Vec<IdempotencyRecord>, WorkflowError>;
}

/// The stores a workflow service runs against.
#[derive(Clone)]
pub struct Repository {
    pub proposals: Arc<dyn ProposalStore>,
    pub councils: Arc<dyn CouncilStore>,
    pub evaluations: Arc<dyn EvaluationStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl Repository {
    /// All four seams backed by one in-memory store.
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            proposals: store.clone(),
            councils: store.clone(),
            evaluations: store.clone(),
            idempotency: store,
        }
    }

    pub fn with_idempotency(mut self, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = idempotency;
        self
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

/// Runs one store call under `timeout`.
pub async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, WorkflowError>
where
    F: Future<Output = Result<T, WorkflowError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = timeout.as_millis() as u64, "Store call timed out");
            Err(WorkflowError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_reports_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, WorkflowError>(())
        };
        let err = bounded("proposal.get", Duration::from_millis(50), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout { timeout_ms: 50, .. }));
        assert!(err.is_retryable());
    }
}
