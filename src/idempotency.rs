//! At-most-once execution of keyed requests.
//!
//! A request carrying an idempotency key runs at most once per key. The first
//! successful result is recorded and replayed for every retry with the same
//! key; failures are never recorded, so a failed request may be retried with
//! the same key. Requests sharing a key are serialized on a per-key lock, which
//! makes the check and the record insert a single step from the caller's view.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::ActionType;
use crate::errors::WorkflowError;
use crate::store::{bounded, IdempotencyStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub proposal_id: String,
    pub action: ActionType,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Whether the result came from running the request or from the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    Executed(T),
    Replayed(T),
}

impl<T> Execution<T> {
    pub fn into_inner(self) -> T {
        match self {
            Execution::Executed(value) | Execution::Replayed(value) => value,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

type KeySlot = Arc<tokio::sync::Mutex<()>>;

pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    slots: Mutex<HashMap<String, KeySlot>>,
    timeout: Duration,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, timeout: Duration) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Runs `operation` unless `key` already recorded a result for the same
    /// proposal and action. Without a key the operation simply runs.
    pub async fn execute<T, F, Fut>(
        &self,
        key: Option<&str>,
        proposal_id: &str,
        action: ActionType,
        operation: F,
    ) -> Result<Execution<T>, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let Some(key) = key else {
            return operation().await.map(Execution::Executed);
        };
        if key.trim().is_empty() {
            return Err(WorkflowError::invalid_field(
                "idempotency_key",
                "idempotency key must not be blank",
            ));
        }

        let slot = self.acquire_slot(key);
        let result = {
            let _held = slot.lock().await;
            self.execute_locked(key, proposal_id, action, operation).await
        };
        self.release_slot(key, slot);
        result
    }

    async fn execute_locked<T, F, Fut>(
        &self,
        key: &str,
        proposal_id: &str,
        action: ActionType,
        operation: F,
    ) -> Result<Execution<T>, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(record) = bounded("idempotency.get", self.timeout, self.store.get(key)).await? {
            if record.proposal_id != proposal_id || record.action != action {
                warn!(
                    key,
                    recorded_proposal = %record.proposal_id,
                    recorded_action = %record.action,
                    proposal_id,
                    action = %action,
                    "Idempotency key reused for a different request"
                );
                return Err(WorkflowError::invalid_field(
                    "idempotency_key",
                    format!(
                        "key '{key}' was already used for {} on proposal '{}'",
                        record.action, record.proposal_id
                    ),
                ));
            }
            debug!(key, proposal_id, action = %action, "Replaying recorded result");
            let value = serde_json::from_value(record.result)?;
            return Ok(Execution::Replayed(value));
        }

        let value = operation().await?;
        let record = IdempotencyRecord {
            key: key.to_string(),
            proposal_id: proposal_id.to_string(),
            action,
            result: serde_json::to_value(&value)?,
            created_at: Utc::now(),
        };
        if let Err(e) = bounded("idempotency.insert", self.timeout, self.store.insert(record)).await {
            // The operation already committed; losing the record only weakens replay.
            warn!(key, error = %e, "Failed to record idempotency result");
        }
        Ok(Execution::Executed(value))
    }

    fn acquire_slot(&self, key: &str) -> KeySlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }

    fn release_slot(&self, key: &str, slot: KeySlot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // map + ours: nobody else is waiting
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
    }

    /// Number of keys with a request currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops records older than `retention`.
    pub async fn purge_expired(&self, retention: ChronoDuration) -> Result<usize, WorkflowError> {
        let cutoff = Utc::now() - retention;
        let purged = bounded(
            "idempotency.purge",
            self.timeout,
            self.store.purge_older_than(cutoff),
        )
        .await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}
