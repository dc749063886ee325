//! Council composition rules.
//!
//! A council is a secretary plus voting members. The secretary keeps the minutes
//! and finalizes, but never scores, so it is excluded from the voting count.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::config::CouncilConfig;
use crate::domain::{Council, CouncilSpec, Proposal};
use crate::errors::WorkflowError;

pub const MIN_VOTING_MEMBERS: usize = 3;

/// Resolves which faculty a user belongs to. Supplied by the identity context.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait FacultyDirectory: Send + Sync {
    fn faculty_of(&self, user_id: &str) -> Option<String>;
}

/// Directory backed by a fixed user → faculty map.
#[derive(Debug, Clone, Default)]
pub struct StaticFacultyDirectory {
    members: HashMap<String, String>,
}

impl StaticFacultyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, user_id: impl Into<String>, faculty_id: impl Into<String>) -> Self {
        self.members.insert(user_id.into(), faculty_id.into());
        self
    }

    pub fn from_map(members: HashMap<String, String>) -> Self {
        Self { members }
    }
}

impl FacultyDirectory for StaticFacultyDirectory {
    fn faculty_of(&self, user_id: &str) -> Option<String> {
        self.members.get(user_id).cloned()
    }
}

/// Validates council specs and guards deletion.
pub struct CouncilRegistry {
    directory: std::sync::Arc<dyn FacultyDirectory>,
    policy: CouncilConfig,
}

impl std::fmt::Debug for CouncilRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouncilRegistry")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CouncilRegistry {
    pub fn new(directory: std::sync::Arc<dyn FacultyDirectory>, policy: CouncilConfig) -> Self {
        Self { directory, policy }
    }

    /// Builds a council from `spec`, enforcing composition rules.
    pub fn build(&self, spec: CouncilSpec, now: DateTime<Utc>) -> Result<Council, WorkflowError> {
        if spec.name.trim().is_empty() {
            return Err(WorkflowError::invalid_field("name", "council name is required"));
        }
        if spec.secretary_id.trim().is_empty() {
            return Err(WorkflowError::invalid_field(
                "secretary_id",
                "a council needs a secretary",
            ));
        }

        let mut member_ids: BTreeSet<String> = spec
            .member_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        member_ids.insert(spec.secretary_id.clone());

        if let Some(chair) = &spec.chair_id {
            if *chair == spec.secretary_id || !member_ids.contains(chair) {
                return Err(WorkflowError::invalid_field(
                    "chair_id",
                    format!("chair '{chair}' must be a voting member"),
                ));
            }
        }

        let voting = member_ids.len() - 1;
        let strict = spec.council_type.is_faculty() || self.policy.strict_voting_for_all_types;
        if strict {
            if voting < MIN_VOTING_MEMBERS || voting % 2 == 0 {
                return Err(WorkflowError::invalid_field(
                    "member_ids",
                    format!(
                        "a {} council needs an odd number of at least {MIN_VOTING_MEMBERS} voting members, got {voting}",
                        spec.council_type
                    ),
                ));
            }
        } else if voting == 0 {
            return Err(WorkflowError::invalid_field(
                "member_ids",
                "a council needs at least one voting member",
            ));
        }

        let mut faculty_id = spec.faculty_id.clone();
        if spec.council_type.is_faculty() {
            let council_faculty = spec.faculty_id.as_deref().ok_or_else(|| {
                WorkflowError::invalid_field(
                    "faculty_id",
                    format!("a {} council must name its faculty", spec.council_type),
                )
            })?;
            for member in &member_ids {
                let member_faculty = self.lookup(member)?;
                if member_faculty != council_faculty {
                    return Err(WorkflowError::invalid_field(
                        "member_ids",
                        format!(
                            "member '{member}' belongs to faculty '{member_faculty}', not '{council_faculty}'"
                        ),
                    ));
                }
            }
        } else {
            for member in &member_ids {
                self.lookup(member)?;
            }
            faculty_id = faculty_id.filter(|f| !f.trim().is_empty());
        }

        let council = Council {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            council_type: spec.council_type,
            faculty_id,
            secretary_id: spec.secretary_id,
            chair_id: spec.chair_id,
            member_ids,
            created_at: now,
        };
        debug!(
            council_id = %council.id,
            council_type = %council.council_type,
            voting = voting,
            "Council composition accepted"
        );
        Ok(council)
    }

    fn lookup(&self, user_id: &str) -> Result<String, WorkflowError> {
        self.directory.faculty_of(user_id).ok_or_else(|| {
            WorkflowError::invalid_field(
                "member_ids",
                format!("member '{user_id}' is not known to the faculty directory"),
            )
        })
    }

    /// A council may be deleted only when no live proposal references it.
    pub fn ensure_deletable(
        &self,
        council_id: &str,
        proposals: &[Proposal],
    ) -> Result<(), WorkflowError> {
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
}
