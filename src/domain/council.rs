use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouncilType {
    Outline,
    Acceptance,
    FacultyOutline,
    FacultyAcceptance,
    Review,
}

impl CouncilType {
    pub fn is_faculty(&self) -> bool {
        matches!(self, CouncilType::FacultyOutline | CouncilType::FacultyAcceptance)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CouncilType::Outline => "OUTLINE",
            CouncilType::Acceptance => "ACCEPTANCE",
            CouncilType::FacultyOutline => "FACULTY_OUTLINE",
            CouncilType::FacultyAcceptance => "FACULTY_ACCEPTANCE",
            CouncilType::Review => "REVIEW",
        }
    }
}

impl fmt::Display for CouncilType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seat a user holds on a council. Closed set; anything else is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouncilRole {
    Chair,
    Secretary,
    Member,
}

/// Caller-supplied council composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilSpec {
    pub name: String,
    pub council_type: CouncilType,
    #[serde(default)]
    pub faculty_id: Option<String>,
    pub secretary_id: String,
    #[serde(default)]
    pub chair_id: Option<String>,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Council {
    pub id: String,
    pub name: String,
    pub council_type: CouncilType,
    pub faculty_id: Option<String>,
    pub secretary_id: String,
    pub chair_id: Option<String>,
    /// All members, secretary included.
    pub member_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Council {
    /// Members who score and vote: everyone except the secretary.
    pub fn voting_members(&self) -> impl Iterator<Item = &String> {
        self.member_ids
            .iter()
            .filter(move |id| **id != self.secretary_id)
    }

    pub fn voting_count(&self) -> usize {
        self.voting_members().count()
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.member_ids.contains(user_id)
    }

    pub fn is_secretary(&self, user_id: &str) -> bool {
        self.secretary_id == user_id
    }

    pub fn is_voting_member(&self, user_id: &str) -> bool {
        self.is_member(user_id) && !self.is_secretary(user_id)
    }

    pub fn role_of(&self, user_id: &str) -> Option<CouncilRole> {
        if self.is_secretary(user_id) {
            Some(CouncilRole::Secretary)
        } else if self.chair_id.as_deref() == Some(user_id) {
            Some(CouncilRole::Chair)
        } else if self.is_member(user_id) {
            Some(CouncilRole::Member)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn council() -> Council {
        Council {
            id: "c1".to_string(),
            name: "Hoi dong khoa CNTT".to_string(),
            council_type: CouncilType::FacultyOutline,
            faculty_id: Some("CNTT".to_string()),
            secretary_id: "tk".to_string(),
            chair_id: Some("ct".to_string()),
            member_ids: ["tk", "ct", "m1", "m2"]
                .into_iter()
                .map(String::from)
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_secretary_is_not_a_voting_member() {
        let council = council();
        assert_eq!(council.voting_count(), 3);
        assert!(council.is_member("tk"));
        assert!(!council.is_voting_member("tk"));
        assert!(council.is_voting_member("m1"));
    }

    #[test]
    fn test_role_of_resolves_each_seat() {
        let council = council();
        assert_eq!(council.role_of("tk"), Some(CouncilRole::Secretary));
        assert_eq!(council.role_of("ct"), Some(CouncilRole::Chair));
        assert_eq!(council.role_of("m2"), Some(CouncilRole::Member));
        assert_eq!(council.role_of("outsider"), None);
    }

    #[test]
    fn test_unknown_council_role_is_rejected() {
        let parsed: Result<CouncilRole, _> = serde_json::from_str("\"OBSERVER\"");
        assert!(parsed.is_err());
    }
}
