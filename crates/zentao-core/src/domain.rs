//! Cross-tool domain records produced by Convert.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Generates the stable domain id of a tool-layer record, e.g. `zentao:ZentaoTask:1:42`.
pub fn domain_id(tool_entity: &str, connection_id: u64, key: impl Display) -> String {
    format!("zentao:{tool_entity}:{connection_id}:{key}")
}

pub trait DomainEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn domain_key(&self) -> String;
}

pub mod status {
    pub const TODO: &str = "TODO";
    pub const IN_PROGRESS: &str = "IN_PROGRESS";
    pub const DONE: &str = "DONE";
    pub const OTHER: &str = "OTHER";
}

pub mod issue_type {
    pub const REQUIREMENT: &str = "REQUIREMENT";
    pub const BUG: &str = "BUG";
    pub const TASK: &str = "TASK";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Account {
    pub id: String,
    pub user_name: String,
    pub full_name: String,
    pub email: String,
    pub avatar_url: String,
    pub organization: String,
    /// Created on demand for a referenced account the remote system no longer lists.
    pub placeholder: bool,
}

impl DomainEntity for Account {
    const TABLE: &'static str = "accounts";

    fn domain_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: String,
    pub board_type: String,
}

impl DomainEntity for Board {
    const TABLE: &'static str = "boards";

    fn domain_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Sprint {
    pub id: String,
    pub name: String,
    pub url: String,
    pub status: String,
    pub started_date: Option<DateTime<Utc>>,
    pub ended_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub original_board_id: String,
}

impl DomainEntity for Sprint {
    const TABLE: &'static str = "sprints";

    fn domain_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BoardSprint {
    pub board_id: String,
    pub sprint_id: String,
}

impl DomainEntity for BoardSprint {
    const TABLE: &'static str = "board_sprints";

    fn domain_key(&self) -> String {
        format!("{}|{}", self.board_id, self.sprint_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Issue {
    pub id: String,
    pub url: String,
    pub issue_key: String,
    pub title: String,
    pub description: String,
    pub issue_type: String,
    pub original_type: String,
    pub status: String,
    pub original_status: String,
    pub priority: String,
    pub parent_issue_id: String,
    pub creator_id: String,
    pub creator_name: String,
    pub assignee_id: String,
    pub assignee_name: String,
    pub created_date: Option<DateTime<Utc>>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub story_point: Option<f64>,
    pub original_estimate_minutes: Option<i64>,
    pub time_spent_minutes: Option<i64>,
    pub time_remaining_minutes: Option<i64>,
    pub lead_time_minutes: Option<i64>,
}

impl DomainEntity for Issue {
    const TABLE: &'static str = "issues";

    fn domain_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BoardIssue {
    pub board_id: String,
    pub issue_id: String,
}

impl DomainEntity for BoardIssue {
    const TABLE: &'static str = "board_issues";

    fn domain_key(&self) -> String {
        format!("{}|{}", self.board_id, self.issue_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SprintIssue {
    pub sprint_id: String,
    pub issue_id: String,
}

impl DomainEntity for SprintIssue {
    const TABLE: &'static str = "sprint_issues";

    fn domain_key(&self) -> String {
        format!("{}|{}", self.sprint_id, self.issue_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IssueRepoCommit {
    pub issue_id: String,
    pub repo_url: String,
    pub commit_sha: String,
    pub host: String,
    pub namespace: String,
    pub repo_name: String,
}

impl DomainEntity for IssueRepoCommit {
    const TABLE: &'static str = "issue_repo_commits";

    fn domain_key(&self) -> String {
        format!("{}|{}", self.issue_id, self.commit_sha)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IssueChangelog {
    pub id: String,
    pub issue_id: String,
    pub author_id: String,
    pub author_name: String,
    pub field_id: String,
    pub field_name: String,
    pub original_from_value: String,
    pub original_to_value: String,
    pub created_date: Option<DateTime<Utc>>,
}

impl DomainEntity for IssueChangelog {
    const TABLE: &'static str = "issue_changelogs";

    fn domain_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IssueWorklog {
    pub id: String,
    pub issue_id: String,
    pub author_id: String,
    pub comment: String,
    pub time_spent_minutes: i64,
    pub logged_date: Option<DateTime<Utc>>,
    pub started_date: Option<DateTime<Utc>>,
}

impl DomainEntity for IssueWorklog {
    const TABLE: &'static str = "issue_worklogs";

    fn domain_key(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_ids_are_stable_and_scoped_by_connection() {
        assert_eq!(domain_id("ZentaoTask", 1, 42), "zentao:ZentaoTask:1:42");
        assert_ne!(domain_id("ZentaoTask", 1, 42), domain_id("ZentaoTask", 2, 42));
    }

    #[test]
    fn link_rows_key_on_both_sides() {
        let link = SprintIssue {
            sprint_id: "s".into(),
            issue_id: "i".into(),
        };
        assert_eq!(link.domain_key(), "s|i");
    }
}
