//! Core connection, scope and entity model for the Zentao connector.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod de;
pub mod domain;
pub mod tool;

pub const CRATE_NAME: &str = "zentao-core";

/// Fixed versioned API path that separates the REST endpoint from the web UI root.
pub const API_PATH_SUFFIX: &str = "/api.php/v1";

pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 18_000;

fn default_rate_limit() -> u32 {
    DEFAULT_RATE_LIMIT_PER_HOUR
}

/// One remote Zentao installation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Connection {
    pub id: u64,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_hour: u32,
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub db_logging_level: Option<String>,
    #[serde(default)]
    pub db_idle_conns: Option<u32>,
    #[serde(default)]
    pub db_max_conns: Option<u32>,
}

impl Connection {
    /// Mirror database URL, if one is configured and non-blank.
    pub fn remote_db_url(&self) -> Option<&str> {
        self.db_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("rate_limit_per_hour", &self.rate_limit_per_hour)
            .field("db_url", &self.remote_db_url().map(|_| "<redacted>"))
            .field("db_logging_level", &self.db_logging_level)
            .field("db_idle_conns", &self.db_idle_conns)
            .field("db_max_conns", &self.db_max_conns)
            .finish()
    }
}

/// Domain areas a unit of work belongs to; scope configs enable them selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainType {
    Ticket,
    Cross,
}

/// Per-scope collection rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConfig {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub connection_id: u64,
    #[serde(default)]
    pub name: String,
    /// Empty means every domain type is enabled.
    #[serde(default)]
    pub entities: Vec<DomainType>,
    /// Zentao issue type (`task`, `story`, `bug`, or a task sub-type) -> standard issue type.
    #[serde(default)]
    pub type_mappings: BTreeMap<String, String>,
    /// Zentao status -> standard status (`TODO`, `IN_PROGRESS`, `DONE`).
    #[serde(default)]
    pub status_mappings: BTreeMap<String, String>,
}

impl ScopeConfig {
    pub fn enables(&self, domain: DomainType) -> bool {
        self.entities.is_empty() || self.entities.contains(&domain)
    }
}

/// One Zentao project selected for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ZentaoProject {
    pub connection_id: u64,
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, rename = "type")]
    pub project_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope_config_id: Option<u64>,
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("malformed task options: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connectionId is required")]
    MissingConnectionId,
}

/// Options handed to a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default)]
    pub connection_id: u64,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub scope_config_id: Option<u64>,
    #[serde(default)]
    pub scope_config: Option<ScopeConfig>,
}

impl TaskOptions {
    pub fn decode(value: serde_json::Value) -> Result<Self, OptionsError> {
        let mut options: TaskOptions = serde_json::from_value(value)?;
        if options.connection_id == 0 {
            return Err(OptionsError::MissingConnectionId);
        }
        options.project_id = options.project_id.filter(|id| *id > 0);
        options.scope_config_id = options.scope_config_id.filter(|id| *id > 0);
        Ok(options)
    }
}

/// Run-level policy chosen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Re-process already collected raw data without opening any remote source.
    pub skip_collectors: bool,
}

/// The three issue-like entity classes Zentao exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Task,
    Story,
    Bug,
}

impl IssueKind {
    pub const ALL: [IssueKind; 3] = [IssueKind::Task, IssueKind::Story, IssueKind::Bug];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::Task => "task",
            IssueKind::Story => "story",
            IssueKind::Bug => "bug",
        }
    }

    /// Tool-layer entity name used when generating domain ids.
    pub fn tool_entity(self) -> &'static str {
        match self {
            IssueKind::Task => "ZentaoTask",
            IssueKind::Story => "ZentaoStory",
            IssueKind::Bug => "ZentaoBug",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity family a pipeline unit is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityFamily {
    Project,
    Account,
    Department,
    ExecutionSummary,
    /// Global execution listing, for installations where the per-project listing misses
    /// executions.
    ExecutionSummaryDev,
    Execution,
    Task,
    TaskCommit,
    TaskRepoCommit,
    Story,
    ExecutionStory,
    Bug,
    StoryCommit,
    StoryRepoCommit,
    BugCommit,
    BugRepoCommit,
    Changelog,
    TaskWorklog,
}

impl EntityFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityFamily::Project => "project",
            EntityFamily::Account => "account",
            EntityFamily::Department => "department",
            EntityFamily::ExecutionSummary => "execution_summary",
            EntityFamily::ExecutionSummaryDev => "execution_summary_dev",
            EntityFamily::Execution => "execution",
            EntityFamily::Task => "task",
            EntityFamily::TaskCommit => "task_commit",
            EntityFamily::TaskRepoCommit => "task_repo_commit",
            EntityFamily::Story => "story",
            EntityFamily::ExecutionStory => "execution_story",
            EntityFamily::Bug => "bug",
            EntityFamily::StoryCommit => "story_commit",
            EntityFamily::StoryRepoCommit => "story_repo_commit",
            EntityFamily::BugCommit => "bug_commit",
            EntityFamily::BugRepoCommit => "bug_repo_commit",
            EntityFamily::Changelog => "changelog",
            EntityFamily::TaskWorklog => "task_worklog",
        }
    }

    /// Staging table holding the raw collected records of this family.
    pub fn raw_table(self) -> &'static str {
        match self {
            EntityFamily::Project => "_raw_zentao_projects",
            EntityFamily::Account => "_raw_zentao_accounts",
            EntityFamily::Department => "_raw_zentao_departments",
            EntityFamily::ExecutionSummary => "_raw_zentao_execution_summaries",
            EntityFamily::ExecutionSummaryDev => "_raw_zentao_execution_summary_devs",
            EntityFamily::Execution => "_raw_zentao_executions",
            EntityFamily::Task => "_raw_zentao_tasks",
            EntityFamily::TaskCommit => "_raw_zentao_task_commits",
            EntityFamily::TaskRepoCommit => "_raw_zentao_task_repo_commits",
            EntityFamily::Story => "_raw_zentao_stories",
            EntityFamily::ExecutionStory => "_raw_zentao_execution_stories",
            EntityFamily::Bug => "_raw_zentao_bugs",
            EntityFamily::StoryCommit => "_raw_zentao_story_commits",
            EntityFamily::StoryRepoCommit => "_raw_zentao_story_repo_commits",
            EntityFamily::BugCommit => "_raw_zentao_bug_commits",
            EntityFamily::BugRepoCommit => "_raw_zentao_bug_repo_commits",
            EntityFamily::Changelog => "_raw_zentao_changelogs",
            EntityFamily::TaskWorklog => "_raw_zentao_task_worklogs",
        }
    }

    /// Accounts and departments belong to the whole installation, not to a project.
    pub fn is_connection_wide(self) -> bool {
        matches!(self, EntityFamily::Account | EntityFamily::Department)
    }

    /// Issue class whose commit links this family carries.
    pub fn commit_kind(self) -> Option<IssueKind> {
        match self {
            EntityFamily::TaskCommit | EntityFamily::TaskRepoCommit => Some(IssueKind::Task),
            EntityFamily::StoryCommit | EntityFamily::StoryRepoCommit => Some(IssueKind::Story),
            EntityFamily::BugCommit | EntityFamily::BugRepoCommit => Some(IssueKind::Bug),
            _ => None,
        }
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_require_connection_id() {
        let err = TaskOptions::decode(json!({"projectId": 3})).unwrap_err();
        assert!(matches!(err, OptionsError::MissingConnectionId));

        let err = TaskOptions::decode(json!({"connectionId": "one"})).unwrap_err();
        assert!(matches!(err, OptionsError::Malformed(_)));
    }

    #[test]
    fn options_treat_zero_ids_as_unset() {
        let options =
            TaskOptions::decode(json!({"connectionId": 1, "projectId": 0, "scopeConfigId": 0}))
                .unwrap();
        assert_eq!(options.connection_id, 1);
        assert_eq!(options.project_id, None);
        assert_eq!(options.scope_config_id, None);
    }

    #[test]
    fn scope_config_without_entities_enables_everything() {
        let mut config = ScopeConfig::default();
        assert!(config.enables(DomainType::Ticket));
        assert!(config.enables(DomainType::Cross));

        config.entities = vec![DomainType::Ticket];
        assert!(config.enables(DomainType::Ticket));
        assert!(!config.enables(DomainType::Cross));
    }

    #[test]
    fn connection_debug_redacts_secrets() {
        let connection = Connection {
            id: 1,
            password: "hunter2".into(),
            db_url: Some("mysql://root:secret@db/zentao".into()),
            ..Default::default()
        };
        let text = format!("{connection:?}");
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("secret"));
        assert_eq!(connection.remote_db_url(), Some("mysql://root:secret@db/zentao"));
    }

    #[test]
    fn blank_db_url_means_no_mirror() {
        let connection = Connection {
            db_url: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(connection.remote_db_url(), None);
    }
}
