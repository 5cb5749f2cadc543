//! Tool-layer entities: the normalized form of Zentao records produced by Extract.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::IssueKind;

/// A tool-layer row, upserted by `(TABLE, connection_id, record_key)`.
pub trait ToolEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn record_key(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoAccount {
    pub connection_id: u64,
    pub id: i64,
    pub account: String,
    pub realname: String,
    pub avatar: String,
    pub email: String,
    pub dept: i64,
    pub role: String,
    pub deleted: bool,
}

impl ToolEntity for ZentaoAccount {
    const TABLE: &'static str = "_tool_zentao_accounts";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoDepartment {
    pub connection_id: u64,
    pub id: i64,
    pub name: String,
    pub parent: i64,
    pub path: String,
    pub grade: i64,
    pub order: i64,
    pub manager: String,
}

impl ToolEntity for ZentaoDepartment {
    const TABLE: &'static str = "_tool_zentao_departments";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

/// Execution listing entry; drives per-execution detail collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoExecutionSummary {
    pub connection_id: u64,
    pub project_id: i64,
    pub id: i64,
    pub name: String,
    pub execution_type: String,
    pub status: String,
}

impl ToolEntity for ZentaoExecutionSummary {
    const TABLE: &'static str = "_tool_zentao_execution_summaries";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoExecution {
    pub connection_id: u64,
    pub project_id: i64,
    pub id: i64,
    pub name: String,
    pub code: String,
    pub execution_type: String,
    pub status: String,
    pub parent: i64,
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub real_began: Option<DateTime<Utc>>,
    pub real_end: Option<DateTime<Utc>>,
    pub opened_by: String,
    pub opened_date: Option<DateTime<Utc>>,
    pub closed_by: String,
    pub closed_date: Option<DateTime<Utc>>,
    pub description: String,
}

impl ToolEntity for ZentaoExecution {
    const TABLE: &'static str = "_tool_zentao_executions";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoTask {
    pub connection_id: u64,
    pub project_id: i64,
    pub execution_id: i64,
    pub id: i64,
    pub story_id: i64,
    pub parent_id: i64,
    pub name: String,
    pub task_type: String,
    pub pri: i64,
    pub status: String,
    pub assigned_to: String,
    pub opened_by: String,
    pub opened_date: Option<DateTime<Utc>>,
    pub finished_by: String,
    pub finished_date: Option<DateTime<Utc>>,
    pub closed_date: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub estimate: f64,
    pub consumed: f64,
    pub left: f64,
    pub description: String,
}

impl ToolEntity for ZentaoTask {
    const TABLE: &'static str = "_tool_zentao_tasks";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoStory {
    pub connection_id: u64,
    pub project_id: i64,
    pub product_id: i64,
    pub id: i64,
    pub parent_id: i64,
    pub title: String,
    pub story_type: String,
    pub status: String,
    pub stage: String,
    pub pri: i64,
    pub estimate: f64,
    pub opened_by: String,
    pub opened_date: Option<DateTime<Utc>>,
    pub assigned_to: String,
    pub closed_date: Option<DateTime<Utc>>,
}

impl ToolEntity for ZentaoStory {
    const TABLE: &'static str = "_tool_zentao_stories";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

/// Link between an execution and a story planned into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoExecutionStory {
    pub connection_id: u64,
    pub project_id: i64,
    pub execution_id: i64,
    pub story_id: i64,
    pub product_id: i64,
}

impl ToolEntity for ZentaoExecutionStory {
    const TABLE: &'static str = "_tool_zentao_execution_stories";

    fn record_key(&self) -> String {
        format!("{}:{}", self.execution_id, self.story_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoBug {
    pub connection_id: u64,
    pub project_id: i64,
    pub product_id: i64,
    pub execution_id: i64,
    pub id: i64,
    pub story_id: i64,
    pub task_id: i64,
    pub title: String,
    pub severity: i64,
    pub pri: i64,
    pub bug_type: String,
    pub status: String,
    pub opened_by: String,
    pub opened_date: Option<DateTime<Utc>>,
    pub assigned_to: String,
    pub resolved_by: String,
    pub resolved_date: Option<DateTime<Utc>>,
    pub closed_date: Option<DateTime<Utc>>,
    pub resolution: String,
}

impl ToolEntity for ZentaoBug {
    const TABLE: &'static str = "_tool_zentao_bugs";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

/// A commit-link action recorded against a task, story or bug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZentaoCommitAction {
    pub connection_id: u64,
    pub project_id: i64,
    pub object_type: IssueKind,
    pub object_id: i64,
    pub action_id: i64,
    pub action: String,
    pub actor: String,
    pub date: Option<DateTime<Utc>>,
    pub extra: String,
    pub comment: String,
}

impl ToolEntity for ZentaoCommitAction {
    const TABLE: &'static str = "_tool_zentao_commit_actions";

    fn record_key(&self) -> String {
        format!("{}:{}", self.object_type, self.action_id)
    }
}

/// Repository commit derived from a commit-link action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZentaoRepoCommit {
    pub connection_id: u64,
    pub project_id: i64,
    pub object_type: IssueKind,
    pub object_id: i64,
    pub repo_url: String,
    pub commit_sha: String,
    pub host: String,
    pub namespace: String,
    pub repo_name: String,
}

impl ToolEntity for ZentaoRepoCommit {
    const TABLE: &'static str = "_tool_zentao_repo_commits";

    fn record_key(&self) -> String {
        format!("{}:{}:{}", self.object_type, self.object_id, self.commit_sha)
    }
}

/// One field change read from the mirror database history tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZentaoChangelog {
    pub connection_id: u64,
    pub project_id: i64,
    pub id: i64,
    pub action_id: i64,
    pub object_type: IssueKind,
    pub object_id: i64,
    pub actor: String,
    pub action: String,
    pub date: Option<DateTime<Utc>>,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

impl ToolEntity for ZentaoChangelog {
    const TABLE: &'static str = "_tool_zentao_changelogs";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZentaoWorklog {
    pub connection_id: u64,
    pub project_id: i64,
    pub id: i64,
    pub task_id: i64,
    pub account: String,
    pub work: String,
    pub date: Option<DateTime<Utc>>,
    pub consumed: f64,
    pub left: f64,
}

impl ToolEntity for ZentaoWorklog {
    const TABLE: &'static str = "_tool_zentao_worklogs";

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}
