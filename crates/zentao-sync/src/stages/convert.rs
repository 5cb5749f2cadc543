use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;
use zentao_core::domain::{
    issue_type, status, Account, Board, BoardIssue, BoardSprint, DomainEntity, Issue,
    IssueChangelog, IssueRepoCommit, IssueWorklog, Sprint, SprintIssue,
};
use zentao_core::tool::{
    ToolEntity, ZentaoAccount, ZentaoBug, ZentaoChangelog, ZentaoDepartment, ZentaoExecution,
    ZentaoExecutionStory, ZentaoRepoCommit, ZentaoStory, ZentaoTask, ZentaoWorklog,
};
use zentao_core::{EntityFamily, IssueKind};
use zentao_storage::{load_tool, upsert_domain};

use super::unsupported;
use crate::context::TaskContext;
use crate::error::TaskError;
use crate::registry::StageKind;
use crate::scheduler::UnitStats;

const PROJECT_ENTITY: &str = "ZentaoProject";
const ACCOUNT_ENTITY: &str = "ZentaoAccount";
const EXECUTION_ENTITY: &str = "ZentaoExecution";
const CHANGELOG_ENTITY: &str = "ZentaoChangelog";
const WORKLOG_ENTITY: &str = "ZentaoWorklog";

mod sprint_status {
    pub const FUTURE: &str = "FUTURE";
    pub const ACTIVE: &str = "ACTIVE";
    pub const CLOSED: &str = "CLOSED";
}

pub(super) async fn convert(ctx: &TaskContext, family: EntityFamily) -> Result<UnitStats, TaskError> {
    match family {
        EntityFamily::Project => convert_project(ctx).await,
        EntityFamily::Account => convert_accounts(ctx).await,
        EntityFamily::Execution => convert_executions(ctx).await,
        EntityFamily::Task => {
            let tasks: Vec<ZentaoTask> = load(ctx, family).await?;
            convert_issues(ctx, tasks.iter().map(|task| task_issue(ctx, task)).collect()).await
        }
        EntityFamily::Story => {
            let stories: Vec<ZentaoStory> = load(ctx, family).await?;
            convert_issues(ctx, stories.iter().map(|story| story_issue(ctx, story)).collect()).await
        }
        EntityFamily::Bug => {
            let bugs: Vec<ZentaoBug> = load(ctx, family).await?;
            convert_issues(ctx, bugs.iter().map(|bug| bug_issue(ctx, bug)).collect()).await
        }
        EntityFamily::ExecutionStory => convert_execution_stories(ctx).await,
        EntityFamily::TaskRepoCommit | EntityFamily::StoryRepoCommit | EntityFamily::BugRepoCommit => {
            let Some(kind) = family.commit_kind() else {
                return Err(unsupported(StageKind::Convert, family));
            };
            convert_repo_commits(ctx, family, kind).await
        }
        EntityFamily::Changelog => convert_changelogs(ctx).await,
        EntityFamily::TaskWorklog => convert_worklogs(ctx).await,
        EntityFamily::Department
        | EntityFamily::ExecutionSummary
        | EntityFamily::ExecutionSummaryDev
        | EntityFamily::TaskCommit
        | EntityFamily::StoryCommit
        | EntityFamily::BugCommit => Err(unsupported(StageKind::Convert, family)),
    }
}

async fn load<T: ToolEntity>(ctx: &TaskContext, family: EntityFamily) -> Result<Vec<T>, TaskError> {
    Ok(load_tool(ctx.store.as_ref(), ctx.connection_id(), Some(ctx.scope_id(family))).await?)
}

async fn save<T: DomainEntity>(ctx: &TaskContext, rows: &[T]) -> Result<usize, TaskError> {
    if rows.is_empty() {
        return Ok(0);
    }
    Ok(upsert_domain(ctx.store.as_ref(), rows).await?)
}

fn board_id(ctx: &TaskContext) -> Option<String> {
    ctx.project_id()
        .map(|project_id| ctx.domain_id(PROJECT_ENTITY, project_id))
}

fn sprint_id(ctx: &TaskContext, execution_id: i64) -> String {
    ctx.domain_id(EXECUTION_ENTITY, execution_id)
}

fn issue_id(ctx: &TaskContext, kind: IssueKind, id: i64) -> String {
    ctx.domain_id(kind.tool_entity(), id)
}

fn hours_to_minutes(hours: f64) -> Option<i64> {
    (hours > 0.0).then(|| (hours * 60.0).round() as i64)
}

/// Status of a Zentao task, story or bug when the scope config has no mapping for it.
fn default_status(original: &str) -> &'static str {
    match original.trim().to_ascii_lowercase().as_str() {
        "wait" | "draft" | "active" | "reviewing" => status::TODO,
        "doing" | "pause" | "changing" => status::IN_PROGRESS,
        "done" | "closed" | "cancel" | "resolved" => status::DONE,
        _ => status::OTHER,
    }
}

fn sprint_status_of(original: &str) -> &'static str {
    match original.trim().to_ascii_lowercase().as_str() {
        "wait" => sprint_status::FUTURE,
        "closed" | "done" => sprint_status::CLOSED,
        _ => sprint_status::ACTIVE,
    }
}

fn mapped_status(ctx: &TaskContext, original: &str) -> String {
    ctx.scope_config
        .status_mappings
        .get(original)
        .cloned()
        .unwrap_or_else(|| default_status(original).to_string())
}

/// Looks the sub-type up first (`devel`, `codeerror`), then the issue class itself.
fn mapped_type(ctx: &TaskContext, kind: IssueKind, original: &str, default: &str) -> String {
    let mappings = &ctx.scope_config.type_mappings;
    mappings
        .get(original)
        .or_else(|| mappings.get(kind.as_str()))
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn lead_time(created: Option<DateTime<Utc>>, resolved: Option<DateTime<Utc>>) -> Option<i64> {
    match (created, resolved) {
        (Some(created), Some(resolved)) if resolved >= created => {
            Some((resolved - created).num_minutes())
        }
        _ => None,
    }
}

/// An issue before account references are resolved.
struct IssueDraft {
    kind: IssueKind,
    source_id: i64,
    execution_id: i64,
    creator: String,
    assignee: String,
    issue: Issue,
}

fn task_issue(ctx: &TaskContext, task: &ZentaoTask) -> IssueDraft {
    let resolution_date = task.finished_date.or(task.closed_date);
    IssueDraft {
        kind: IssueKind::Task,
        source_id: task.id,
        execution_id: task.execution_id,
        creator: task.opened_by.clone(),
        assignee: task.assigned_to.clone(),
        issue: Issue {
            id: issue_id(ctx, IssueKind::Task, task.id),
            url: ctx.issue_url(IssueKind::Task, task.id),
            issue_key: task.id.to_string(),
            title: task.name.clone(),
            description: task.description.clone(),
            issue_type: mapped_type(ctx, IssueKind::Task, &task.task_type, issue_type::TASK),
            original_type: task.task_type.clone(),
            status: mapped_status(ctx, &task.status),
            original_status: task.status.clone(),
            priority: task.pri.to_string(),
            parent_issue_id: if task.parent_id > 0 {
                issue_id(ctx, IssueKind::Task, task.parent_id)
            } else {
                String::new()
            },
            created_date: task.opened_date,
            resolution_date,
            due_date: task.deadline,
            original_estimate_minutes: hours_to_minutes(task.estimate),
            time_spent_minutes: hours_to_minutes(task.consumed),
            time_remaining_minutes: hours_to_minutes(task.left),
            lead_time_minutes: lead_time(task.opened_date, resolution_date),
            ..Default::default()
        },
    }
}

fn story_issue(ctx: &TaskContext, story: &ZentaoStory) -> IssueDraft {
    let original_type = if story.story_type.is_empty() {
        IssueKind::Story.as_str().to_string()
    } else {
        story.story_type.clone()
    };
    IssueDraft {
        kind: IssueKind::Story,
        source_id: story.id,
        execution_id: 0,
        creator: story.opened_by.clone(),
        assignee: story.assigned_to.clone(),
        issue: Issue {
            id: issue_id(ctx, IssueKind::Story, story.id),
            url: ctx.issue_url(IssueKind::Story, story.id),
            issue_key: story.id.to_string(),
            title: story.title.clone(),
            issue_type: mapped_type(ctx, IssueKind::Story, &original_type, issue_type::REQUIREMENT),
            original_type,
            status: mapped_status(ctx, &story.status),
            original_status: story.status.clone(),
            priority: story.pri.to_string(),
            parent_issue_id: if story.parent_id > 0 {
                issue_id(ctx, IssueKind::Story, story.parent_id)
            } else {
                String::new()
            },
            created_date: story.opened_date,
            resolution_date: story.closed_date,
            story_point: (story.estimate > 0.0).then_some(story.estimate),
            lead_time_minutes: lead_time(story.opened_date, story.closed_date),
            ..Default::default()
        },
    }
}

fn bug_issue(ctx: &TaskContext, bug: &ZentaoBug) -> IssueDraft {
    let resolution_date = bug.resolved_date.or(bug.closed_date);
    IssueDraft {
        kind: IssueKind::Bug,
        source_id: bug.id,
        execution_id: bug.execution_id,
        creator: bug.opened_by.clone(),
        assignee: bug.assigned_to.clone(),
        issue: Issue {
            id: issue_id(ctx, IssueKind::Bug, bug.id),
            url: ctx.issue_url(IssueKind::Bug, bug.id),
            issue_key: bug.id.to_string(),
            title: bug.title.clone(),
            issue_type: mapped_type(ctx, IssueKind::Bug, &bug.bug_type, issue_type::BUG),
            original_type: bug.bug_type.clone(),
            status: mapped_status(ctx, &bug.status),
            original_status: bug.status.clone(),
            priority: bug.pri.to_string(),
            created_date: bug.opened_date,
            resolution_date,
            lead_time_minutes: lead_time(bug.opened_date, resolution_date),
            ..Default::default()
        },
    }
}

/// Resolves account names to domain account ids, emitting placeholders for unknown names.
struct AccountRefs<'a> {
    ctx: &'a TaskContext,
    placeholders: Vec<Account>,
}

impl<'a> AccountRefs<'a> {
    fn new(ctx: &'a TaskContext) -> Self {
        Self {
            ctx,
            placeholders: Vec::new(),
        }
    }

    /// `(domain id, display name)`; both empty for a blank reference.
    async fn resolve(&mut self, name: &str) -> Result<(String, String), TaskError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok((String::new(), String::new()));
        }
        if let Some(account) = self.ctx.accounts.resolve(name).await? {
            let display = if account.realname.is_empty() {
                account.account.clone()
            } else {
                account.realname.clone()
            };
            return Ok((self.ctx.domain_id(ACCOUNT_ENTITY, account.id), display));
        }

        let id = self
            .ctx
            .domain_id(ACCOUNT_ENTITY, format!("placeholder:{name}"));
        let pending = self.placeholders.iter().any(|account| account.user_name == name);
        if !pending && !self.ctx.accounts.has_placeholder(name) {
            self.placeholders.push(Account {
                id: id.clone(),
                user_name: name.to_string(),
                full_name: name.to_string(),
                placeholder: true,
                ..Default::default()
            });
        }
        Ok((id, name.to_string()))
    }

    /// Writes the pending placeholders; they only count as emitted once the write succeeds.
    async fn flush(self) -> Result<(), TaskError> {
        save(self.ctx, &self.placeholders).await?;
        for account in &self.placeholders {
            if self.ctx.accounts.mark_placeholder(&account.user_name) {
                warn!(account = %account.user_name, "referenced account is unknown; placeholder emitted");
            }
        }
        Ok(())
    }
}

async fn convert_project(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let Some(project) = &ctx.project else {
        return Ok(UnitStats::default());
    };
    let board = Board {
        id: ctx.domain_id(PROJECT_ENTITY, project.id),
        name: project.name.clone(),
        description: project.description.clone(),
        url: ctx.project_url(project.id),
        board_type: project.project_type.clone(),
    };
    let records = save(ctx, &[board]).await?;
    Ok(UnitStats {
        records,
        failed_records: 0,
    })
}

async fn convert_accounts(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let accounts: Vec<ZentaoAccount> = load(ctx, EntityFamily::Account).await?;
    let departments: HashMap<i64, String> =
        load::<ZentaoDepartment>(ctx, EntityFamily::Department)
            .await?
            .into_iter()
            .map(|department| (department.id, department.name))
            .collect();

    let mut stats = UnitStats::default();
    let mut rows = Vec::with_capacity(accounts.len());
    for account in accounts {
        if account.id <= 0 {
            warn!(account = %account.account, "account without a valid id skipped");
            stats.failed_records += 1;
            continue;
        }
        rows.push(Account {
            id: ctx.domain_id(ACCOUNT_ENTITY, account.id),
            user_name: account.account,
            full_name: account.realname,
            email: account.email,
            avatar_url: account.avatar,
            organization: departments.get(&account.dept).cloned().unwrap_or_default(),
            placeholder: false,
        });
    }
    stats.records = save(ctx, &rows).await?;
    Ok(stats)
}

async fn convert_executions(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let executions: Vec<ZentaoExecution> = load(ctx, EntityFamily::Execution).await?;
    let board = board_id(ctx);

    let mut stats = UnitStats::default();
    let mut sprints = Vec::with_capacity(executions.len());
    let mut links = Vec::with_capacity(executions.len());
    for execution in executions {
        if execution.id <= 0 {
            warn!(name = %execution.name, "execution without a valid id skipped");
            stats.failed_records += 1;
            continue;
        }
        let status = sprint_status_of(&execution.status);
        let id = sprint_id(ctx, execution.id);
        if let Some(board_id) = &board {
            links.push(BoardSprint {
                board_id: board_id.clone(),
                sprint_id: id.clone(),
            });
        }
        sprints.push(Sprint {
            url: ctx.execution_url(execution.id),
            name: execution.name,
            started_date: execution.real_began.or(execution.begin),
            ended_date: execution.end,
            completed_date: if status == sprint_status::CLOSED {
                execution.closed_date.or(execution.real_end)
            } else {
                None
            },
            status: status.to_string(),
            original_board_id: board.clone().unwrap_or_default(),
            id,
        });
    }
    stats.records = save(ctx, &sprints).await?;
    save(ctx, &links).await?;
    Ok(stats)
}

async fn convert_issues(ctx: &TaskContext, drafts: Vec<IssueDraft>) -> Result<UnitStats, TaskError> {
    let board = board_id(ctx);
    let mut refs = AccountRefs::new(ctx);
    let mut stats = UnitStats::default();
    let mut issues = Vec::with_capacity(drafts.len());
    let mut board_issues = Vec::new();
    let mut sprint_issues = Vec::new();

    for draft in drafts {
        if draft.source_id <= 0 {
            warn!(kind = %draft.kind, title = %draft.issue.title, "issue without a valid id skipped");
            stats.failed_records += 1;
            continue;
        }
        let mut issue = draft.issue;
        (issue.creator_id, issue.creator_name) = refs.resolve(&draft.creator).await?;
        (issue.assignee_id, issue.assignee_name) = refs.resolve(&draft.assignee).await?;

        if let Some(board_id) = &board {
            board_issues.push(BoardIssue {
                board_id: board_id.clone(),
                issue_id: issue.id.clone(),
            });
        }
        if draft.execution_id > 0 {
            sprint_issues.push(SprintIssue {
                sprint_id: sprint_id(ctx, draft.execution_id),
                issue_id: issue.id.clone(),
            });
        }
        issues.push(issue);
    }

    stats.records = save(ctx, &issues).await?;
    save(ctx, &board_issues).await?;
    save(ctx, &sprint_issues).await?;
    refs.flush().await?;
    Ok(stats)
}

async fn convert_execution_stories(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let links: Vec<ZentaoExecutionStory> = load(ctx, EntityFamily::ExecutionStory).await?;
    let mut stats = UnitStats::default();
    let mut rows = Vec::with_capacity(links.len());
    for link in links {
        if link.execution_id <= 0 || link.story_id <= 0 {
            warn!(execution_id = link.execution_id, story_id = link.story_id, "incomplete execution story link skipped");
            stats.failed_records += 1;
            continue;
        }
        rows.push(SprintIssue {
            sprint_id: sprint_id(ctx, link.execution_id),
            issue_id: issue_id(ctx, IssueKind::Story, link.story_id),
        });
    }
    stats.records = save(ctx, &rows).await?;
    Ok(stats)
}

async fn convert_repo_commits(
    ctx: &TaskContext,
    family: EntityFamily,
    kind: IssueKind,
) -> Result<UnitStats, TaskError> {
    let commits: Vec<ZentaoRepoCommit> = load(ctx, family).await?;
    let mut stats = UnitStats::default();
    let mut rows = Vec::new();
    for commit in commits.into_iter().filter(|commit| commit.object_type == kind) {
        if commit.object_id <= 0 || commit.commit_sha.is_empty() {
            stats.failed_records += 1;
            continue;
        }
        rows.push(IssueRepoCommit {
            issue_id: issue_id(ctx, kind, commit.object_id),
            repo_url: commit.repo_url,
            commit_sha: commit.commit_sha,
            host: commit.host,
            namespace: commit.namespace,
            repo_name: commit.repo_name,
        });
    }
    stats.records = save(ctx, &rows).await?;
    Ok(stats)
}

async fn convert_changelogs(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let changelogs: Vec<ZentaoChangelog> = load(ctx, EntityFamily::Changelog).await?;
    let mut refs = AccountRefs::new(ctx);
    let mut stats = UnitStats::default();
    let mut rows = Vec::with_capacity(changelogs.len());
    for changelog in changelogs {
        if changelog.id <= 0 || changelog.object_id <= 0 {
            warn!(id = changelog.id, "changelog row without a valid id skipped");
            stats.failed_records += 1;
            continue;
        }
        let (author_id, author_name) = refs.resolve(&changelog.actor).await?;
        rows.push(IssueChangelog {
            id: ctx.domain_id(CHANGELOG_ENTITY, changelog.id),
            issue_id: issue_id(ctx, changelog.object_type, changelog.object_id),
            author_id,
            author_name,
            field_id: changelog.field.clone(),
            field_name: changelog.field,
            original_from_value: changelog.old_value,
            original_to_value: changelog.new_value,
            created_date: changelog.date,
        });
    }
    stats.records = save(ctx, &rows).await?;
    refs.flush().await?;
    Ok(stats)
}

async fn convert_worklogs(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let worklogs: Vec<ZentaoWorklog> = load(ctx, EntityFamily::TaskWorklog).await?;
    let mut refs = AccountRefs::new(ctx);
    let mut stats = UnitStats::default();
    let mut rows = Vec::with_capacity(worklogs.len());
    for worklog in worklogs {
        if worklog.id <= 0 || worklog.task_id <= 0 {
            warn!(id = worklog.id, "worklog without a valid id skipped");
            stats.failed_records += 1;
            continue;
        }
        let (author_id, _) = refs.resolve(&worklog.account).await?;
        rows.push(IssueWorklog {
            id: ctx.domain_id(WORKLOG_ENTITY, worklog.id),
            issue_id: issue_id(ctx, IssueKind::Task, worklog.task_id),
            author_id,
            comment: worklog.work,
            time_spent_minutes: hours_to_minutes(worklog.consumed).unwrap_or(0),
            logged_date: worklog.date,
            started_date: worklog.date,
        });
    }
    stats.records = save(ctx, &rows).await?;
    refs.flush().await?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use zentao_core::{Connection, SyncPolicy, ZentaoProject};
    use zentao_sources::{AcquireError, AcquirerFactory, DataAcquirer, RemoteDbSettings};
    use zentao_storage::{HttpClientConfig, MemoryStore, Store};

    use crate::context::ContextSettings;

    struct Offline;

    #[async_trait]
    impl AcquirerFactory for Offline {
        async fn open_remote_db(
            &self,
            _settings: &RemoteDbSettings,
        ) -> Result<DataAcquirer, AcquireError> {
            Err(AcquireError::InvalidSetting("offline".into()))
        }

        async fn open_api(
            &self,
            _connection: &Connection,
            _http: &HttpClientConfig,
        ) -> Result<DataAcquirer, AcquireError> {
            Err(AcquireError::InvalidSetting("offline".into()))
        }
    }

    async fn offline_context(store: Arc<MemoryStore>) -> TaskContext {
        store
            .save_connection(&Connection {
                id: 1,
                endpoint: "http://zentao.local/api.php/v1/".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .save_project(&ZentaoProject {
                connection_id: 1,
                id: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        TaskContext::prepare(
            json!({"connectionId": 1, "projectId": 3}),
            SyncPolicy {
                skip_collectors: true,
            },
            store,
            &Offline,
            &ContextSettings::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn placeholder_counts_only_after_it_is_written() {
        let store = Arc::new(MemoryStore::new());
        let ctx = offline_context(store.clone()).await;

        let mut refs = AccountRefs::new(&ctx);
        let (id, name) = refs.resolve("ghost").await.unwrap();
        assert_eq!(id, "zentao:ZentaoAccount:1:placeholder:ghost");
        assert_eq!(name, "ghost");
        refs.resolve("ghost").await.unwrap();
        assert_eq!(refs.placeholders.len(), 1);

        store.set_unavailable(true);
        assert!(refs.flush().await.is_err());
        assert!(!ctx.accounts.has_placeholder("ghost"));

        store.set_unavailable(false);
        let mut refs = AccountRefs::new(&ctx);
        refs.resolve("ghost").await.unwrap();
        refs.flush().await.unwrap();
        assert!(ctx.accounts.has_placeholder("ghost"));
        assert_eq!(store.count_domain_rows("accounts").await.unwrap(), 1);

        let mut refs = AccountRefs::new(&ctx);
        refs.resolve("ghost").await.unwrap();
        assert!(refs.placeholders.is_empty());
    }

    #[test]
    fn statuses_fall_back_to_the_standard_buckets() {
        assert_eq!(default_status("wait"), status::TODO);
        assert_eq!(default_status("doing"), status::IN_PROGRESS);
        assert_eq!(default_status("pause"), status::IN_PROGRESS);
        assert_eq!(default_status("Closed"), status::DONE);
        assert_eq!(default_status("cancel"), status::DONE);
        assert_eq!(default_status("weird"), status::OTHER);
    }

    #[test]
    fn execution_statuses_map_to_sprint_states() {
        assert_eq!(sprint_status_of("wait"), sprint_status::FUTURE);
        assert_eq!(sprint_status_of("doing"), sprint_status::ACTIVE);
        assert_eq!(sprint_status_of("suspended"), sprint_status::ACTIVE);
        assert_eq!(sprint_status_of("closed"), sprint_status::CLOSED);
    }

    #[test]
    fn hours_become_whole_minutes() {
        assert_eq!(hours_to_minutes(1.5), Some(90));
        assert_eq!(hours_to_minutes(0.0), None);
        assert_eq!(hours_to_minutes(0.01), Some(1));
    }

    #[test]
    fn lead_time_needs_both_ends_in_order() {
        let created = "2023-03-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let resolved = "2023-03-01T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(lead_time(Some(created), Some(resolved)), Some(150));
        assert_eq!(lead_time(Some(resolved), Some(created)), None);
        assert_eq!(lead_time(None, Some(resolved)), None);
    }
}
