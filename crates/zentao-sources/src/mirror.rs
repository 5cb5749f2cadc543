use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{ConnectOptions, Row};
use tracing::debug;
use zentao_core::{EntityFamily, IssueKind};
use zentao_storage::FetchError;

use crate::{AcquireError, Page, PageRequest, PageSource, RemoteDbSettings, COMMIT_ACTIONS};

/// Read-only pooled access to a mirror of the Zentao MySQL schema.
///
/// Every query renders rows with `JSON_OBJECT` using the REST API's field names, so Extract
/// decodes mirror and API records with the same types.
#[derive(Debug)]
pub struct RemoteDbSource {
    pool: MySqlPool,
}

const ACCOUNT_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', u.id, 'account', u.account, 'realname', u.realname, 'avatar', u.avatar,
    'email', u.email, 'dept', u.dept, 'role', u.role, 'deleted', u.deleted
) AS CHAR) AS data
  FROM zt_user u
 ORDER BY u.id
 LIMIT ? OFFSET ?
"#;

const DEPARTMENT_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', d.id, 'name', d.name, 'parent', d.parent, 'path', d.path, 'grade', d.grade,
    'order', d.`order`, 'manager', d.manager
) AS CHAR) AS data
  FROM zt_dept d
 ORDER BY d.id
 LIMIT ? OFFSET ?
"#;

const EXECUTION_COLUMNS: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', p.id, 'project', p.project, 'name', p.name, 'code', p.code, 'type', p.type,
    'status', p.status, 'parent', p.parent, 'begin', p.begin, 'end', p.end,
    'realBegan', p.realBegan, 'realEnd', p.realEnd, 'openedBy', p.openedBy,
    'openedDate', p.openedDate, 'closedBy', p.closedBy, 'closedDate', p.closedDate,
    'desc', p.`desc`
) AS CHAR) AS data
  FROM zt_project p
"#;

const TASK_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', t.id, 'project', t.project, 'execution', t.execution, 'story', t.story,
    'parent', t.parent, 'name', t.name, 'type', t.type, 'pri', t.pri, 'status', t.status,
    'assignedTo', t.assignedTo, 'openedBy', t.openedBy, 'openedDate', t.openedDate,
    'finishedBy', t.finishedBy, 'finishedDate', t.finishedDate, 'closedDate', t.closedDate,
    'deadline', t.deadline, 'estimate', t.estimate, 'consumed', t.consumed, 'left', t.`left`,
    'desc', t.`desc`
) AS CHAR) AS data
  FROM zt_task t
 WHERE t.execution = ? AND t.deleted = '0'
 ORDER BY t.id
 LIMIT ? OFFSET ?
"#;

const STORY_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', s.id, 'product', s.product, 'parent', s.parent, 'title', s.title, 'type', s.type,
    'status', s.status, 'stage', s.stage, 'pri', s.pri, 'estimate', s.estimate,
    'openedBy', s.openedBy, 'openedDate', s.openedDate, 'assignedTo', s.assignedTo,
    'closedDate', s.closedDate
) AS CHAR) AS data
  FROM zt_story s
  JOIN zt_projectstory ps ON ps.story = s.id
 WHERE ps.project = ? AND s.deleted = '0'
 ORDER BY s.id
 LIMIT ? OFFSET ?
"#;

const EXECUTION_STORY_SQL: &str = r#"
SELECT CAST(JSON_OBJECT('id', ps.story, 'product', ps.product) AS CHAR) AS data
  FROM zt_projectstory ps
 WHERE ps.project = ?
 ORDER BY ps.story
 LIMIT ? OFFSET ?
"#;

const BUG_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', b.id, 'project', b.project, 'product', b.product, 'execution', b.execution,
    'story', b.story, 'task', b.task, 'title', b.title, 'severity', b.severity, 'pri', b.pri,
    'type', b.type, 'status', b.status, 'openedBy', b.openedBy, 'openedDate', b.openedDate,
    'assignedTo', b.assignedTo, 'resolvedBy', b.resolvedBy, 'resolvedDate', b.resolvedDate,
    'closedDate', b.closedDate, 'resolution', b.resolution
) AS CHAR) AS data
  FROM zt_bug b
 WHERE b.project = ? AND b.deleted = '0'
 ORDER BY b.id
 LIMIT ? OFFSET ?
"#;

const COMMIT_ACTION_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', a.id, 'objectType', a.objectType, 'objectID', a.objectID, 'action', a.action,
    'actor', a.actor, 'date', a.date, 'extra', a.extra, 'comment', a.comment
) AS CHAR) AS data
  FROM zt_action a
 WHERE a.objectType = ? AND a.objectID = ? AND a.action IN (?, ?)
 ORDER BY a.id
 LIMIT ? OFFSET ?
"#;

const WORKLOG_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', e.id, 'objectID', e.objectID, 'account', e.account, 'work', e.work,
    'date', e.date, 'consumed', e.consumed, 'left', e.`left`
) AS CHAR) AS data
  FROM zt_effort e
 WHERE e.objectType = 'task' AND e.objectID = ? AND e.deleted = '0'
 ORDER BY e.id
 LIMIT ? OFFSET ?
"#;

const CHANGELOG_SQL: &str = r#"
SELECT CAST(JSON_OBJECT(
    'id', h.id, 'actionId', a.id, 'objectType', a.objectType, 'objectID', a.objectID,
    'actor', a.actor, 'action', a.action, 'date', a.date, 'field', h.field,
    'old', h.old, 'new', h.new
) AS CHAR) AS data
  FROM zt_action a
  JOIN zt_history h ON h.action = a.id
 WHERE a.objectType = ? AND a.objectID = ?
 ORDER BY h.id
 LIMIT ? OFFSET ?
"#;

/// How long a surplus connection may sit idle before the pool closes it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool limits for the mirror. Connections open on demand and no minimum is held open;
/// an `idle_conns` of zero closes idle connections almost immediately.
fn pool_options(settings: &RemoteDbSettings) -> MySqlPoolOptions {
    let idle_timeout = if settings.idle_conns == 0 {
        Duration::from_secs(1)
    } else {
        IDLE_TIMEOUT
    };
    MySqlPoolOptions::new()
        .max_connections(settings.max_conns)
        .min_connections(0)
        .idle_timeout(Some(idle_timeout))
}

impl RemoteDbSource {
    pub async fn connect(settings: &RemoteDbSettings) -> Result<Self, AcquireError> {
        let options = MySqlConnectOptions::from_str(&settings.url)?
            .log_statements(settings.logging_level.level_filter());
        let pool = pool_options(settings)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET SESSION TRANSACTION READ ONLY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    async fn rows(
        &self,
        sql: &str,
        binds: &[Bind<'_>],
        request: &PageRequest<'_>,
    ) -> Result<Vec<Value>, FetchError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                Bind::Int(value) => query.bind(*value),
                Bind::Text(value) => query.bind(*value),
            };
        }
        let rows = query
            .bind(i64::from(request.page_size))
            .bind(request.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| FetchError::Database(err.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let text: String = row
                    .try_get("data")
                    .map_err(|err| FetchError::Database(err.to_string()))?;
                serde_json::from_str(&text).map_err(|source| FetchError::Decode {
                    url: describe_query(request),
                    source,
                })
            })
            .collect()
    }
}

enum Bind<'a> {
    Int(i64),
    Text(&'a str),
}

fn describe_query(request: &PageRequest<'_>) -> String {
    format!(
        "mysql://{}?page={}&limit={}",
        request.family, request.page, request.page_size
    )
}

fn object_type(kind: IssueKind) -> &'static str {
    kind.as_str()
}

#[async_trait]
impl PageSource for RemoteDbSource {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, FetchError> {
        let records = match request.family {
            EntityFamily::Account => self.rows(ACCOUNT_SQL, &[], request).await?,
            EntityFamily::Department => self.rows(DEPARTMENT_SQL, &[], request).await?,
            EntityFamily::ExecutionSummary => {
                let sql = format!(
                    "{EXECUTION_COLUMNS} WHERE p.project = ? AND p.type IN ('sprint', 'stage', 'kanban') AND p.deleted = '0' ORDER BY p.id LIMIT ? OFFSET ?"
                );
                let project = request.require_project()?;
                self.rows(&sql, &[Bind::Int(project)], request).await?
            }
            EntityFamily::ExecutionSummaryDev => {
                let sql = format!(
                    "{EXECUTION_COLUMNS} WHERE p.parent = ? AND p.type IN ('sprint', 'stage', 'kanban') AND p.deleted = '0' ORDER BY p.id LIMIT ? OFFSET ?"
                );
                let project = request.require_project()?;
                self.rows(&sql, &[Bind::Int(project)], request).await?
            }
            EntityFamily::Execution => {
                let sql = format!("{EXECUTION_COLUMNS} WHERE p.id = ? LIMIT ? OFFSET ?");
                let execution = request.require_execution()?;
                self.rows(&sql, &[Bind::Int(execution)], request).await?
            }
            EntityFamily::Task => {
                let execution = request.require_execution()?;
                self.rows(TASK_SQL, &[Bind::Int(execution)], request).await?
            }
            EntityFamily::Story => {
                let project = request.require_project()?;
                self.rows(STORY_SQL, &[Bind::Int(project)], request).await?
            }
            EntityFamily::ExecutionStory => {
                let execution = request.require_execution()?;
                self.rows(EXECUTION_STORY_SQL, &[Bind::Int(execution)], request)
                    .await?
            }
            EntityFamily::Bug => {
                let project = request.require_project()?;
                self.rows(BUG_SQL, &[Bind::Int(project)], request).await?
            }
            EntityFamily::TaskCommit | EntityFamily::StoryCommit | EntityFamily::BugCommit => {
                let (kind, id) = request.require_entity()?;
                let binds = [
                    Bind::Text(object_type(kind)),
                    Bind::Int(id),
                    Bind::Text(COMMIT_ACTIONS[0]),
                    Bind::Text(COMMIT_ACTIONS[1]),
                ];
                self.rows(COMMIT_ACTION_SQL, &binds, request).await?
            }
            EntityFamily::TaskWorklog => {
                let (_, id) = request.require_entity()?;
                self.rows(WORKLOG_SQL, &[Bind::Int(id)], request).await?
            }
            EntityFamily::Changelog => {
                let (kind, id) = request.require_entity()?;
                let binds = [Bind::Text(object_type(kind)), Bind::Int(id)];
                self.rows(CHANGELOG_SQL, &binds, request).await?
            }
            EntityFamily::Project
            | EntityFamily::TaskRepoCommit
            | EntityFamily::StoryRepoCommit
            | EntityFamily::BugRepoCommit => {
                return Err(FetchError::Unsupported(format!(
                    "{} is derived locally, not read from the mirror",
                    request.family
                )))
            }
        };

        let more = records.len() >= request.page_size as usize && request.page_size > 0;
        debug!(family = %request.family, page = request.page, rows = records.len(), "mirror page");
        Ok(Page {
            records,
            url: describe_query(request),
            more,
        })
    }

    async fn release(&self) {
        self.pool.close().await;
    }

    fn describe(&self) -> String {
        format!("zentao mirror database ({} connections)", self.pool.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbLogLevel;

    fn settings(idle_conns: u32, max_conns: u32) -> RemoteDbSettings {
        RemoteDbSettings {
            url: "mysql://reader:pw@mirror.local/zentao".into(),
            logging_level: DbLogLevel::Error,
            idle_conns,
            max_conns,
        }
    }

    #[test]
    fn pool_opens_connections_on_demand() {
        let options = pool_options(&settings(10, 20));
        assert_eq!(options.get_max_connections(), 20);
        assert_eq!(options.get_min_connections(), 0);
        assert_eq!(options.get_idle_timeout(), Some(IDLE_TIMEOUT));
    }

    #[test]
    fn zero_idle_connections_are_reaped_quickly() {
        let options = pool_options(&settings(0, 4));
        assert_eq!(options.get_min_connections(), 0);
        assert_eq!(options.get_idle_timeout(), Some(Duration::from_secs(1)));
    }
}
