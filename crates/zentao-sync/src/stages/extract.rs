use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use zentao_core::de;
use zentao_core::tool::{
    ToolEntity, ZentaoAccount, ZentaoBug, ZentaoChangelog, ZentaoCommitAction, ZentaoDepartment,
    ZentaoExecution, ZentaoExecutionStory, ZentaoExecutionSummary, ZentaoStory, ZentaoTask,
    ZentaoWorklog,
};
use zentao_core::{EntityFamily, IssueKind};
use zentao_sources::CollectInput;
use zentao_storage::{upsert_tool, RawRecord};

use super::unsupported;
use crate::cache::EntityCache;
use crate::context::TaskContext;
use crate::error::TaskError;
use crate::registry::StageKind;
use crate::scheduler::UnitStats;

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::text")]
    account: String,
    #[serde(default, deserialize_with = "de::text")]
    realname: String,
    #[serde(default, deserialize_with = "de::text")]
    avatar: String,
    #[serde(default, deserialize_with = "de::text")]
    email: String,
    #[serde(default, deserialize_with = "de::int")]
    dept: i64,
    #[serde(default, deserialize_with = "de::text")]
    role: String,
    #[serde(default, deserialize_with = "de::flag")]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct RawDepartment {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::text")]
    name: String,
    #[serde(default, deserialize_with = "de::int")]
    parent: i64,
    #[serde(default, deserialize_with = "de::text")]
    path: String,
    #[serde(default, deserialize_with = "de::int")]
    grade: i64,
    #[serde(default, deserialize_with = "de::int")]
    order: i64,
    #[serde(default, deserialize_with = "de::account_name")]
    manager: String,
}

/// Shared by execution listings and execution details.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExecution {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::int")]
    project: i64,
    #[serde(default, deserialize_with = "de::text")]
    name: String,
    #[serde(default, deserialize_with = "de::text")]
    code: String,
    #[serde(default, rename = "type", deserialize_with = "de::text")]
    execution_type: String,
    #[serde(default, deserialize_with = "de::text")]
    status: String,
    #[serde(default, deserialize_with = "de::int")]
    parent: i64,
    #[serde(default, deserialize_with = "de::datetime")]
    begin: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::datetime")]
    end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::datetime")]
    real_began: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::datetime")]
    real_end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::account_name")]
    opened_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    opened_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::account_name")]
    closed_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    closed_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "desc", deserialize_with = "de::text")]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::int")]
    project: i64,
    #[serde(default, deserialize_with = "de::int")]
    execution: i64,
    #[serde(default, deserialize_with = "de::int")]
    story: i64,
    #[serde(default, deserialize_with = "de::int")]
    parent: i64,
    #[serde(default, deserialize_with = "de::text")]
    name: String,
    #[serde(default, rename = "type", deserialize_with = "de::text")]
    task_type: String,
    #[serde(default, deserialize_with = "de::int")]
    pri: i64,
    #[serde(default, deserialize_with = "de::text")]
    status: String,
    #[serde(default, deserialize_with = "de::account_name")]
    assigned_to: String,
    #[serde(default, deserialize_with = "de::account_name")]
    opened_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    opened_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::account_name")]
    finished_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    finished_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::datetime")]
    closed_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::datetime")]
    deadline: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::float")]
    estimate: f64,
    #[serde(default, deserialize_with = "de::float")]
    consumed: f64,
    #[serde(default, deserialize_with = "de::float")]
    left: f64,
    #[serde(default, rename = "desc", deserialize_with = "de::text")]
    description: String,
    /// Sub-tasks are nested in API listings.
    #[serde(default)]
    children: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStory {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::int")]
    product: i64,
    #[serde(default, deserialize_with = "de::int")]
    parent: i64,
    #[serde(default, deserialize_with = "de::text")]
    title: String,
    #[serde(default, rename = "type", deserialize_with = "de::text")]
    story_type: String,
    #[serde(default, deserialize_with = "de::text")]
    status: String,
    #[serde(default, deserialize_with = "de::text")]
    stage: String,
    #[serde(default, deserialize_with = "de::int")]
    pri: i64,
    #[serde(default, deserialize_with = "de::float")]
    estimate: f64,
    #[serde(default, deserialize_with = "de::account_name")]
    opened_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    opened_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::account_name")]
    assigned_to: String,
    #[serde(default, deserialize_with = "de::datetime")]
    closed_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawExecutionStory {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::int")]
    product: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBug {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::int")]
    product: i64,
    #[serde(default, deserialize_with = "de::int")]
    execution: i64,
    #[serde(default, deserialize_with = "de::int")]
    story: i64,
    #[serde(default, deserialize_with = "de::int")]
    task: i64,
    #[serde(default, deserialize_with = "de::text")]
    title: String,
    #[serde(default, deserialize_with = "de::int")]
    severity: i64,
    #[serde(default, deserialize_with = "de::int")]
    pri: i64,
    #[serde(default, rename = "type", deserialize_with = "de::text")]
    bug_type: String,
    #[serde(default, deserialize_with = "de::text")]
    status: String,
    #[serde(default, deserialize_with = "de::account_name")]
    opened_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    opened_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::account_name")]
    assigned_to: String,
    #[serde(default, deserialize_with = "de::account_name")]
    resolved_by: String,
    #[serde(default, deserialize_with = "de::datetime")]
    resolved_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::datetime")]
    closed_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::text")]
    resolution: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, rename = "objectID", deserialize_with = "de::int")]
    object_id: i64,
    #[serde(default, deserialize_with = "de::text")]
    action: String,
    #[serde(default, deserialize_with = "de::account_name")]
    actor: String,
    #[serde(default, deserialize_with = "de::datetime")]
    date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::text")]
    extra: String,
    #[serde(default, deserialize_with = "de::text")]
    comment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEffort {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, rename = "objectID", deserialize_with = "de::int")]
    object_id: i64,
    #[serde(default, deserialize_with = "de::account_name")]
    account: String,
    #[serde(default, deserialize_with = "de::text")]
    work: String,
    #[serde(default, deserialize_with = "de::datetime")]
    date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::float")]
    consumed: f64,
    #[serde(default, deserialize_with = "de::float")]
    left: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangelog {
    #[serde(default, deserialize_with = "de::int")]
    id: i64,
    #[serde(default, deserialize_with = "de::int")]
    action_id: i64,
    #[serde(default, rename = "objectID", deserialize_with = "de::int")]
    object_id: i64,
    #[serde(default, deserialize_with = "de::account_name")]
    actor: String,
    #[serde(default, deserialize_with = "de::text")]
    action: String,
    #[serde(default, deserialize_with = "de::datetime")]
    date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::text")]
    field: String,
    #[serde(default, deserialize_with = "de::text")]
    old: String,
    #[serde(default, deserialize_with = "de::text")]
    new: String,
}

fn decode<R: DeserializeOwned>(table: &'static str, data: &Value) -> Result<R, TaskError> {
    R::deserialize(data).map_err(|err| TaskError::Extract {
        table,
        reason: err.to_string(),
    })
}

fn input_of(record: &RawRecord) -> Option<CollectInput> {
    record
        .input
        .as_ref()
        .and_then(|input| CollectInput::deserialize(input).ok())
}

fn input_execution(record: &RawRecord) -> i64 {
    match input_of(record) {
        Some(CollectInput::Execution(id)) => id,
        _ => 0,
    }
}

fn input_entity(record: &RawRecord) -> i64 {
    match input_of(record) {
        Some(CollectInput::Entity { id, .. }) => id,
        _ => 0,
    }
}

/// Decodes every raw row of the family through `map`, then upserts the results.
async fn extract_rows<R, T, F>(
    ctx: &TaskContext,
    family: EntityFamily,
    mut map: F,
) -> Result<Vec<T>, TaskError>
where
    R: DeserializeOwned,
    T: ToolEntity,
    F: FnMut(R, &RawRecord, &mut Vec<T>),
{
    let table = family.raw_table();
    let raw = ctx.store.load_raw(table, &ctx.raw_params(family)).await?;
    let mut rows = Vec::with_capacity(raw.len());
    for record in &raw {
        let decoded: R = decode(table, &record.data)?;
        map(decoded, record, &mut rows);
    }
    debug!(table, raw = raw.len(), rows = rows.len(), "raw rows decoded");
    Ok(rows)
}

async fn save<T: ToolEntity>(
    ctx: &TaskContext,
    family: EntityFamily,
    rows: &[T],
) -> Result<UnitStats, TaskError> {
    let records = upsert_tool(ctx.store.as_ref(), ctx.connection_id(), ctx.scope_id(family), rows).await?;
    Ok(UnitStats {
        records,
        failed_records: 0,
    })
}

/// Keeps the first row per id and records every kept id in the run cache.
fn dedupe_into<T>(rows: &mut Vec<T>, cache: &EntityCache, id: impl Fn(&T) -> i64) {
    let mut seen = HashSet::new();
    rows.retain(|row| seen.insert(id(row)));
    for row in rows.iter() {
        if id(row) > 0 {
            cache.insert(id(row));
        }
    }
}

pub(super) async fn extract(ctx: &TaskContext, family: EntityFamily) -> Result<UnitStats, TaskError> {
    let connection_id = ctx.connection_id();
    let project_id = ctx.project_id().unwrap_or(0);

    match family {
        EntityFamily::Account => {
            let rows = extract_rows(ctx, family, |raw: RawAccount, _, rows| {
                rows.push(ZentaoAccount {
                    connection_id,
                    id: raw.id,
                    account: raw.account,
                    realname: raw.realname,
                    avatar: raw.avatar,
                    email: raw.email,
                    dept: raw.dept,
                    role: raw.role,
                    deleted: raw.deleted,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::Department => {
            let rows = extract_rows(ctx, family, |raw: RawDepartment, _, rows| {
                rows.push(ZentaoDepartment {
                    connection_id,
                    id: raw.id,
                    name: raw.name,
                    parent: raw.parent,
                    path: raw.path,
                    grade: raw.grade,
                    order: raw.order,
                    manager: raw.manager,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::ExecutionSummary => {
            let rows = extract_rows(ctx, family, |raw: RawExecution, _, rows| {
                rows.push(ZentaoExecutionSummary {
                    connection_id,
                    project_id: if raw.project > 0 { raw.project } else { project_id },
                    id: raw.id,
                    name: raw.name,
                    execution_type: raw.execution_type,
                    status: raw.status,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::ExecutionSummaryDev => {
            // The global listing spans every project; only this project's executions are kept.
            let rows = extract_rows(ctx, family, |raw: RawExecution, _, rows| {
                if raw.project != project_id && raw.parent != project_id {
                    return;
                }
                rows.push(ZentaoExecutionSummary {
                    connection_id,
                    project_id,
                    id: raw.id,
                    name: raw.name,
                    execution_type: raw.execution_type,
                    status: raw.status,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::Execution => {
            let rows = extract_rows(ctx, family, |raw: RawExecution, record, rows| {
                rows.push(ZentaoExecution {
                    connection_id,
                    project_id: if raw.project > 0 { raw.project } else { project_id },
                    id: if raw.id > 0 { raw.id } else { input_execution(record) },
                    name: raw.name,
                    code: raw.code,
                    execution_type: raw.execution_type,
                    status: raw.status,
                    parent: raw.parent,
                    begin: raw.begin,
                    end: raw.end,
                    real_began: raw.real_began,
                    real_end: raw.real_end,
                    opened_by: raw.opened_by,
                    opened_date: raw.opened_date,
                    closed_by: raw.closed_by,
                    closed_date: raw.closed_date,
                    description: raw.description,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::Task => {
            let mut rows = extract_rows(ctx, family, |raw: RawTask, record, rows| {
                let execution_id = if raw.execution > 0 {
                    raw.execution
                } else {
                    input_execution(record)
                };
                flatten_task(raw, connection_id, project_id, execution_id, 0, rows);
            })
            .await?;
            dedupe_into(&mut rows, &ctx.entities.tasks, |task| task.id);
            save(ctx, family, &rows).await
        }
        EntityFamily::Story => {
            let mut rows = extract_rows(ctx, family, |raw: RawStory, _, rows| {
                rows.push(ZentaoStory {
                    connection_id,
                    project_id,
                    product_id: raw.product,
                    id: raw.id,
                    parent_id: raw.parent.max(0),
                    title: raw.title,
                    story_type: raw.story_type,
                    status: raw.status,
                    stage: raw.stage,
                    pri: raw.pri,
                    estimate: raw.estimate,
                    opened_by: raw.opened_by,
                    opened_date: raw.opened_date,
                    assigned_to: raw.assigned_to,
                    closed_date: raw.closed_date,
                })
            })
            .await?;
            dedupe_into(&mut rows, &ctx.entities.stories, |story| story.id);
            save(ctx, family, &rows).await
        }
        EntityFamily::ExecutionStory => {
            let rows = extract_rows(ctx, family, |raw: RawExecutionStory, record, rows| {
                rows.push(ZentaoExecutionStory {
                    connection_id,
                    project_id,
                    execution_id: input_execution(record),
                    story_id: raw.id,
                    product_id: raw.product,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::Bug => {
            let mut rows = extract_rows(ctx, family, |raw: RawBug, _, rows| {
                rows.push(ZentaoBug {
                    connection_id,
                    project_id,
                    product_id: raw.product,
                    execution_id: raw.execution,
                    id: raw.id,
                    story_id: raw.story,
                    task_id: raw.task,
                    title: raw.title,
                    severity: raw.severity,
                    pri: raw.pri,
                    bug_type: raw.bug_type,
                    status: raw.status,
                    opened_by: raw.opened_by,
                    opened_date: raw.opened_date,
                    assigned_to: raw.assigned_to,
                    resolved_by: raw.resolved_by,
                    resolved_date: raw.resolved_date,
                    closed_date: raw.closed_date,
                    resolution: raw.resolution,
                })
            })
            .await?;
            dedupe_into(&mut rows, &ctx.entities.bugs, |bug| bug.id);
            save(ctx, family, &rows).await
        }
        EntityFamily::TaskCommit | EntityFamily::StoryCommit | EntityFamily::BugCommit => {
            let Some(kind) = family.commit_kind() else {
                return Err(unsupported(StageKind::Extract, family));
            };
            let rows = extract_rows(ctx, family, |raw: RawAction, record, rows| {
                rows.push(ZentaoCommitAction {
                    connection_id,
                    project_id,
                    object_type: kind,
                    object_id: if raw.object_id > 0 {
                        raw.object_id
                    } else {
                        input_entity(record)
                    },
                    action_id: raw.id,
                    action: raw.action.trim().to_ascii_lowercase(),
                    actor: raw.actor,
                    date: raw.date,
                    extra: raw.extra,
                    comment: raw.comment,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::TaskWorklog => {
            let rows = extract_rows(ctx, family, |raw: RawEffort, record, rows| {
                rows.push(ZentaoWorklog {
                    connection_id,
                    project_id,
                    id: raw.id,
                    task_id: if raw.object_id > 0 {
                        raw.object_id
                    } else {
                        input_entity(record)
                    },
                    account: raw.account,
                    work: raw.work,
                    date: raw.date,
                    consumed: raw.consumed,
                    left: raw.left,
                })
            })
            .await?;
            save(ctx, family, &rows).await
        }
        EntityFamily::Project
        | EntityFamily::TaskRepoCommit
        | EntityFamily::StoryRepoCommit
        | EntityFamily::BugRepoCommit
        | EntityFamily::Changelog => Err(unsupported(StageKind::Extract, family)),
    }
}

fn flatten_task(
    mut raw: RawTask,
    connection_id: u64,
    project_id: i64,
    execution_id: i64,
    parent_id: i64,
    rows: &mut Vec<ZentaoTask>,
) {
    let children = std::mem::take(&mut raw.children);
    let id = raw.id;
    let parent = if raw.parent > 0 { raw.parent } else { parent_id };

    rows.push(ZentaoTask {
        connection_id,
        project_id: if raw.project > 0 { raw.project } else { project_id },
        execution_id,
        id,
        story_id: raw.story,
        parent_id: parent,
        name: raw.name,
        task_type: raw.task_type,
        pri: raw.pri,
        status: raw.status,
        assigned_to: raw.assigned_to,
        opened_by: raw.opened_by,
        opened_date: raw.opened_date,
        finished_by: raw.finished_by,
        finished_date: raw.finished_date,
        closed_date: raw.closed_date,
        deadline: raw.deadline,
        estimate: raw.estimate,
        consumed: raw.consumed,
        left: raw.left,
        description: raw.description,
    });

    for child in children {
        flatten_task(child, connection_id, project_id, execution_id, id, rows);
    }
}

/// Decodes one mirror history row of the entity `kind`/`object_id`.
pub(super) fn changelog_from_raw(
    connection_id: u64,
    project_id: i64,
    kind: IssueKind,
    object_id: i64,
    data: &Value,
) -> Result<ZentaoChangelog, TaskError> {
    let raw: RawChangelog = decode(ZentaoChangelog::TABLE, data)?;
    Ok(ZentaoChangelog {
        connection_id,
        project_id,
        id: raw.id,
        action_id: raw.action_id,
        object_type: kind,
        object_id: if raw.object_id > 0 { raw.object_id } else { object_id },
        actor: raw.actor,
        action: raw.action,
        date: raw.date,
        field: raw.field,
        old_value: raw.old,
        new_value: raw.new,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_sub_tasks_are_flattened_with_their_parent() {
        let raw: RawTask = decode(
            "_raw_zentao_tasks",
            &json!({
                "id": 10, "name": "parent", "execution": 0, "estimate": "4",
                "assignedTo": {"account": "dev1"},
                "children": [{"id": 11, "name": "child", "parent": 0}]
            }),
        )
        .unwrap();
        let mut rows = Vec::new();
        flatten_task(raw, 1, 3, 5, 0, &mut rows);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].assigned_to, "dev1");
        assert_eq!(rows[0].estimate, 4.0);
        assert_eq!(rows[1].parent_id, 10);
        assert_eq!(rows[1].execution_id, 5);
        assert_eq!(rows[1].project_id, 3);
    }

    #[test]
    fn undecodable_rows_name_their_table() {
        let err = decode::<RawTask>("_raw_zentao_tasks", &json!("not a task")).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Extract {
                table: "_raw_zentao_tasks",
                ..
            }
        ));
    }

    #[test]
    fn duplicate_ids_keep_the_first_row() {
        let cache = EntityCache::default();
        let mut rows = vec![(1, "a"), (2, "b"), (1, "c"), (0, "d")];
        dedupe_into(&mut rows, &cache, |row| row.0);
        assert_eq!(rows, vec![(1, "a"), (2, "b"), (0, "d")]);
        assert_eq!(cache.snapshot(), vec![1, 2]);
    }

    #[test]
    fn changelog_rows_fall_back_to_the_requested_entity() {
        let row = changelog_from_raw(
            1,
            3,
            IssueKind::Bug,
            9,
            &json!({"id": "77", "actionId": 5, "actor": "qa", "field": "status",
                    "old": "active", "new": "resolved", "date": "2023-04-02 10:00:00"}),
        )
        .unwrap();
        assert_eq!(row.object_id, 9);
        assert_eq!(row.object_type, IssueKind::Bug);
        assert_eq!(row.id, 77);
        assert_eq!(row.new_value, "resolved");
        assert!(row.date.is_some());
    }
}
