use chrono::Utc;
use tracing::{debug, warn};
use zentao_core::tool::{ZentaoExecution, ZentaoExecutionSummary};
use zentao_core::EntityFamily;
use zentao_sources::{Collection, CollectInput, Page, PageRequest};
use zentao_storage::{load_tool, RawRecord, StoreError};

use super::unsupported;
use crate::context::TaskContext;
use crate::error::TaskError;
use crate::registry::StageKind;
use crate::scheduler::UnitStats;

/// Replaces the raw rows of `family` for this scope with freshly fetched pages.
pub(super) async fn collect(ctx: &TaskContext, family: EntityFamily) -> Result<UnitStats, TaskError> {
    let acquirer = match &ctx.collection {
        Collection::Active(acquirer) => acquirer,
        Collection::Skipped => {
            debug!(%family, "collectors skipped for this run");
            return Ok(UnitStats::default());
        }
    };

    let inputs = inputs_for(ctx, family).await?;
    let table = family.raw_table();
    let params = ctx.raw_params(family);
    let cleared = ctx.store.clear_raw(table, &params).await?;
    debug!(table, cleared, inputs = inputs.len(), "raw rows cleared");

    let scope = ctx.scope_params();
    let mut stats = UnitStats::default();
    for input in &inputs {
        let input_value = input
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(StoreError::from)?;

        for page in 1..=ctx.max_pages {
            let request = PageRequest {
                family,
                scope: &scope,
                input: input.as_ref(),
                page,
                page_size: ctx.page_size,
            };
            let Page { records, url, more } = acquirer.source().fetch_page(&request).await?;
            let created_at = Utc::now();
            let rows: Vec<RawRecord> = records
                .into_iter()
                .map(|data| RawRecord {
                    params: params.clone(),
                    data,
                    input: input_value.clone(),
                    url: url.clone(),
                    created_at,
                })
                .collect();
            if !rows.is_empty() {
                ctx.store.insert_raw(table, &rows).await?;
                stats.records += rows.len();
            }
            if !more {
                break;
            }
            if page == ctx.max_pages {
                warn!(%family, ?input, max_pages = ctx.max_pages, "page limit reached; listing truncated");
            }
        }
    }
    Ok(stats)
}

/// Parent records a dependent collection iterates; `[None]` for plain listings.
async fn inputs_for(
    ctx: &TaskContext,
    family: EntityFamily,
) -> Result<Vec<Option<CollectInput>>, TaskError> {
    let scope = Some(ctx.scope_id(family));
    let inputs = match family {
        EntityFamily::Account
        | EntityFamily::Department
        | EntityFamily::ExecutionSummary
        | EntityFamily::ExecutionSummaryDev
        | EntityFamily::Story
        | EntityFamily::Bug => vec![None],
        EntityFamily::Execution => {
            load_tool::<ZentaoExecutionSummary>(ctx.store.as_ref(), ctx.connection_id(), scope)
                .await?
                .into_iter()
                .map(|summary| Some(CollectInput::Execution(summary.id)))
                .collect()
        }
        EntityFamily::Task | EntityFamily::ExecutionStory => {
            load_tool::<ZentaoExecution>(ctx.store.as_ref(), ctx.connection_id(), scope)
                .await?
                .into_iter()
                .map(|execution| Some(CollectInput::Execution(execution.id)))
                .collect()
        }
        EntityFamily::TaskCommit | EntityFamily::StoryCommit | EntityFamily::BugCommit => {
            let Some(kind) = family.commit_kind() else {
                return Err(unsupported(StageKind::Collect, family));
            };
            entity_inputs(ctx, kind)
        }
        EntityFamily::TaskWorklog => entity_inputs(ctx, zentao_core::IssueKind::Task),
        EntityFamily::Project
        | EntityFamily::TaskRepoCommit
        | EntityFamily::StoryRepoCommit
        | EntityFamily::BugRepoCommit
        | EntityFamily::Changelog => return Err(unsupported(StageKind::Collect, family)),
    };
    Ok(inputs)
}

fn entity_inputs(ctx: &TaskContext, kind: zentao_core::IssueKind) -> Vec<Option<CollectInput>> {
    ctx.entities
        .for_kind(kind)
        .snapshot()
        .into_iter()
        .map(|id| Some(CollectInput::Entity { kind, id }))
        .collect()
}
