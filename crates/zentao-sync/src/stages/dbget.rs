use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};
use url::Url;
use zentao_core::tool::{ZentaoCommitAction, ZentaoRepoCommit};
use zentao_core::{EntityFamily, IssueKind};
use zentao_sources::{CollectInput, Collection, DataAcquirer, Page, PageRequest};
use zentao_storage::{load_tool, upsert_tool};

use super::extract::changelog_from_raw;
use super::unsupported;
use crate::context::TaskContext;
use crate::error::TaskError;
use crate::registry::StageKind;
use crate::scheduler::UnitStats;

pub(super) async fn dbget(ctx: &TaskContext, family: EntityFamily) -> Result<UnitStats, TaskError> {
    match family {
        EntityFamily::TaskRepoCommit | EntityFamily::StoryRepoCommit | EntityFamily::BugRepoCommit => {
            let Some(kind) = family.commit_kind() else {
                return Err(unsupported(StageKind::DbGet, family));
            };
            derive_repo_commits(ctx, family, kind).await
        }
        EntityFamily::Changelog => read_changelogs(ctx).await,
        _ => Err(unsupported(StageKind::DbGet, family)),
    }
}

fn commit_link_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?P<repo>https?://[^\s"'<>]+?)(?:/-)?/commits?/(?P<sha>[0-9a-fA-F]{7,40})"#,
            )
            .ok()
        })
        .as_ref()
}

/// A commit web link found in action text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitLink {
    pub repo_url: String,
    pub commit_sha: String,
    pub host: String,
    pub namespace: String,
    pub repo_name: String,
}

/// Finds GitLab/GitHub/Gitea style commit links, e.g. `https://git.example.com/team/app/-/commit/3f2a9c1`.
pub(crate) fn commit_links(text: &str) -> Vec<CommitLink> {
    let Some(pattern) = commit_link_pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|captures| {
            let repo_url = captures.name("repo")?.as_str().trim_end_matches('/');
            let commit_sha = captures.name("sha")?.as_str().to_ascii_lowercase();
            let url = Url::parse(repo_url).ok()?;
            let host = url.host_str()?.to_string();
            let mut segments: Vec<&str> = url
                .path_segments()
                .map(|segments| segments.filter(|s| !s.is_empty()).collect())
                .unwrap_or_default();
            let repo_name = segments.pop()?.trim_end_matches(".git").to_string();
            Some(CommitLink {
                repo_url: repo_url.to_string(),
                commit_sha,
                host,
                namespace: segments.join("/"),
                repo_name,
            })
        })
        .collect()
}

async fn derive_repo_commits(
    ctx: &TaskContext,
    family: EntityFamily,
    kind: IssueKind,
) -> Result<UnitStats, TaskError> {
    let actions: Vec<ZentaoCommitAction> =
        load_tool(ctx.store.as_ref(), ctx.connection_id(), Some(ctx.scope_id(family))).await?;

    let mut commits = BTreeMap::new();
    for action in actions.iter().filter(|action| action.object_type == kind) {
        for text in [&action.extra, &action.comment] {
            for link in commit_links(text) {
                let commit = ZentaoRepoCommit {
                    connection_id: ctx.connection_id(),
                    project_id: action.project_id,
                    object_type: kind,
                    object_id: action.object_id,
                    repo_url: link.repo_url,
                    commit_sha: link.commit_sha,
                    host: link.host,
                    namespace: link.namespace,
                    repo_name: link.repo_name,
                };
                commits.entry(commit_key(&commit)).or_insert(commit);
            }
        }
    }
    let commits: Vec<ZentaoRepoCommit> = commits.into_values().collect();
    debug!(%kind, actions = actions.len(), commits = commits.len(), "commit links parsed");

    let records = upsert_tool(
        ctx.store.as_ref(),
        ctx.connection_id(),
        ctx.scope_id(family),
        &commits,
    )
    .await?;
    Ok(UnitStats {
        records,
        failed_records: 0,
    })
}

fn commit_key(commit: &ZentaoRepoCommit) -> (i64, String) {
    (commit.object_id, commit.commit_sha.clone())
}

/// History rows exist only in the mirror database; with the API or no source this is a no-op.
async fn read_changelogs(ctx: &TaskContext) -> Result<UnitStats, TaskError> {
    let source = match &ctx.collection {
        Collection::Active(DataAcquirer::RemoteDb(source)) => source,
        Collection::Active(DataAcquirer::Api(_)) => {
            info!("changelogs need the mirror database; api mode reads none");
            return Ok(UnitStats::default());
        }
        Collection::Skipped => {
            info!("collectors skipped; changelogs not read");
            return Ok(UnitStats::default());
        }
    };

    let family = EntityFamily::Changelog;
    let scope = ctx.scope_params();
    let project_id = ctx.project_id().unwrap_or(0);
    let mut stats = UnitStats::default();

    for kind in IssueKind::ALL {
        for id in ctx.entities.for_kind(kind).snapshot() {
            let input = CollectInput::Entity { kind, id };
            let mut rows = Vec::new();
            for page in 1..=ctx.max_pages {
                let request = PageRequest {
                    family,
                    scope: &scope,
                    input: Some(&input),
                    page,
                    page_size: ctx.page_size,
                };
                let Page { records, more, .. } = source.fetch_page(&request).await?;
                for data in &records {
                    rows.push(changelog_from_raw(
                        ctx.connection_id(),
                        project_id,
                        kind,
                        id,
                        data,
                    )?);
                }
                if !more {
                    break;
                }
            }
            if !rows.is_empty() {
                stats.records += upsert_tool(
                    ctx.store.as_ref(),
                    ctx.connection_id(),
                    ctx.scope_id(family),
                    &rows,
                )
                .await?;
            }
        }
    }
    Ok(stats)
}
