//! Static registry of pipeline units.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use zentao_core::{DomainType, EntityFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Remote source -> raw staging rows.
    Collect,
    /// Raw rows -> tool-layer rows.
    Extract,
    /// Tool-layer rows -> domain rows.
    Convert,
    /// Derives rows from already stored data, or reads the mirror database directly.
    DbGet,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Collect => "collect",
            StageKind::Extract => "extract",
            StageKind::Convert => "convert",
            StageKind::DbGet => "dbget",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubtaskMeta {
    pub name: &'static str,
    pub kind: StageKind,
    pub family: EntityFamily,
    pub domain: DomainType,
    pub dependencies: &'static [&'static str],
}

const fn unit(
    name: &'static str,
    kind: StageKind,
    family: EntityFamily,
    domain: DomainType,
    dependencies: &'static [&'static str],
) -> SubtaskMeta {
    SubtaskMeta {
        name,
        kind,
        family,
        domain,
        dependencies,
    }
}

use DomainType::{Cross, Ticket};
use EntityFamily as F;
use StageKind::{Collect, Convert, DbGet, Extract};

/// Every unit, in declaration order; dependencies always point backwards.
pub const SUBTASKS: &[SubtaskMeta] = &[
    unit("convert_project", Convert, F::Project, Ticket, &[]),
    unit("collect_account", Collect, F::Account, Cross, &[]),
    unit("extract_account", Extract, F::Account, Cross, &["collect_account"]),
    unit("collect_department", Collect, F::Department, Cross, &[]),
    unit("extract_department", Extract, F::Department, Cross, &["collect_department"]),
    unit(
        "convert_account",
        Convert,
        F::Account,
        Cross,
        &["extract_account", "extract_department"],
    ),
    unit("collect_execution_summary", Collect, F::ExecutionSummary, Ticket, &[]),
    unit(
        "extract_execution_summary",
        Extract,
        F::ExecutionSummary,
        Ticket,
        &["collect_execution_summary"],
    ),
    unit("collect_execution_summary_dev", Collect, F::ExecutionSummaryDev, Ticket, &[]),
    unit(
        "extract_execution_summary_dev",
        Extract,
        F::ExecutionSummaryDev,
        Ticket,
        &["collect_execution_summary_dev"],
    ),
    unit(
        "collect_execution",
        Collect,
        F::Execution,
        Ticket,
        &["extract_execution_summary", "extract_execution_summary_dev"],
    ),
    unit("extract_execution", Extract, F::Execution, Ticket, &["collect_execution"]),
    unit(
        "convert_execution",
        Convert,
        F::Execution,
        Ticket,
        &["extract_execution", "convert_project"],
    ),
    unit("collect_task", Collect, F::Task, Ticket, &["extract_account", "convert_execution"]),
    unit(
        "extract_task",
        Extract,
        F::Task,
        Ticket,
        &["collect_task", "extract_account", "convert_execution"],
    ),
    unit(
        "convert_task",
        Convert,
        F::Task,
        Ticket,
        &["extract_task", "convert_account", "convert_execution"],
    ),
    unit("collect_task_commits", Collect, F::TaskCommit, Cross, &["extract_task"]),
    unit("extract_task_commits", Extract, F::TaskCommit, Cross, &["collect_task_commits"]),
    unit(
        "dbget_task_repo_commits",
        DbGet,
        F::TaskRepoCommit,
        Cross,
        &["extract_task_commits", "convert_task"],
    ),
    unit(
        "convert_task_repo_commits",
        Convert,
        F::TaskRepoCommit,
        Cross,
        &["dbget_task_repo_commits", "convert_task"],
    ),
    unit("collect_story", Collect, F::Story, Ticket, &["extract_account"]),
    unit("extract_story", Extract, F::Story, Ticket, &["collect_story"]),
    unit(
        "convert_story",
        Convert,
        F::Story,
        Ticket,
        &["extract_story", "convert_account", "convert_project"],
    ),
    unit("collect_execution_story", Collect, F::ExecutionStory, Ticket, &["extract_execution"]),
    unit(
        "extract_execution_story",
        Extract,
        F::ExecutionStory,
        Ticket,
        &["collect_execution_story"],
    ),
    unit(
        "convert_execution_story",
        Convert,
        F::ExecutionStory,
        Ticket,
        &["extract_execution_story", "convert_story", "convert_execution"],
    ),
    unit("collect_bug", Collect, F::Bug, Ticket, &["extract_account"]),
    unit("extract_bug", Extract, F::Bug, Ticket, &["collect_bug"]),
    unit(
        "convert_bug",
        Convert,
        F::Bug,
        Ticket,
        &["extract_bug", "convert_account", "convert_execution"],
    ),
    unit("collect_story_commits", Collect, F::StoryCommit, Cross, &["extract_story"]),
    unit("extract_story_commits", Extract, F::StoryCommit, Cross, &["collect_story_commits"]),
    unit(
        "dbget_story_repo_commits",
        DbGet,
        F::StoryRepoCommit,
        Cross,
        &["extract_story_commits", "convert_story"],
    ),
    unit(
        "convert_story_repo_commits",
        Convert,
        F::StoryRepoCommit,
        Cross,
        &["dbget_story_repo_commits", "convert_story"],
    ),
    unit("collect_bug_commits", Collect, F::BugCommit, Cross, &["extract_bug"]),
    unit("extract_bug_commits", Extract, F::BugCommit, Cross, &["collect_bug_commits"]),
    unit(
        "dbget_bug_repo_commits",
        DbGet,
        F::BugRepoCommit,
        Cross,
        &["extract_bug_commits", "convert_bug"],
    ),
    unit(
        "convert_bug_repo_commits",
        Convert,
        F::BugRepoCommit,
        Cross,
        &["dbget_bug_repo_commits", "convert_bug"],
    ),
    unit(
        "dbget_changelog",
        DbGet,
        F::Changelog,
        Ticket,
        &["extract_task", "extract_story", "extract_bug", "extract_account"],
    ),
    unit(
        "convert_changelog",
        Convert,
        F::Changelog,
        Ticket,
        &[
            "dbget_changelog",
            "convert_account",
            "convert_task",
            "convert_story",
            "convert_bug",
        ],
    ),
    unit("collect_task_worklogs", Collect, F::TaskWorklog, Ticket, &["extract_task"]),
    unit("extract_task_worklogs", Extract, F::TaskWorklog, Ticket, &["collect_task_worklogs"]),
    unit(
        "convert_task_worklogs",
        Convert,
        F::TaskWorklog,
        Ticket,
        &["extract_task_worklogs", "convert_task", "convert_account"],
    ),
];

pub fn subtask_metas() -> &'static [SubtaskMeta] {
    SUBTASKS
}

pub fn find(name: &str) -> Option<&'static SubtaskMeta> {
    SUBTASKS.iter().find(|meta| meta.name == name)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unit {0} is declared twice")]
    DuplicateName(&'static str),
    #[error("unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency {
        unit: &'static str,
        dependency: &'static str,
    },
    #[error("unit {unit} depends on {dependency}, which is declared after it")]
    ForwardDependency {
        unit: &'static str,
        dependency: &'static str,
    },
}

/// Checks names are unique and every dependency is a known, earlier unit (so the graph is acyclic).
pub fn validate(metas: &[SubtaskMeta]) -> Result<(), RegistryError> {
    let mut positions: HashMap<&'static str, usize> = HashMap::new();
    for (index, meta) in metas.iter().enumerate() {
        if positions.insert(meta.name, index).is_some() {
            return Err(RegistryError::DuplicateName(meta.name));
        }
    }
    for (index, meta) in metas.iter().enumerate() {
        for &dependency in meta.dependencies {
            match positions.get(dependency) {
                None => {
                    return Err(RegistryError::UnknownDependency {
                        unit: meta.name,
                        dependency,
                    })
                }
                Some(position) if *position >= index => {
                    return Err(RegistryError::ForwardDependency {
                        unit: meta.name,
                        dependency,
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
