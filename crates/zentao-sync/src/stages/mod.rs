//! Unit bodies: one function per stage kind, dispatched on the entity family.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, info_span, Instrument};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::registry::{StageKind, SubtaskMeta};
use crate::scheduler::{UnitRunner, UnitStats};

mod collect;
mod convert;
mod dbget;
mod extract;

/// Runs registry units against one prepared [`TaskContext`].
#[derive(Debug)]
pub struct StageRunner {
    ctx: Arc<TaskContext>,
}

impl StageRunner {
    pub fn new(ctx: Arc<TaskContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.ctx
    }
}

#[async_trait]
impl UnitRunner for StageRunner {
    fn skip_reason(&self, meta: &SubtaskMeta) -> Option<String> {
        if !self.ctx.scope_config.enables(meta.domain) {
            return Some(format!("{:?} entities are disabled by the scope config", meta.domain));
        }
        if !meta.family.is_connection_wide() && self.ctx.project_id().is_none() {
            return Some("no project selected".to_string());
        }
        None
    }

    async fn run_unit(&self, meta: &SubtaskMeta) -> Result<UnitStats, TaskError> {
        if self.ctx.is_closed() {
            return Err(TaskError::Cancelled);
        }
        let span = info_span!("subtask", name = meta.name, run_id = %self.ctx.run_id);
        async {
            let stats = match meta.kind {
                StageKind::Collect => collect::collect(&self.ctx, meta.family).await?,
                StageKind::Extract => extract::extract(&self.ctx, meta.family).await?,
                StageKind::Convert => convert::convert(&self.ctx, meta.family).await?,
                StageKind::DbGet => dbget::dbget(&self.ctx, meta.family).await?,
            };
            info!(
                records = stats.records,
                failed_records = stats.failed_records,
                "unit finished"
            );
            Ok::<_, TaskError>(stats)
        }
        .instrument(span)
        .await
    }
}

fn unsupported(kind: StageKind, family: zentao_core::EntityFamily) -> TaskError {
    TaskError::Configuration(format!("no {kind} stage is defined for {family}"))
}
