//! Dependency-ordered concurrent execution of pipeline units.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::registry::{StageKind, SubtaskMeta};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub records: usize,
    /// Records skipped because they could not be converted.
    pub failed_records: usize,
}

#[async_trait]
pub trait UnitRunner: Send + Sync + 'static {
    /// `Some(reason)` when the unit should not run in this task at all.
    fn skip_reason(&self, meta: &SubtaskMeta) -> Option<String>;

    async fn run_unit(&self, meta: &SubtaskMeta) -> Result<UnitStats, TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded { stats: UnitStats },
    Failed { error: String },
    /// A dependency failed or was itself blocked.
    Blocked { by: String },
    Skipped { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    pub name: String,
    pub kind: StageKind,
    #[serde(flatten)]
    pub status: UnitStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub connection_id: u64,
    pub project_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitOutcome>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.units.iter().all(|unit| {
            matches!(
                unit.status,
                UnitStatus::Succeeded { .. } | UnitStatus::Skipped { .. }
            )
        })
    }

    pub fn failed_units(&self) -> Vec<&UnitOutcome> {
        self.units
            .iter()
            .filter(|unit| matches!(unit.status, UnitStatus::Failed { .. }))
            .collect()
    }

    pub fn outcome(&self, name: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|unit| unit.name == name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Satisfied,
    Unsatisfied,
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type Finished = (usize, DateTime<Utc>, Result<UnitStats, String>);

/// Runs `metas` respecting their dependencies, at most `max_parallel` at a time.
///
/// A unit starts only once every dependency succeeded or was skipped. Dependents of a failed
/// unit are reported as blocked; unrelated branches keep running. On cancellation in-flight
/// units are aborted and everything not finished is reported as cancelled. Outcomes come back
/// in registry order.
pub async fn run_units<R: UnitRunner>(
    metas: &[SubtaskMeta],
    runner: Arc<R>,
    cancel: CancellationToken,
    max_parallel: usize,
) -> Vec<UnitOutcome> {
    let max_parallel = max_parallel.max(1);
    let mut outcomes: Vec<Option<UnitOutcome>> = vec![None; metas.len()];
    let mut resolved: HashMap<&'static str, Resolution> = HashMap::new();
    let mut pending: Vec<usize> = (0..metas.len()).collect();
    let mut running: BTreeSet<usize> = BTreeSet::new();
    let mut join_set: JoinSet<Finished> = JoinSet::new();

    let settle = |outcomes: &mut Vec<Option<UnitOutcome>>,
                  index: usize,
                  status: UnitStatus,
                  started_at: Option<DateTime<Utc>>| {
        let meta = &metas[index];
        outcomes[index] = Some(UnitOutcome {
            name: meta.name.to_string(),
            kind: meta.kind,
            status,
            started_at,
            finished_at: Some(Utc::now()),
        });
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut progressed = true;
        while progressed {
            progressed = false;
            let mut still_pending = Vec::with_capacity(pending.len());
            for index in pending.drain(..) {
                let meta = metas[index];
                let blocker = meta.dependencies.iter().find(|dependency| {
                    matches!(resolved.get(*dependency), Some(Resolution::Unsatisfied))
                });
                if let Some(blocker) = blocker {
                    debug!(unit = meta.name, by = blocker, "unit blocked");
                    settle(
                        &mut outcomes,
                        index,
                        UnitStatus::Blocked {
                            by: blocker.to_string(),
                        },
                        None,
                    );
                    resolved.insert(meta.name, Resolution::Unsatisfied);
                    progressed = true;
                    continue;
                }

                let ready = meta.dependencies.iter().all(|dependency| {
                    matches!(resolved.get(dependency), Some(Resolution::Satisfied))
                });
                if !ready {
                    still_pending.push(index);
                    continue;
                }

                if let Some(reason) = runner.skip_reason(&meta) {
                    debug!(unit = meta.name, %reason, "unit skipped");
                    settle(&mut outcomes, index, UnitStatus::Skipped { reason }, None);
                    resolved.insert(meta.name, Resolution::Satisfied);
                    progressed = true;
                    continue;
                }

                if running.len() >= max_parallel {
                    still_pending.push(index);
                    continue;
                }

                let runner = runner.clone();
                running.insert(index);
                join_set.spawn(async move {
                    let started_at = Utc::now();
                    let handle = tokio::spawn(async move { runner.run_unit(&meta).await });
                    let _abort = AbortOnDrop(handle.abort_handle());
                    let result = match handle.await {
                        Ok(result) => result.map_err(|err| err.to_string()),
                        Err(err) if err.is_panic() => Err(format!("unit panicked: {err}")),
                        Err(err) => Err(err.to_string()),
                    };
                    (index, started_at, result)
                });
            }
            pending = still_pending;
        }

        if join_set.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            joined = join_set.join_next() => {
                if let Some(Ok((index, started_at, result))) = joined {
                    running.remove(&index);
                    let meta = &metas[index];
                    let status = match result {
                        Ok(stats) => {
                            resolved.insert(meta.name, Resolution::Satisfied);
                            UnitStatus::Succeeded { stats }
                        }
                        Err(error) => {
                            warn!(unit = meta.name, %error, "unit failed");
                            resolved.insert(meta.name, Resolution::Unsatisfied);
                            UnitStatus::Failed { error }
                        }
                    };
                    settle(&mut outcomes, index, status, Some(started_at));
                }
            }
        }
    }

    if cancel.is_cancelled() {
        join_set.abort_all();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, started_at, result)) = joined {
                running.remove(&index);
                let status = match result {
                    Ok(stats) => UnitStatus::Succeeded { stats },
                    Err(error) => UnitStatus::Failed { error },
                };
                settle(&mut outcomes, index, status, Some(started_at));
            }
        }
    }

    for index in running.into_iter().chain(pending) {
        let status = if cancel.is_cancelled() {
            UnitStatus::Cancelled
        } else {
            UnitStatus::Blocked {
                by: "unresolved dependency".to_string(),
            }
        };
        settle(&mut outcomes, index, status, None);
    }

    outcomes
        .into_iter()
        .zip(metas)
        .map(|(outcome, meta)| {
            outcome.unwrap_or_else(|| UnitOutcome {
                name: meta.name.to_string(),
                kind: meta.kind,
                status: UnitStatus::Cancelled,
                started_at: None,
                finished_at: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SUBTASKS;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sleeps a pseudo-random few milliseconds per unit and records start/finish order.
    struct JitterRunner {
        seed: AtomicU64,
        log: Mutex<Vec<(&'static str, bool)>>,
        fail: Option<&'static str>,
        skip: Option<&'static str>,
        hang: Option<&'static str>,
    }

    impl JitterRunner {
        fn new(seed: u64) -> Self {
            Self {
                seed: AtomicU64::new(seed),
                log: Mutex::new(Vec::new()),
                fail: None,
                skip: None,
                hang: None,
            }
        }

        fn next_delay(&self) -> Duration {
            let mut x = self.seed.load(Ordering::SeqCst);
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.seed.store(x, Ordering::SeqCst);
            Duration::from_millis((x >> 33) % 5)
        }
    }

    #[async_trait]
    impl UnitRunner for JitterRunner {
        fn skip_reason(&self, meta: &SubtaskMeta) -> Option<String> {
            (Some(meta.name) == self.skip).then(|| "disabled".to_string())
        }

        async fn run_unit(&self, meta: &SubtaskMeta) -> Result<UnitStats, TaskError> {
            self.log.lock().unwrap().push((meta.name, true));
            if Some(meta.name) == self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            tokio::time::sleep(self.next_delay()).await;
            self.log.lock().unwrap().push((meta.name, false));
            if Some(meta.name) == self.fail {
                return Err(TaskError::Convert("boom".into()));
            }
            Ok(UnitStats {
                records: 1,
                failed_records: 0,
            })
        }
    }

    fn position(log: &[(&'static str, bool)], name: &str, started: bool) -> usize {
        log.iter()
            .position(|(unit, s)| *unit == name && *s == started)
            .unwrap_or_else(|| panic!("{name} missing from log"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dependencies_finish_before_dependents_start() {
        for seed in [1_u64, 7, 42, 1234, 99_999] {
            let runner = Arc::new(JitterRunner::new(seed));
            let outcomes =
                run_units(SUBTASKS, runner.clone(), CancellationToken::new(), 8).await;
            assert!(outcomes
                .iter()
                .all(|o| matches!(o.status, UnitStatus::Succeeded { .. })));

            let log = runner.log.lock().unwrap().clone();
            for meta in SUBTASKS {
                let started = position(&log, meta.name, true);
                for dependency in meta.dependencies {
                    let finished = position(&log, dependency, false);
                    assert!(
                        finished < started,
                        "seed {seed}: {} started before {dependency} finished",
                        meta.name
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn failure_blocks_only_dependents() {
        let mut runner = JitterRunner::new(3);
        runner.fail = Some("extract_story");
        let outcomes = run_units(SUBTASKS, Arc::new(runner), CancellationToken::new(), 4).await;
        let status = |name: &str| {
            outcomes
                .iter()
                .find(|o| o.name == name)
                .map(|o| o.status.clone())
                .unwrap()
        };

        assert!(matches!(status("extract_story"), UnitStatus::Failed { .. }));
        assert_eq!(
            status("convert_story"),
            UnitStatus::Blocked {
                by: "extract_story".into()
            }
        );
        assert_eq!(
            status("convert_execution_story"),
            UnitStatus::Blocked {
                by: "convert_story".into()
            }
        );
        assert!(matches!(status("convert_changelog"), UnitStatus::Blocked { .. }));
        assert!(matches!(status("convert_bug"), UnitStatus::Succeeded { .. }));
        assert!(matches!(status("convert_task_worklogs"), UnitStatus::Succeeded { .. }));
    }

    #[tokio::test]
    async fn skipped_units_satisfy_their_dependents() {
        let mut runner = JitterRunner::new(5);
        runner.skip = Some("collect_department");
        let outcomes = run_units(SUBTASKS, Arc::new(runner), CancellationToken::new(), 4).await;
        let department = outcomes.iter().find(|o| o.name == "collect_department").unwrap();
        assert!(matches!(department.status, UnitStatus::Skipped { .. }));
        let extract = outcomes.iter().find(|o| o.name == "extract_department").unwrap();
        assert!(matches!(extract.status, UnitStatus::Succeeded { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_stops_in_flight_units() {
        let mut runner = JitterRunner::new(11);
        runner.hang = Some("collect_account");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcomes = tokio::time::timeout(
            Duration::from_secs(10),
            run_units(SUBTASKS, Arc::new(runner), cancel, 4),
        )
        .await
        .expect("scheduler returns after cancellation");

        let account = outcomes.iter().find(|o| o.name == "collect_account").unwrap();
        assert_eq!(account.status, UnitStatus::Cancelled);
        let convert = outcomes.iter().find(|o| o.name == "convert_task").unwrap();
        assert_eq!(convert.status, UnitStatus::Cancelled);
    }
}
