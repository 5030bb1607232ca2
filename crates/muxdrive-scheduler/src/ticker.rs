//! Due-task tick loop
//!
//! A single logical ticker scans enabled tasks whose `next_run_at` has
//! passed and hands each to the [`TaskDispatcher`]. Dispatch marks the
//! task running so it can never be re-entered; the dispatcher is
//! responsible for the final status and for recomputing `next_run_at`
//! against completion time (not the old `next_run_at`, so a long pause
//! never produces a thundering herd).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muxdrive_core::domain::{SyncTask, TaskStatus};
use muxdrive_core::EngineResult;
use muxdrive_store::Store;

use crate::cron::CronExpr;

/// Base tick cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Receives due tasks from the ticker.
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Runs the task to completion. The record has already been marked
    /// running; implementations update the final status, `last_message`,
    /// `consecutive_failures`, and `next_run_at`.
    async fn run(&self, task: SyncTask);
}

/// The cron-driven scheduler.
pub struct Scheduler {
    store: Arc<Store>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Recomputes `next_run_at` for every enabled task. Called at startup
    /// so a restart never replays schedules from stale state.
    pub async fn reconcile(&self) -> EngineResult<()> {
        let now = Utc::now();
        let tasks = self.store.tasks.list().await?;
        for task in tasks {
            if !task.enabled {
                continue;
            }
            match CronExpr::parse(&task.schedule) {
                Ok(expr) => {
                    let next = expr.next_occurrence(now);
                    self.store
                        .tasks
                        .update(&task.id, |t| {
                            t.next_run_at = next;
                            // A crash mid-run leaves `running` behind.
                            if t.last_status == TaskStatus::Running {
                                t.last_status = TaskStatus::Idle;
                            }
                            if t.next_run_at.is_some() {
                                t.last_status = match t.last_status {
                                    TaskStatus::Idle => TaskStatus::Scheduled,
                                    other => other,
                                };
                            }
                        })
                        .await?;
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "Task schedule failed to parse");
                }
            }
        }
        Ok(())
    }

    /// Runs the tick loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Scheduler ticker starting");
        loop {
            let sleep = self.sleep_until_next_tick().await;
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.cancelled() => {
                    info!("Scheduler ticker stopping");
                    break;
                }
            }
            if let Err(err) = self.dispatch_due().await {
                warn!(error = %err, "Scheduler tick failed");
            }
        }
    }

    /// Time to sleep: the base cadence, or sooner when a task is due
    /// before that.
    async fn sleep_until_next_tick(&self) -> Duration {
        let now = Utc::now();
        let earliest = match self.store.tasks.list().await {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| t.enabled && !t.is_running())
                .filter_map(|t| t.next_run_at)
                .min(),
            Err(_) => None,
        };
        match earliest {
            Some(at) if at <= now => Duration::from_millis(10),
            Some(at) => {
                let until = (at - now)
                    .to_std()
                    .unwrap_or(TICK_INTERVAL)
                    .min(TICK_INTERVAL);
                until
            }
            None => TICK_INTERVAL,
        }
    }

    /// Scans for due tasks and spawns one dispatch per task.
    async fn dispatch_due(&self) -> EngineResult<()> {
        let now = Utc::now();
        let due: Vec<SyncTask> = self
            .store
            .tasks
            .list()
            .await?
            .into_iter()
            .filter(|t| t.due(now))
            .collect();

        for task in due {
            debug!(task_id = %task.id, name = %task.name, "Task due, dispatching");
            let marked = self
                .store
                .tasks
                .update(&task.id, |t| {
                    t.last_status = TaskStatus::Running;
                    t.last_run_at = Some(now);
                    t.last_message = Some("sync run started".into());
                })
                .await?;
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                dispatcher.run(marked).await;
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use muxdrive_core::domain::{
        ConflictPolicy, DetectionMode, GroupId, SyncDirection, TaskId, TenantId,
    };
    use std::sync::Mutex;

    struct RecordingDispatcher {
        ran: Mutex<Vec<TaskId>>,
        store: Arc<Store>,
    }

    #[async_trait::async_trait]
    impl TaskDispatcher for RecordingDispatcher {
        async fn run(&self, task: SyncTask) {
            self.ran.lock().unwrap().push(task.id);
            // Mimic the sync runner's completion bookkeeping.
            let next = CronExpr::parse(&task.schedule)
                .ok()
                .and_then(|e| e.next_occurrence(Utc::now()));
            let _ = self
                .store
                .tasks
                .update(&task.id, |t| {
                    t.last_status = TaskStatus::Success;
                    t.next_run_at = next;
                })
                .await;
        }
    }

    fn task(schedule: &str) -> SyncTask {
        let now = Utc::now();
        SyncTask {
            id: TaskId::new(),
            name: "t".into(),
            direction: SyncDirection::CloudToLocal,
            group_id: GroupId::new(),
            tenant_id: TenantId::new(),
            remote_folder_token: "fld".into(),
            local_path: "/tmp/x".into(),
            schedule: schedule.into(),
            enabled: true,
            detection: DetectionMode::SizeMtime,
            conflict: ConflictPolicy::Newest,
            propagate_delete: true,
            include_globs: vec![],
            exclude_globs: vec![],
            notes: None,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_run_at: None,
            last_status: TaskStatus::Idle,
            last_message: None,
            consecutive_failures: 0,
        }
    }

    #[tokio::test]
    async fn test_reconcile_computes_future_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let t = task("*/5 * * * *");
        let id = t.id;
        store.tasks.insert(t).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher {
            ran: Mutex::new(vec![]),
            store: Arc::clone(&store),
        });
        let scheduler = Scheduler::new(Arc::clone(&store), dispatcher);
        scheduler.reconcile().await.unwrap();

        let reloaded = store.tasks.get(&id).await.unwrap();
        let next = reloaded.next_run_at.expect("next_run_at set");
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn test_reconcile_demotes_stale_running_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut t = task("*/5 * * * *");
        t.last_status = TaskStatus::Running;
        let id = t.id;
        store.tasks.insert(t).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher {
            ran: Mutex::new(vec![]),
            store: Arc::clone(&store),
        });
        Scheduler::new(Arc::clone(&store), dispatcher)
            .reconcile()
            .await
            .unwrap();

        let reloaded = store.tasks.get(&id).await.unwrap();
        assert_ne!(reloaded.last_status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_due_task_is_dispatched_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut t = task("* * * * *");
        t.next_run_at = Some(Utc::now() - ChronoDuration::seconds(30));
        let id = t.id;
        store.tasks.insert(t).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher {
            ran: Mutex::new(vec![]),
            store: Arc::clone(&store),
        });
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&dispatcher) as _);

        scheduler.dispatch_due().await.unwrap();
        // The record was marked running synchronously, so a second scan
        // before completion must not re-dispatch.
        scheduler.dispatch_due().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.ran.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn test_disabled_task_is_not_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut t = task("* * * * *");
        t.enabled = false;
        t.next_run_at = Some(Utc::now() - ChronoDuration::seconds(30));
        store.tasks.insert(t).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher {
            ran: Mutex::new(vec![]),
            store: Arc::clone(&store),
        });
        Scheduler::new(Arc::clone(&store), Arc::clone(&dispatcher) as _)
            .dispatch_due()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.ran.lock().unwrap().is_empty());
    }
}
