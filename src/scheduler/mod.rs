//! Owns every cron entry and one-off timer, and is the sole writer of
//! `next_run_at`.
//!
//! Two execution paths feed the same [`Executor`]: a `tokio_cron_scheduler`
//! entry per recurring task (registered with `Job::new_async`, re-reading the
//! task fresh from the store on every firing rather than closing over a
//! snapshot), and a `tokio::time::sleep` timer per one-off task. A
//! reconciliation loop runs on a fixed interval and corrects
//! drift between what's scheduled here and what the Store says should be
//! scheduled, so edits made directly against the Store (or missed during a
//! restart) are picked up without requiring every caller to go through
//! [`Scheduler`]'s own edit methods.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::error::Result;
use crate::executor::{ExecKind, Executor};
use crate::store::{Store, Task};

struct OneOffTimer {
    handle: JoinHandle<()>,
}

impl Drop for OneOffTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Inner {
    cron_jobs: HashMap<i64, Uuid>,
    /// The `cron_expr` each cron job in `cron_jobs` was last registered with,
    /// so reconciliation can detect an edit that changed the expression
    /// without going through `task_updated`.
    cron_exprs: HashMap<i64, String>,
    one_off_timers: HashMap<i64, OneOffTimer>,
}

pub struct Scheduler {
    store: Store,
    executor: Arc<Executor>,
    cron: Mutex<JobScheduler>,
    inner: Mutex<Inner>,
    reconcile_secs: u64,
    stop: RwLock<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub async fn new(store: Store, executor: Arc<Executor>, reconcile_secs: u64) -> Result<Self> {
        let cron = JobScheduler::new()
            .await
            .map_err(|e| crate::error::AgentSchedError::Scheduler(e.to_string()))?;
        Ok(Self {
            store,
            executor,
            cron: Mutex::new(cron),
            inner: Mutex::new(Inner {
                cron_jobs: HashMap::new(),
                cron_exprs: HashMap::new(),
                one_off_timers: HashMap::new(),
            }),
            reconcile_secs,
            stop: RwLock::new(None),
        })
    }

    /// Marks stranded runs failed, schedules every enabled task, starts the
    /// cron engine, and spawns the reconciliation loop. Call once at startup.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let stranded = self.store.mark_stranded_running().await?;
        if stranded > 0 {
            tracing::warn!(count = stranded, "marked stranded runs as failed on startup");
        }

        for task in self.store.list_enabled_tasks().await? {
            if let Err(e) = self.schedule_task(&task).await {
                tracing::error!(task_id = task.id, error = %e, "failed to schedule task at startup");
            }
        }

        self.cron
            .lock()
            .await
            .start()
            .await
            .map_err(|e| crate::error::AgentSchedError::Scheduler(e.to_string()))?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(this.reconcile_secs));
            loop {
                tick.tick().await;
                this.reconcile().await;
            }
        });
        *self.stop.write().await = Some(handle);

        Ok(())
    }

    /// Stops the reconciliation loop, cancels every one-off timer, and shuts
    /// the cron engine down. In-flight executions are left to finish on their
    /// own; the scheduler never cancels a running job.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.stop.write().await.take() {
            handle.abort();
        }
        {
            let mut inner = self.inner.lock().await;
            inner.one_off_timers.clear();
            inner.cron_jobs.clear();
            inner.cron_exprs.clear();
        }
        self.cron
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| crate::error::AgentSchedError::Scheduler(e.to_string()))?;
        Ok(())
    }

    // ---------------- Scheduling ----------------

    /// Routes a task to a cron entry or a one-off timer depending on
    /// `cron_expr`. Replaces any entry already registered for this task id.
    async fn schedule_task(self: &Arc<Self>, task: &Task) -> Result<()> {
        self.unschedule_task(task.id).await;

        if task.is_one_off() {
            self.schedule_one_off(task).await
        } else {
            self.schedule_recurring(task).await
        }
    }

    async fn schedule_one_off(self: &Arc<Self>, task: &Task) -> Result<()> {
        let now = Utc::now();
        let delay = match task.scheduled_at {
            Some(at) if at > now => (at - now).to_std().unwrap_or(std::time::Duration::ZERO),
            _ => std::time::Duration::ZERO,
        };

        self.store.update_next_run_at(task.id, task.scheduled_at.or(Some(now))).await?;

        let this = self.clone();
        let task_id = task.id;
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.fire_one_off(task_id).await;
        });

        self.inner
            .lock()
            .await
            .one_off_timers
            .insert(task.id, OneOffTimer { handle });
        Ok(())
    }

    async fn fire_one_off(self: &Arc<Self>, task_id: i64) {
        self.inner.lock().await.one_off_timers.remove(&task_id);

        let task = match self.store.get_task(task_id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(task_id, error = %e, "one-off task vanished before firing");
                return;
            }
        };
        if !task.enabled {
            return;
        }

        if let Err(e) = self.executor.execute(&task, ExecKind::Scheduled).await {
            tracing::error!(task_id, error = %e, "one-off execution failed");
        }
        if let Err(e) = self.store.disable_task(task_id).await {
            tracing::error!(task_id, error = %e, "failed to disable one-off task after firing");
        }
    }

    async fn schedule_recurring(self: &Arc<Self>, task: &Task) -> Result<()> {
        let cron_expr = task.cron_expr.clone();
        let next_run_at = cron::Schedule::from_str(&cron_expr)
            .ok()
            .and_then(|s| s.upcoming(Utc).next());
        self.store.update_next_run_at(task.id, next_run_at).await?;

        let this = self.clone();
        let task_id = task.id;
        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move {
                this.fire_recurring(task_id).await;
            })
        })
        .map_err(|e| crate::error::AgentSchedError::Scheduler(e.to_string()))?;
        let job_id = job.guid();

        self.cron
            .lock()
            .await
            .add(job)
            .await
            .map_err(|e| crate::error::AgentSchedError::Scheduler(e.to_string()))?;

        {
            let mut inner = self.inner.lock().await;
            inner.cron_jobs.insert(task.id, job_id);
            inner.cron_exprs.insert(task.id, cron_expr);
        }
        Ok(())
    }

    /// Always re-fetches the task from the Store rather than using a captured
    /// snapshot, so a task disabled or edited between scheduling and firing is
    /// honored.
    async fn fire_recurring(self: &Arc<Self>, task_id: i64) {
        let task = match self.store.get_task(task_id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "recurring task missing at fire time, skipping");
                return;
            }
        };
        if !task.enabled {
            return;
        }

        if let Err(e) = self.executor.execute(&task, ExecKind::Scheduled).await {
            tracing::error!(task_id, error = %e, "scheduled execution failed");
        }

        let next_run_at = cron::Schedule::from_str(&task.cron_expr)
            .ok()
            .and_then(|s| s.upcoming(Utc).next());
        if let Err(e) = self.store.update_next_run_at(task_id, next_run_at).await {
            tracing::error!(task_id, error = %e, "failed to persist next_run_at after firing");
        }
    }

    async fn unschedule_task(&self, task_id: i64) {
        let (cron_job, timer) = {
            let mut inner = self.inner.lock().await;
            inner.cron_exprs.remove(&task_id);
            (inner.cron_jobs.remove(&task_id), inner.one_off_timers.remove(&task_id))
        };
        drop(timer);
        if let Some(job_id) = cron_job {
            let _ = self.cron.lock().await.remove(&job_id).await;
        }
    }

    // ---------------- Edit operations ----------------

    pub async fn task_added(self: &Arc<Self>, task: &Task) -> Result<()> {
        if task.enabled {
            self.schedule_task(task).await?;
        }
        Ok(())
    }

    pub async fn task_updated(self: &Arc<Self>, task: &Task) -> Result<()> {
        self.unschedule_task(task.id).await;
        if task.enabled {
            self.schedule_task(task).await?;
        } else {
            self.store.update_next_run_at(task.id, None).await?;
        }
        Ok(())
    }

    pub async fn task_removed(&self, task_id: i64) {
        self.unschedule_task(task_id).await;
    }

    // ---------------- Reconciliation ----------------

    /// Compares what the Store says should run against what's actually
    /// registered, and corrects drift: newly enabled tasks get scheduled,
    /// disabled ones get dropped, a changed `cron_expr` gets rescheduled, and
    /// a one-off/recurring flip gets unscheduled and rescheduled with the new
    /// routing.
    async fn reconcile(self: &Arc<Self>) {
        let tasks = match self.store.list_tasks().await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "reconciliation failed to list tasks");
                return;
            }
        };

        let mut seen = std::collections::HashSet::new();
        for task in &tasks {
            seen.insert(task.id);
            let (is_cron, is_one_off_timer, stored_expr) = {
                let inner = self.inner.lock().await;
                (
                    inner.cron_jobs.contains_key(&task.id),
                    inner.one_off_timers.contains_key(&task.id),
                    inner.cron_exprs.get(&task.id).cloned(),
                )
            };
            let scheduled = is_cron || is_one_off_timer;
            let kind_flipped = (is_cron && task.is_one_off()) || (is_one_off_timer && !task.is_one_off());
            let expr_changed = is_cron && !kind_flipped && stored_expr.as_deref() != Some(task.cron_expr.as_str());

            if task.enabled && !scheduled {
                if let Err(e) = self.schedule_task(task).await {
                    tracing::error!(task_id = task.id, error = %e, "reconciliation failed to schedule task");
                }
            } else if !task.enabled && scheduled {
                self.unschedule_task(task.id).await;
            } else if task.enabled && (kind_flipped || expr_changed) {
                if let Err(e) = self.schedule_task(task).await {
                    tracing::error!(task_id = task.id, error = %e, "reconciliation failed to reschedule task");
                }
            }
        }

        let stale: Vec<i64> = {
            let inner = self.inner.lock().await;
            inner
                .cron_jobs
                .keys()
                .chain(inner.one_off_timers.keys())
                .filter(|id| !seen.contains(id))
                .copied()
                .collect()
        };
        for task_id in stale {
            self.unschedule_task(task_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetGate, FixedUsageClient, UsageBucket, UsageSnapshot};
    use crate::store::NewTask;
    use crate::stream::StreamManager;
    use std::time::Duration;

    async fn test_executor(store: Store) -> Arc<Executor> {
        let gate = BudgetGate::new(Box::new(FixedUsageClient(Ok(UsageSnapshot {
            five_hour: UsageBucket { utilization: 0.0, resets_at: Utc::now() },
            seven_day: UsageBucket { utilization: 0.0, resets_at: Utc::now() },
        }))));
        Arc::new(Executor::new(
            store,
            Arc::new(StreamManager::new(100)),
            gate,
            "true",
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn one_off_task_fires_and_disables_itself() {
        let store = Store::open_in_memory().await.unwrap();
        let executor = test_executor(store.clone()).await;
        let scheduler = Arc::new(Scheduler::new(store.clone(), executor, 3600).await.unwrap());

        let task = store
            .create_task(NewTask {
                name: "once".into(),
                prompt: "ignored".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        scheduler.task_added(&task).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let reloaded = store.get_task(task.id).await.unwrap();
        assert!(!reloaded.enabled);
        let runs = store.list_runs_for_task(task.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn recurring_task_gets_next_run_at_on_schedule() {
        let store = Store::open_in_memory().await.unwrap();
        let executor = test_executor(store.clone()).await;
        let scheduler = Arc::new(Scheduler::new(store.clone(), executor, 3600).await.unwrap());

        let task = store
            .create_task(NewTask {
                name: "daily".into(),
                prompt: "ignored".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "0 0 3 * * *".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        scheduler.task_added(&task).await.unwrap();

        let reloaded = store.get_task(task.id).await.unwrap();
        assert!(reloaded.next_run_at.is_some());
    }

    #[tokio::test]
    async fn disabling_a_task_clears_next_run_at() {
        let store = Store::open_in_memory().await.unwrap();
        let executor = test_executor(store.clone()).await;
        let scheduler = Arc::new(Scheduler::new(store.clone(), executor, 3600).await.unwrap());

        let mut task = store
            .create_task(NewTask {
                name: "daily".into(),
                prompt: "ignored".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "0 0 3 * * *".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        scheduler.task_added(&task).await.unwrap();

        task.enabled = false;
        let updated = store.update_task(task).await.unwrap();
        scheduler.task_updated(&updated).await.unwrap();

        let reloaded = store.get_task(updated.id).await.unwrap();
        assert!(reloaded.next_run_at.is_none());
    }

    #[tokio::test]
    async fn reconciliation_picks_up_a_task_scheduled_outside_the_scheduler() {
        let store = Store::open_in_memory().await.unwrap();
        let executor = test_executor(store.clone()).await;
        let scheduler = Arc::new(Scheduler::new(store.clone(), executor, 3600).await.unwrap());
        scheduler.start().await.unwrap();

        let task = store
            .create_task(NewTask {
                name: "drift".into(),
                prompt: "ignored".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "0 0 3 * * *".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();

        scheduler.reconcile().await;

        let reloaded = store.get_task(task.id).await.unwrap();
        assert!(reloaded.next_run_at.is_some());
    }

    #[tokio::test]
    async fn reconciliation_reschedules_on_cron_expr_change() {
        let store = Store::open_in_memory().await.unwrap();
        let executor = test_executor(store.clone()).await;
        let scheduler = Arc::new(Scheduler::new(store.clone(), executor, 3600).await.unwrap());

        let task = store
            .create_task(NewTask {
                name: "edited".into(),
                prompt: "ignored".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "0 0 3 * * *".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        scheduler.task_added(&task).await.unwrap();

        let stored_expr_before = {
            let inner = scheduler.inner.lock().await;
            inner.cron_exprs.get(&task.id).cloned()
        };
        assert_eq!(stored_expr_before.as_deref(), Some("0 0 3 * * *"));

        let mut edited = store.get_task(task.id).await.unwrap();
        edited.cron_expr = "0 0 4 * * *".into();
        store.update_task(edited).await.unwrap();

        scheduler.reconcile().await;

        let stored_expr_after = {
            let inner = scheduler.inner.lock().await;
            inner.cron_exprs.get(&task.id).cloned()
        };
        assert_eq!(stored_expr_after.as_deref(), Some("0 0 4 * * *"));
    }
}
