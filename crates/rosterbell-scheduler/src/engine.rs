//! Scheduler Engine: the tick loop that checks and triggers tasks.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).
//!
//! Each due task runs as its own tokio task, guarded by a named lock keyed on
//! the task name. A trigger that arrives while the previous run still holds the
//! lock is dropped, not queued.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;

use rosterbell_core::config::{ExecutionMode, OverlapPolicy};

use crate::tasks::{ScheduledTask, SchedulerConfig};

/// Future returned by a task handler.
pub type TaskFuture = BoxFuture<'static, Result<(), String>>;

/// Runs a fired task. Lives outside this crate so the scheduler has no
/// dependency on what the tasks actually do.
pub type TaskHandler = Arc<dyn Fn(ScheduledTask) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(ScheduledTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |task| Box::pin(f(task)))
}

/// Named locks, one per running task.
#[derive(Clone, Default)]
pub struct TaskLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `name`, or `None` if a run already holds it.
    pub fn try_acquire(&self, name: &str) -> Option<TaskGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(name.to_string()) {
            Some(TaskGuard {
                name: name.to_string(),
                held: self.held.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

/// Releases the named lock on drop, including during a panic unwind.
pub struct TaskGuard {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.name);
    }
}

/// What happened to one due task during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Spawned in the background.
    Spawned(String),
    /// Ran in the foreground and finished.
    Completed(String),
    /// Ran in the foreground and returned an error.
    Failed(String, String),
    /// Dropped because the previous run is still active.
    Skipped(String),
}

/// The scheduler engine: owns the task table and their next run times.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    handler: TaskHandler,
    next_runs: HashMap<String, Option<DateTime<Utc>>>,
    locks: TaskLocks,
    running: JoinSet<()>,
}

impl SchedulerEngine {
    /// Create an engine whose first fire times are computed from now.
    pub fn new(config: SchedulerConfig, handler: TaskHandler) -> Self {
        Self::starting_at(config, handler, Utc::now())
    }

    /// Create an engine whose first fire times are computed from `start`.
    pub fn starting_at(
        config: SchedulerConfig,
        handler: TaskHandler,
        start: DateTime<Utc>,
    ) -> Self {
        let next_runs = config
            .tasks
            .iter()
            .map(|t| (t.name.clone(), t.next_after(start)))
            .collect();
        Self {
            config,
            handler,
            next_runs,
            locks: TaskLocks::new(),
            running: JoinSet::new(),
        }
    }

    /// Registered tasks with their next scheduled run.
    pub fn list_tasks(&self) -> Vec<(&ScheduledTask, Option<DateTime<Utc>>)> {
        self.config
            .tasks
            .iter()
            .map(|t| (t, self.next_runs.get(&t.name).copied().flatten()))
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.config.tasks.len()
    }

    pub fn locks(&self) -> &TaskLocks {
        &self.locks
    }

    /// Number of background runs not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Fire every task due at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<TickOutcome> {
        self.reap_finished();

        let mut outcomes = Vec::new();
        let tasks = self.config.tasks.clone();

        for task in tasks {
            let due = matches!(self.next_runs.get(&task.name), Some(Some(next)) if *next <= now);
            if !due {
                continue;
            }
            // Missed runs collapse into this one.
            self.next_runs.insert(task.name.clone(), task.next_after(now));

            let guard = match task.overlap {
                OverlapPolicy::Skip => match self.locks.try_acquire(&task.name) {
                    Some(guard) => Some(guard),
                    None => {
                        tracing::info!(
                            "⏭️ Task '{}' still running, skipping this trigger",
                            task.name
                        );
                        outcomes.push(TickOutcome::Skipped(task.name.clone()));
                        continue;
                    }
                },
                OverlapPolicy::Allow => None,
            };

            tracing::info!("🔔 Task triggered: '{}' ({})", task.name, task.trigger);
            let name = task.name.clone();
            let fut = (self.handler)(task.clone());

            match task.mode {
                ExecutionMode::Background => {
                    self.running.spawn(async move {
                        let _guard = guard;
                        match fut.await {
                            Ok(()) => tracing::debug!("✅ Task '{}' finished", name),
                            Err(e) => tracing::warn!("⚠️ Task '{}' failed: {}", name, e),
                        }
                    });
                    outcomes.push(TickOutcome::Spawned(task.name.clone()));
                }
                ExecutionMode::Foreground => {
                    let result = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err("task panicked".to_string()));
                    drop(guard);
                    match result {
                        Ok(()) => {
                            tracing::debug!("✅ Task '{}' finished", name);
                            outcomes.push(TickOutcome::Completed(name));
                        }
                        Err(e) => {
                            tracing::warn!("⚠️ Task '{}' failed: {}", name, e);
                            outcomes.push(TickOutcome::Failed(name, e));
                        }
                    }
                }
            }
        }

        outcomes
    }

    /// Drop handles of finished background runs; report panics.
    fn reap_finished(&mut self) {
        while let Some(result) = self.running.try_join_next() {
            if let Err(e) = result {
                tracing::error!("💥 Scheduled task panicked: {e}");
            }
        }
    }

    /// Wait for every in-flight background run to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(result) = self.running.join_next().await {
            if let Err(e) = result {
                tracing::error!("💥 Scheduled task panicked: {e}");
            }
        }
    }

    /// Tick loop until `shutdown` resolves, then wait for in-flight runs.
    pub async fn run_until<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tracing::info!(
            "⏰ Scheduler started: {} task(s), check every {}s",
            self.task_count(),
            self.config.tick_secs
        );

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        tracing::info!("🛑 Scheduler stopping, waiting for {} running task(s)", self.in_flight());
        self.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Trigger;
    use chrono::{Duration, TimeZone};
    use rosterbell_core::config::TaskAction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 30).unwrap()
    }

    fn every_minute(name: &str) -> ScheduledTask {
        ScheduledTask::new(name, Trigger::EveryMinute, TaskAction::DrainQueue).unwrap()
    }

    /// Handler that counts runs and blocks until `release` is notified.
    fn blocking_handler(count: Arc<AtomicUsize>, release: Arc<Notify>) -> TaskHandler {
        handler_fn(move |_task| {
            let count = count.clone();
            let release = release.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let config = SchedulerConfig::new(30, vec![every_minute("queue:drain")]).unwrap();
        let handler = blocking_handler(count.clone(), release.clone());
        let mut engine = SchedulerEngine::starting_at(config, handler, start());

        let first = engine.tick(start() + Duration::minutes(1)).await;
        assert_eq!(first, vec![TickOutcome::Spawned("queue:drain".into())]);
        tokio::task::yield_now().await;
        assert!(engine.locks().is_held("queue:drain"));

        // Second trigger while the first run is still blocked.
        let second = engine.tick(start() + Duration::minutes(2)).await;
        assert_eq!(second, vec![TickOutcome::Skipped("queue:drain".into())]);

        release.notify_one();
        engine.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!engine.locks().is_held("queue:drain"));

        // Lock released: the next trigger runs again.
        let third = engine.tick(start() + Duration::minutes(3)).await;
        assert_eq!(third, vec![TickOutcome::Spawned("queue:drain".into())]);
        release.notify_one();
        engine.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_allow_overlap_runs_concurrently() {
        let count = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let task = every_minute("allow").with_overlap(OverlapPolicy::Allow);
        let config = SchedulerConfig::new(30, vec![task]).unwrap();
        let handler = blocking_handler(count.clone(), release.clone());
        let mut engine = SchedulerEngine::starting_at(config, handler, start());

        engine.tick(start() + Duration::minutes(1)).await;
        engine.tick(start() + Duration::minutes(2)).await;
        assert_eq!(engine.in_flight(), 2);
        // Both runs have to be parked on the Notify before releasing.
        while count.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        release.notify_waiters();
        engine.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_due_does_not_fire() {
        let handler = handler_fn(|_| async { Ok::<(), String>(()) });
        let task = ScheduledTask::new(
            "digest:daily",
            Trigger::DailyAt { hour: 8, minute: 0 },
            TaskAction::DrainQueue,
        )
        .unwrap();
        let config = SchedulerConfig::new(30, vec![task]).unwrap();
        let mut engine = SchedulerEngine::starting_at(config, handler, start());

        // Started at 09:00, so the next run is tomorrow 08:00.
        assert!(engine.tick(start() + Duration::hours(2)).await.is_empty());
        let (_, next) = engine.list_tasks()[0];
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap()));
        let fired = engine.tick(Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 10).unwrap()).await;
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_block_siblings() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handler = handler_fn(move |task: ScheduledTask| {
            let ran = ran2.clone();
            async move {
                if task.name == "broken" {
                    return Err("due-set query failed".to_string());
                }
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let tasks = vec![
            every_minute("broken").with_mode(ExecutionMode::Foreground),
            every_minute("healthy").with_mode(ExecutionMode::Foreground),
        ];
        let config = SchedulerConfig::new(30, tasks).unwrap();
        let mut engine = SchedulerEngine::starting_at(config, handler, start());

        let outcomes = engine.tick(start() + Duration::minutes(1)).await;
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Failed("broken".into(), "due-set query failed".into()),
                TickOutcome::Completed("healthy".into()),
            ]
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!engine.locks().is_held("broken"));
    }

    fn boom() -> Result<(), String> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_task_releases_lock() {
        let handler = handler_fn(|_| async { boom() });
        let config = SchedulerConfig::new(30, vec![every_minute("panics")]).unwrap();
        let mut engine = SchedulerEngine::starting_at(config, handler, start());

        engine.tick(start() + Duration::minutes(1)).await;
        engine.wait_idle().await;
        assert!(!engine.locks().is_held("panics"));
        let again = engine.tick(start() + Duration::minutes(2)).await;
        assert_eq!(again, vec![TickOutcome::Spawned("panics".into())]);
        engine.wait_idle().await;
    }

    #[test]
    fn test_locks_are_per_name() {
        let locks = TaskLocks::new();
        let a = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        drop(a);
        assert!(locks.try_acquire("a").is_some());
    }
}
