//! Pipeline wiring: maps scheduled task actions onto dispatch, drain and prune.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use rosterbell_core::config::{RosterbellConfig, TaskAction};
use rosterbell_core::error::Result;
use rosterbell_core::types::NotificationKind;
use rosterbell_scheduler::{ScheduledTask, SchedulerConfig, TaskHandler, handler_fn};

use crate::broadcast::{BroadcastEvent, BroadcastHandle};
use crate::delivery::{DeliveryWorker, DrainReport, WorkerPool};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::mailer::{self, Mailer};
use crate::queue::JobQueue;
use crate::records::{AttendanceRecord, DueSource, SqliteDueSource};
use crate::templates::TemplateRegistry;

pub struct NotificationPipeline {
    dispatcher: Dispatcher,
    queue: Arc<JobQueue>,
    pool: WorkerPool,
    broadcast: BroadcastHandle,
    failed_retention_days: u32,
}

impl NotificationPipeline {
    pub fn new(
        config: &RosterbellConfig,
        source: Arc<dyn DueSource>,
        queue: Arc<JobQueue>,
        mailer: Arc<dyn Mailer>,
        broadcast: BroadcastHandle,
    ) -> Self {
        let dispatcher = Dispatcher::new(source, queue.clone(), config.queue.clone());
        let worker = DeliveryWorker::new(
            queue.clone(),
            mailer,
            Arc::new(TemplateRegistry::builtin()),
            broadcast.clone(),
            config.queue.retry_backoff_secs,
        );
        Self {
            dispatcher,
            queue,
            pool: WorkerPool::new(worker, &config.queue),
            broadcast,
            failed_retention_days: config.queue.failed_retention_days,
        }
    }

    /// Open the database and mailer named in the config. Task triggers are
    /// checked first so a broken schedule never reaches the database.
    pub fn from_config(config: &RosterbellConfig, broadcast: BroadcastHandle) -> Result<Self> {
        SchedulerConfig::from_config(&config.scheduler)?;
        let path = config.database.resolved_path();
        let queue = Arc::new(JobQueue::open(&path)?);
        let source = Arc::new(SqliteDueSource::open(
            &path,
            config.policy.clone(),
            config.broadcast.privileged_roles.clone(),
        )?);
        let mailer = mailer::from_config(&config.mail)?;
        tracing::info!(
            "🗄️ Database: {} | mailer: {} | workers: {}",
            path.display(),
            mailer.name(),
            config.queue.workers
        );
        Ok(Self::new(config, source, queue, mailer, broadcast))
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub async fn dispatch(
        &self,
        kinds: &[NotificationKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchReport>> {
        self.dispatcher.dispatch_all(kinds, now).await
    }

    pub async fn drain(&self) -> Result<DrainReport> {
        self.pool.drain().await
    }

    /// Remove dead-letter rows older than the retention window.
    pub fn prune_failed(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = now - Duration::days(self.failed_retention_days as i64);
        let pruned = self.queue.prune_failed(before)?;
        if pruned > 0 {
            tracing::info!("🧹 Pruned {pruned} failed job(s) older than {before}");
        }
        Ok(pruned)
    }

    /// Announce an attendance clock-in on the realtime channels.
    pub fn clocked_in(&self, record: &AttendanceRecord) {
        self.broadcast.publish(BroadcastEvent::clocked_in(record));
    }

    /// Execute one scheduled task.
    pub async fn run_task(&self, task: &ScheduledTask) -> std::result::Result<(), String> {
        let now = Utc::now();
        match &task.action {
            TaskAction::Dispatch { kinds } => self.dispatch(kinds, now).await.map(|_| ()),
            TaskAction::DrainQueue => self.drain().await.map(|_| ()),
            TaskAction::PruneFailed => self.prune_failed(now).map(|_| ()),
        }
        .map_err(|e| format!("{}: {e}", task.name))
    }

    /// Scheduler handler running tasks against this pipeline.
    pub fn handler(self: &Arc<Self>) -> TaskHandler {
        let pipeline = self.clone();
        handler_fn(move |task| {
            let pipeline = pipeline.clone();
            async move { pipeline.run_task(&task).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Broadcaster, Subscriber};
    use crate::mailer::MailError;
    use crate::mailer::testing::RecordingMailer;
    use crate::records::fixtures::{employee, pending_leave};
    use rosterbell_core::config::{PolicyConfig, QueueConfig, default_tasks};
    use rosterbell_scheduler::{SchedulerEngine, Trigger};

    fn config() -> RosterbellConfig {
        RosterbellConfig {
            queue: QueueConfig {
                workers: 2,
                timeout_secs: 5,
                retry_backoff_secs: 0,
                ..QueueConfig::default()
            },
            ..RosterbellConfig::default()
        }
    }

    /// Three approvers, each with one pending request from the same employee.
    fn hr_source() -> Arc<SqliteDueSource> {
        let src =
            SqliteDueSource::open_in_memory(PolicyConfig::default(), vec!["hr".into()]).unwrap();
        src.upsert_employee(&employee(1, "Lan", "employee", Some(2))).unwrap();
        for (i, name) in ["Minh", "Tuan", "Hoa"].iter().enumerate() {
            let id = 10 + i as i64;
            src.upsert_employee(&employee(id, name, "manager", None)).unwrap();
            let created_at = Utc::now() - Duration::hours(2);
            src.upsert_leave_request(&pending_leave(100 + id, 1, id, created_at)).unwrap();
        }
        Arc::new(src)
    }

    fn pipeline(
        mailer: Arc<RecordingMailer>,
        broadcast: BroadcastHandle,
    ) -> Arc<NotificationPipeline> {
        Arc::new(NotificationPipeline::new(
            &config(),
            hr_source(),
            Arc::new(JobQueue::open_in_memory().unwrap()),
            mailer,
            broadcast,
        ))
    }

    fn task(name: &str, action: TaskAction) -> ScheduledTask {
        ScheduledTask::new(name, Trigger::EveryMinute, action).unwrap()
    }

    #[tokio::test]
    async fn test_reminders_end_to_end() {
        let mailer = Arc::new(RecordingMailer::default());
        mailer.fail("tuan@acme.test", MailError::Transient("connection reset".into()));
        let p = pipeline(mailer.clone(), BroadcastHandle::disconnected());

        let reminders = task(
            "reminders:pending",
            TaskAction::Dispatch { kinds: vec![NotificationKind::Reminder] },
        );
        p.run_task(&reminders).await.unwrap();
        assert_eq!(p.queue().stats().unwrap().queued, 3);

        p.run_task(&task("queue:drain", TaskAction::DrainQueue)).await.unwrap();
        assert_eq!(mailer.sent_to(), vec!["hoa@acme.test", "minh@acme.test"]);
        assert_eq!(mailer.attempts_for("tuan@acme.test"), 3);

        let failed = p.queue().failed_jobs().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].email, "tuan@acme.test");
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].kind, "reminder");

        // Second run the same day queues nothing new.
        p.run_task(&reminders).await.unwrap();
        assert_eq!(p.queue().stats().unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_prune_failed_uses_retention() {
        let mailer = Arc::new(RecordingMailer::default());
        mailer.fail("minh@acme.test", MailError::Permanent("550 unknown user".into()));
        let p = pipeline(mailer, BroadcastHandle::disconnected());
        p.dispatch(&[NotificationKind::Reminder], Utc::now()).await.unwrap();
        p.drain().await.unwrap();
        assert_eq!(p.queue().failed_jobs().unwrap().len(), 1);

        assert_eq!(p.prune_failed(Utc::now()).unwrap(), 0);
        assert_eq!(p.prune_failed(Utc::now() + Duration::days(8)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clock_in_reaches_attendance_channel() {
        let hub = Arc::new(Broadcaster::new(&config().broadcast));
        let mut sub = hub.subscribe(&Subscriber::new(Some(99), &["hr"]), "attendance").unwrap();
        let (handle, _task) = hub.clone().start();
        let p = pipeline(Arc::new(RecordingMailer::default()), handle);

        let source = hr_source();
        let record = source.clock_in(1, Utc::now()).unwrap();
        p.clocked_in(&record);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "attendance.clocked_in");
    }

    #[test]
    fn test_from_config_rejects_bad_trigger() {
        let dir = std::env::temp_dir().join("rosterbell-bad-trigger");
        let mut config = config();
        config.database.path = dir.join("hr.db").to_string_lossy().into_owned();
        config.scheduler.tasks[0].trigger = "weekly funday 08:00".into();

        let err = NotificationPipeline::from_config(&config, BroadcastHandle::disconnected())
            .err()
            .unwrap();
        assert!(err.to_string().contains("funday"));
        assert!(!dir.join("hr.db").exists());
    }

    #[tokio::test]
    async fn test_handler_drives_default_tasks() {
        let mailer = Arc::new(RecordingMailer::default());
        let p = pipeline(mailer.clone(), BroadcastHandle::disconnected());
        let section = rosterbell_core::config::SchedulerSection {
            tick_secs: 1,
            tasks: default_tasks(),
        };
        let scheduler = SchedulerConfig::from_config(&section).unwrap();
        let reminders = scheduler
            .tasks
            .iter()
            .find(|t| t.name == "reminders:pending")
            .unwrap()
            .clone();

        // every 4h: 08:00 is due after 07:59:30.
        let start = Utc::now()
            .date_naive()
            .and_hms_opt(7, 59, 30)
            .unwrap()
            .and_utc();
        let mut engine = SchedulerEngine::starting_at(
            SchedulerConfig::new(1, vec![reminders]).unwrap(),
            p.handler(),
            start,
        );
        engine.tick(start + Duration::seconds(30)).await;
        engine.wait_idle().await;
        assert_eq!(p.queue().stats().unwrap().queued, 3);
    }
}
