//! Delivery workers: claim a job, render it, send it, settle it.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use rosterbell_core::config::QueueConfig;
use rosterbell_core::error::Result;

use crate::broadcast::{BroadcastEvent, BroadcastHandle};
use crate::mailer::{MailError, Mailer, OutgoingMail};
use crate::queue::{JobQueue, NotificationJob, retry_at};
use crate::templates::TemplateRegistry;

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { message_id: Option<String> },
    /// Requeued for another attempt.
    Retried { error: String },
    /// Dead-lettered.
    Failed { error: String },
}

/// Totals from one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub recovered: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered { .. } => self.delivered += 1,
            DeliveryOutcome::Retried { .. } => self.retried += 1,
            DeliveryOutcome::Failed { .. } => self.failed += 1,
        }
    }

    fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

/// Everything a worker needs; shared by all workers of a pool.
#[derive(Clone)]
pub struct DeliveryWorker {
    queue: Arc<JobQueue>,
    mailer: Arc<dyn Mailer>,
    templates: Arc<TemplateRegistry>,
    broadcast: BroadcastHandle,
    retry_backoff_secs: u64,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<JobQueue>,
        mailer: Arc<dyn Mailer>,
        templates: Arc<TemplateRegistry>,
        broadcast: BroadcastHandle,
        retry_backoff_secs: u64,
    ) -> Self {
        Self {
            queue,
            mailer,
            templates,
            broadcast,
            retry_backoff_secs,
        }
    }

    /// Run one claimed job to its next state.
    pub async fn process(&self, job: NotificationJob) -> Result<DeliveryOutcome> {
        let result = match self.templates.render(&job.template, &job.payload) {
            Ok(message) => {
                let mail = OutgoingMail {
                    to: job.recipient.email.clone(),
                    to_name: job.recipient.name.clone(),
                    subject: message.subject,
                    body: message.body,
                    kind: job.kind,
                };
                let limit = Duration::from_secs(job.timeout_secs);
                match tokio::time::timeout(limit, self.mailer.send(&mail)).await {
                    Ok(sent) => sent,
                    Err(_) => Err(MailError::Transient(format!(
                        "send timed out after {}s",
                        job.timeout_secs
                    ))),
                }
            }
            Err(e) => Err(MailError::Permanent(e.to_string())),
        };

        let now = Utc::now();
        match result {
            Ok(receipt) => {
                self.queue.complete(&job, &receipt, now)?;
                tracing::info!(
                    job_id = %job.id,
                    recipient = %job.recipient.email,
                    kind = %job.kind,
                    message_id = receipt.message_id.as_deref().unwrap_or("-"),
                    "✅ Notification sent"
                );
                self.broadcast
                    .publish(BroadcastEvent::notification_sent(&job, &receipt));
                Ok(DeliveryOutcome::Delivered {
                    message_id: receipt.message_id,
                })
            }
            Err(e) if !e.is_permanent() && job.has_attempts_left() => {
                let error = e.to_string();
                self.queue
                    .release_for_retry(&job, &error, retry_at(now, self.retry_backoff_secs))?;
                tracing::warn!(
                    "🔁 {} to {} failed (attempt {}/{}): {error}",
                    job.kind,
                    job.recipient.email,
                    job.attempts,
                    job.max_attempts
                );
                Ok(DeliveryOutcome::Retried { error })
            }
            Err(e) => {
                let error = e.to_string();
                self.queue.fail(&job, &error, now)?;
                tracing::error!(
                    job_id = %job.id,
                    recipient = %job.recipient.email,
                    kind = %job.kind,
                    attempts = job.attempts,
                    error = %error,
                    "❌ Notification permanently failed"
                );
                Ok(DeliveryOutcome::Failed { error })
            }
        }
    }

    /// Claim and process until nothing is claimable.
    async fn run(self, name: String) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        while let Some(job) = self.queue.claim(&name, Utc::now())? {
            let outcome = self.process(job).await?;
            report.record(&outcome);
        }
        Ok(report)
    }
}

/// A fixed number of concurrent workers over one queue.
pub struct WorkerPool {
    worker: DeliveryWorker,
    workers: usize,
}

impl WorkerPool {
    pub fn new(worker: DeliveryWorker, config: &QueueConfig) -> Self {
        Self {
            worker,
            workers: config.workers.max(1),
        }
    }

    /// Recover stale jobs, then run every worker until the queue has nothing
    /// claimable. Jobs waiting on a future retry time are left for a later drain.
    pub async fn drain(&self) -> Result<DrainReport> {
        let recovered = self.worker.queue.recover_stale(Utc::now())?;
        if recovered > 0 {
            tracing::warn!("♻️ Recovered {recovered} stale job(s)");
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "local".to_string());
        let mut set = JoinSet::new();
        for i in 0..self.workers {
            let worker = self.worker.clone();
            let name = format!("{host}:{}:{i}", std::process::id());
            set.spawn(worker.run(name));
        }

        let mut report = DrainReport {
            recovered,
            ..DrainReport::default()
        };
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(part)) => report.merge(part),
                Ok(Err(e)) => {
                    tracing::error!("Delivery worker error: {e}");
                    first_err.get_or_insert(e);
                }
                Err(e) => tracing::error!("Delivery worker panicked: {e}"),
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if report.delivered + report.retried + report.failed > 0 {
            tracing::info!(
                "📬 Drain: {} delivered, {} retried, {} failed",
                report.delivered,
                report.retried,
                report.failed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Broadcaster, Subscriber};
    use crate::mailer::SendReceipt;
    use crate::mailer::testing::RecordingMailer;
    use async_trait::async_trait;
    use rosterbell_core::config::BroadcastConfig;
    use rosterbell_core::types::{NotificationKind, Payload, Recipient};

    fn limits() -> QueueConfig {
        QueueConfig {
            workers: 2,
            max_attempts: 3,
            timeout_secs: 1,
            retry_backoff_secs: 0,
            ..QueueConfig::default()
        }
    }

    fn reminder(id: i64, email: &str) -> NotificationJob {
        NotificationJob::new(
            Recipient::new(id, email, "Minh"),
            NotificationKind::Reminder,
            Payload::new()
                .with("recipient_name", "Minh")
                .with("pending_count", 2i64)
                .with("items", "- Lan: 2026-03-10 → 2026-03-12"),
            &limits(),
        )
    }

    fn pool(
        queue: Arc<JobQueue>,
        mailer: Arc<dyn Mailer>,
        broadcast: BroadcastHandle,
    ) -> WorkerPool {
        let worker = DeliveryWorker::new(
            queue,
            mailer,
            Arc::new(TemplateRegistry::builtin()),
            broadcast,
            limits().retry_backoff_secs,
        );
        WorkerPool::new(worker, &limits())
    }

    #[tokio::test]
    async fn test_drain_sends_and_logs() {
        let queue = Arc::new(JobQueue::open_in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        queue.enqueue(&reminder(1, "a@acme.test"), Utc::now()).unwrap();
        queue.enqueue(&reminder(2, "b@acme.test"), Utc::now()).unwrap();

        let report = pool(queue.clone(), mailer.clone(), BroadcastHandle::disconnected())
            .drain()
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(mailer.sent_to(), vec!["a@acme.test", "b@acme.test"]);
        let subject = mailer.sent.lock().unwrap()[0].subject.clone();
        assert_eq!(subject, "You have 2 leave request(s) awaiting approval");

        let log = queue.delivery_log(10).unwrap();
        assert!(log.iter().all(|r| r.status == "sent" && r.message_id.is_some()));
        assert_eq!(queue.stats().unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_to_ceiling() {
        let queue = Arc::new(JobQueue::open_in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        mailer.fail("down@acme.test", MailError::Transient("421 try later".into()));
        queue.enqueue(&reminder(1, "down@acme.test"), Utc::now()).unwrap();

        let report = pool(queue.clone(), mailer.clone(), BroadcastHandle::disconnected())
            .drain()
            .await
            .unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(mailer.attempts_for("down@acme.test"), 3);

        let failed = queue.failed_jobs().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert!(failed[0].error.contains("421"));
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let queue = Arc::new(JobQueue::open_in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        mailer.fail("gone@acme.test", MailError::Permanent("550 no such user".into()));
        queue.enqueue(&reminder(1, "gone@acme.test"), Utc::now()).unwrap();

        let report = pool(queue.clone(), mailer.clone(), BroadcastHandle::disconnected())
            .drain()
            .await
            .unwrap();
        assert_eq!(report, DrainReport { failed: 1, ..DrainReport::default() });
        assert_eq!(mailer.attempts_for("gone@acme.test"), 1);
    }

    #[tokio::test]
    async fn test_render_error_is_permanent() {
        let queue = Arc::new(JobQueue::open_in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        let job = reminder(1, "a@acme.test").with_template("no-such-template");
        queue.enqueue(&job, Utc::now()).unwrap();

        let report = pool(queue.clone(), mailer.clone(), BroadcastHandle::disconnected())
            .drain()
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(mailer.attempts_for("a@acme.test"), 0);
    }

    /// Fails with a transient error for the first `failures` calls, then sends.
    struct FlakyMailer {
        failures: u32,
        calls: std::sync::atomic::AtomicU32,
    }

    impl FlakyMailer {
        fn new(failures: u32) -> Self {
            Self { failures, calls: Default::default() }
        }

        fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<SendReceipt, MailError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(MailError::Transient(format!("421 busy (call {call})")));
            }
            Ok(SendReceipt { message_id: Some(format!("<call-{call}@localhost>")) })
        }
    }

    #[tokio::test]
    async fn test_success_on_later_attempt_stops_retrying() {
        for attempt in 1..=3u32 {
            let queue = Arc::new(JobQueue::open_in_memory().unwrap());
            let mailer = Arc::new(FlakyMailer::new(attempt - 1));
            queue.enqueue(&reminder(1, "minh@acme.test"), Utc::now()).unwrap();

            let report = pool(queue.clone(), mailer.clone(), BroadcastHandle::disconnected())
                .drain()
                .await
                .unwrap();
            assert_eq!(mailer.calls(), attempt, "attempt {attempt}");
            assert_eq!(report.delivered, 1);
            assert_eq!(report.retried, (attempt - 1) as usize);
            assert_eq!(report.failed, 0);

            let log = queue.delivery_log(10).unwrap();
            assert_eq!(log.len(), 1, "attempt {attempt}");
            assert_eq!(log[0].status, "sent");
            assert_eq!(log[0].attempts, attempt);
            assert_eq!(log[0].message_id, Some(format!("<call-{attempt}@localhost>")));
            assert!(queue.failed_jobs().unwrap().is_empty());
            assert_eq!(queue.stats().unwrap().queued, 0);
        }
    }

    struct SlowMailer;

    #[async_trait]
    impl Mailer for SlowMailer {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<SendReceipt, MailError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SendReceipt::default())
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let queue = Arc::new(JobQueue::open_in_memory().unwrap());
        queue.enqueue(&reminder(1, "a@acme.test"), Utc::now()).unwrap();
        let worker = DeliveryWorker::new(
            queue.clone(),
            Arc::new(SlowMailer),
            Arc::new(TemplateRegistry::builtin()),
            BroadcastHandle::disconnected(),
            0,
        );

        let job = queue.claim("w", Utc::now()).unwrap().unwrap();
        let outcome = worker.process(job).await.unwrap();
        match outcome {
            DeliveryOutcome::Retried { error } => assert!(error.contains("timed out")),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_publishes_to_recipient_channel() {
        let hub = Arc::new(Broadcaster::new(&BroadcastConfig::default()));
        let mut sub = hub.subscribe(&Subscriber::new(Some(42), &[]), "employee.42").unwrap();
        let (handle, _task) = hub.clone().start();

        let queue = Arc::new(JobQueue::open_in_memory().unwrap());
        queue.enqueue(&reminder(42, "minh@acme.test"), Utc::now()).unwrap();
        pool(queue, Arc::new(RecordingMailer::default()), handle)
            .drain()
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "notification.sent");
        assert_eq!(
            event.payload.get("message_id").map(|v| v.to_string()),
            Some("<test-minh@acme.test@localhost>".to_string())
        );
    }
}
