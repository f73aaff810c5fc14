//! Dispatch: turns due-sets into queued jobs, one per recipient and kind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use rosterbell_core::config::QueueConfig;
use rosterbell_core::error::Result;
use rosterbell_core::types::{NotificationKind, Snapshot};

use crate::queue::{EnqueueOutcome, JobQueue, NotificationJob};
use crate::records::{DueNotice, DueSource};

/// What one dispatch pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub kind: NotificationKind,
    pub due: usize,
    pub enqueued: usize,
    /// Already notified today.
    pub skipped: usize,
}

pub struct Dispatcher {
    source: Arc<dyn DueSource>,
    queue: Arc<JobQueue>,
    limits: QueueConfig,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn DueSource>, queue: Arc<JobQueue>, limits: QueueConfig) -> Self {
        Self { source, queue, limits }
    }

    /// Compute the due-set for `kind` and enqueue a job for each recipient
    /// not yet notified for that kind today.
    pub async fn dispatch(
        &self,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport> {
        let due = self.source.due(kind, now).await?;
        let mut report = DispatchReport {
            kind,
            due: due.len(),
            enqueued: 0,
            skipped: 0,
        };

        for notice in due {
            let job = self.job_for(notice);
            match self.queue.enqueue_unless_notified(&job, now)? {
                EnqueueOutcome::Enqueued => {
                    tracing::debug!("📥 Queued {} for {}", kind, job.recipient.email);
                    report.enqueued += 1;
                }
                EnqueueOutcome::AlreadyNotified => {
                    tracing::debug!("⏭️ {} already notified today ({})", job.recipient.email, kind);
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            "📨 Dispatch {}: {} due, {} queued, {} skipped",
            kind,
            report.due,
            report.enqueued,
            report.skipped
        );
        Ok(report)
    }

    /// Dispatch several kinds in order. Stops at the first failing kind.
    pub async fn dispatch_all(
        &self,
        kinds: &[NotificationKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchReport>> {
        let mut reports = Vec::with_capacity(kinds.len());
        for kind in kinds {
            reports.push(self.dispatch(*kind, now).await?);
        }
        Ok(reports)
    }

    fn job_for(&self, notice: DueNotice) -> NotificationJob {
        let DueNotice { recipient, kind, mut payload } = notice;
        payload.merge_prefixed("recipient_", &recipient.snapshot());
        NotificationJob::new(recipient, kind, payload, &self.limits)
    }
}
