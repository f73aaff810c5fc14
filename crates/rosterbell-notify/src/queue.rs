//! SQLite-backed delivery queue, dedupe log, dead-letter table and delivery log.
//! Survives restarts; claim is a single `UPDATE … RETURNING` so at most one
//! worker ever holds a given job.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use rosterbell_core::config::QueueConfig;
use rosterbell_core::error::{Result, RosterbellError};
use rosterbell_core::types::{NotificationKind, Payload, Recipient};

use crate::mailer::SendReceipt;

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> RosterbellError + '_ {
    move |e| RosterbellError::Database(format!("{context}: {e}"))
}

fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// One message to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: String,
    pub recipient: Recipient,
    pub kind: NotificationKind,
    /// Message template identifier.
    pub template: String,
    pub payload: Payload,
    /// Attempts made so far, including the one in progress once claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    /// New job using the kind's default template and the queue's limits.
    pub fn new(
        recipient: Recipient,
        kind: NotificationKind,
        payload: Payload,
        limits: &QueueConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient,
            kind,
            template: kind.as_str().to_string(),
            payload,
            attempts: 0,
            max_attempts: limits.max_attempts.max(1),
            timeout_secs: limits.timeout_secs.max(1),
            created_at: Utc::now(),
        }
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = template.to_string();
        self
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Result of a deduplicated enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Same recipient and kind already notified on this UTC day.
    AlreadyNotified,
}

/// Dead-letter record.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub job_id: String,
    pub email: String,
    pub kind: String,
    pub template: String,
    pub payload: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Structured terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryRecord {
    pub job_id: String,
    pub email: String,
    pub kind: String,
    /// `sent` or `failed`.
    pub status: String,
    pub attempts: u32,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

/// Queue counters for status output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub failed: usize,
    pub sent: usize,
}

/// SQLite-backed durable job queue.
pub struct JobQueue {
    conn: Mutex<Connection>,
}

impl JobQueue {
    /// Open or create the queue database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("Queue open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(db_err("Queue WAL"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory queue.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Queue open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("Queue busy timeout"))?;
        let queue = Self { conn: Mutex::new(conn) };
        queue.migrate()?;
        Ok(queue)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "
            -- Pending and in-flight delivery jobs
            CREATE TABLE IF NOT EXISTS notification_jobs (
                id TEXT PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                email TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                template TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',   -- flat JSON object
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                timeout_secs INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued', -- queued, running
                available_at INTEGER NOT NULL,         -- unix seconds
                claimed_by TEXT,
                claimed_at INTEGER,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
                ON notification_jobs (status, available_at);

            -- Last-notified timestamp per (recipient, kind)
            CREATE TABLE IF NOT EXISTS notification_log (
                email TEXT NOT NULL,
                kind TEXT NOT NULL,
                last_notified_at INTEGER NOT NULL,
                PRIMARY KEY (email, kind)
            );

            -- Dead-letter records
            CREATE TABLE IF NOT EXISTS failed_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                employee_id INTEGER NOT NULL,
                email TEXT NOT NULL,
                kind TEXT NOT NULL,
                template TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            );

            -- Terminal outcome per job
            CREATE TABLE IF NOT EXISTS delivery_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                email TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,                  -- sent, failed
                attempts INTEGER NOT NULL,
                message_id TEXT,
                error TEXT,
                recorded_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Enqueue ──────────────────────────────────────────────

    /// Enqueue without dedupe.
    pub fn enqueue(&self, job: &NotificationJob, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        insert_job(&conn, job, now)
    }

    /// Enqueue unless the recipient already got this kind today (UTC).
    /// Check, insert and mark happen in one transaction.
    pub fn enqueue_unless_notified(
        &self,
        job: &NotificationJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err("Begin enqueue"))?;

        let last: Option<i64> = tx
            .query_row(
                "SELECT last_notified_at FROM notification_log WHERE email = ?1 AND kind = ?2",
                rusqlite::params![job.recipient.email, job.kind.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Read notification log"))?;

        if last.is_some_and(|last| from_ts(last).date_naive() == now.date_naive()) {
            return Ok(EnqueueOutcome::AlreadyNotified);
        }

        insert_job(&tx, job, now)?;
        tx.execute(
            "INSERT INTO notification_log (email, kind, last_notified_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (email, kind) DO UPDATE SET last_notified_at = excluded.last_notified_at",
            rusqlite::params![job.recipient.email, job.kind.as_str(), to_ts(now)],
        )
        .map_err(db_err("Mark notified"))?;

        tx.commit().map_err(db_err("Commit enqueue"))?;
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Last time `email` was notified with `kind`.
    pub fn last_notified(
        &self,
        email: &str,
        kind: NotificationKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<i64> = self
            .lock()
            .query_row(
                "SELECT last_notified_at FROM notification_log WHERE email = ?1 AND kind = ?2",
                rusqlite::params![email, kind.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Read notification log"))?;
        Ok(ts.map(from_ts))
    }

    // ─── Claim & settle ───────────────────────────────────────

    /// Atomically claim the oldest available job and count the attempt.
    pub fn claim(&self, worker: &str, now: DateTime<Utc>) -> Result<Option<NotificationJob>> {
        self.lock()
            .query_row(
                "UPDATE notification_jobs
                 SET status = 'running', attempts = attempts + 1, claimed_by = ?1, claimed_at = ?2
                 WHERE id = (
                     SELECT id FROM notification_jobs
                     WHERE status = 'queued' AND available_at <= ?2
                     ORDER BY available_at, rowid
                     LIMIT 1
                 )
                 RETURNING id, employee_id, email, name, kind, template, payload,
                           attempts, max_attempts, timeout_secs, created_at",
                rusqlite::params![worker, to_ts(now)],
                row_to_job,
            )
            .optional()
            .map_err(db_err("Claim job"))
    }

    /// Successful send: drop the job and write a `sent` delivery record.
    pub fn complete(
        &self,
        job: &NotificationJob,
        receipt: &SendReceipt,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err("Begin complete"))?;
        tx.execute("DELETE FROM notification_jobs WHERE id = ?1", [&job.id])
            .map_err(db_err("Delete job"))?;
        insert_delivery(&tx, job, "sent", receipt.message_id.as_deref(), None, now)?;
        tx.commit().map_err(db_err("Commit complete"))?;
        Ok(())
    }

    /// Transient failure: put the job back for another attempt at `available_at`.
    pub fn release_for_retry(
        &self,
        job: &NotificationJob,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE notification_jobs
                 SET status = 'queued', claimed_by = NULL, claimed_at = NULL,
                     last_error = ?2, available_at = ?3
                 WHERE id = ?1",
                rusqlite::params![job.id, error, to_ts(available_at)],
            )
            .map_err(db_err("Release job"))?;
        Ok(())
    }

    /// Terminal failure: move the job to the dead-letter table.
    pub fn fail(&self, job: &NotificationJob, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err("Begin fail"))?;
        tx.execute("DELETE FROM notification_jobs WHERE id = ?1", [&job.id])
            .map_err(db_err("Delete job"))?;
        tx.execute(
            "INSERT INTO failed_jobs
             (job_id, employee_id, email, kind, template, payload, attempts, error, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                job.id,
                job.recipient.employee_id,
                job.recipient.email,
                job.kind.as_str(),
                job.template,
                job.payload.to_json(),
                job.attempts,
                error,
                to_ts(now),
            ],
        )
        .map_err(db_err("Insert failed job"))?;
        insert_delivery(&tx, job, "failed", None, Some(error), now)?;
        tx.commit().map_err(db_err("Commit fail"))?;
        Ok(())
    }

    /// Return jobs abandoned by a crashed worker (claimed for longer than twice
    /// their timeout). Exhausted ones are dead-lettered instead.
    /// Rows that no longer decode are dead-lettered as they are.
    pub fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<(String, rusqlite::Result<NotificationJob>)> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id, employee_id, email, name, kind, template, payload,
                            attempts, max_attempts, timeout_secs, created_at
                     FROM notification_jobs
                     WHERE status = 'running' AND claimed_at + timeout_secs * 2 < ?1",
                )
                .map_err(db_err("Find stale jobs"))?;
            stmt.query_map([to_ts(now)], |row| Ok((row.get(0)?, row_to_job(row))))
                .map_err(db_err("Find stale jobs"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Find stale jobs"))?
        };

        for (id, decoded) in &stale {
            match decoded {
                Ok(job) if job.has_attempts_left() => {
                    tracing::warn!(
                        "♻️ Requeueing abandoned job {} for {}",
                        job.id,
                        job.recipient.email
                    );
                    self.release_for_retry(job, "worker lost", now)?;
                }
                Ok(job) => self.fail(job, "worker lost after final attempt", now)?,
                Err(e) => {
                    tracing::error!("❌ Stale job {id} is unreadable, dead-lettering: {e}");
                    self.fail_raw(id, &format!("unreadable job: {e}"), now)?;
                }
            }
        }
        Ok(stale.len())
    }

    /// Dead-letter a job straight from its stored columns.
    fn fail_raw(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err("Begin fail"))?;
        tx.execute(
            "INSERT INTO failed_jobs
             (job_id, employee_id, email, kind, template, payload, attempts, error, failed_at)
             SELECT id, employee_id, email, kind, template, payload, attempts, ?2, ?3
             FROM notification_jobs WHERE id = ?1",
            rusqlite::params![id, error, to_ts(now)],
        )
        .map_err(db_err("Insert failed job"))?;
        tx.execute(
            "INSERT INTO delivery_log (job_id, email, kind, status, attempts, message_id, error, recorded_at)
             SELECT id, email, kind, 'failed', attempts, NULL, ?2, ?3
             FROM notification_jobs WHERE id = ?1",
            rusqlite::params![id, error, now.to_rfc3339()],
        )
        .map_err(db_err("Insert delivery record"))?;
        tx.execute("DELETE FROM notification_jobs WHERE id = ?1", [id])
            .map_err(db_err("Delete job"))?;
        tx.commit().map_err(db_err("Commit fail"))?;
        Ok(())
    }

    // ─── Dead-letter maintenance & inspection ─────────────────

    /// Delete dead-letter records older than `before`.
    pub fn prune_failed(&self, before: DateTime<Utc>) -> Result<usize> {
        self.lock()
            .execute("DELETE FROM failed_jobs WHERE failed_at < ?1", [to_ts(before)])
            .map_err(db_err("Prune failed jobs"))
    }

    pub fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT job_id, email, kind, template, payload, attempts, error, failed_at
                 FROM failed_jobs ORDER BY id",
            )
            .map_err(db_err("List failed jobs"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FailedJob {
                    job_id: row.get(0)?,
                    email: row.get(1)?,
                    kind: row.get(2)?,
                    template: row.get(3)?,
                    payload: row.get(4)?,
                    attempts: row.get(5)?,
                    error: row.get(6)?,
                    failed_at: from_ts(row.get(7)?),
                })
            })
            .map_err(db_err("List failed jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List failed jobs"))
    }

    /// Most recent delivery records first.
    pub fn delivery_log(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT job_id, email, kind, status, attempts, message_id, error
                 FROM delivery_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err("Read delivery log"))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(DeliveryRecord {
                    job_id: row.get(0)?,
                    email: row.get(1)?,
                    kind: row.get(2)?,
                    status: row.get(3)?,
                    attempts: row.get(4)?,
                    message_id: row.get(5)?,
                    error: row.get(6)?,
                })
            })
            .map_err(db_err("Read delivery log"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read delivery log"))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<usize> {
            conn.query_row(sql, [], |r| r.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(db_err("Queue stats"))
        };
        Ok(QueueStats {
            queued: count("SELECT COUNT(*) FROM notification_jobs WHERE status = 'queued'")?,
            running: count("SELECT COUNT(*) FROM notification_jobs WHERE status = 'running'")?,
            failed: count("SELECT COUNT(*) FROM failed_jobs")?,
            sent: count("SELECT COUNT(*) FROM delivery_log WHERE status = 'sent'")?,
        })
    }
}

fn insert_job(conn: &Connection, job: &NotificationJob, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO notification_jobs
         (id, employee_id, email, name, kind, template, payload, attempts, max_attempts,
          timeout_secs, status, available_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'queued', ?11, ?12)",
        rusqlite::params![
            job.id,
            job.recipient.employee_id,
            job.recipient.email,
            job.recipient.name,
            job.kind.as_str(),
            job.template,
            job.payload.to_json(),
            job.attempts,
            job.max_attempts,
            job.timeout_secs as i64,
            to_ts(now),
            job.created_at.to_rfc3339(),
        ],
    )
    .map_err(db_err("Insert job"))?;
    Ok(())
}

fn insert_delivery(
    conn: &Connection,
    job: &NotificationJob,
    status: &str,
    message_id: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO delivery_log (job_id, email, kind, status, attempts, message_id, error, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            job.id,
            job.recipient.email,
            job.kind.as_str(),
            status,
            job.attempts,
            message_id,
            error,
            now.to_rfc3339(),
        ],
    )
    .map_err(db_err("Insert delivery record"))?;
    Ok(())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationJob> {
    let kind_str: String = row.get(4)?;
    let payload_str: String = row.get(6)?;
    let created_at_str: String = row.get(10)?;

    let kind = kind_str.parse().map_err(|e: RosterbellError| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(NotificationJob {
        id: row.get(0)?,
        recipient: Recipient {
            employee_id: row.get(1)?,
            email: row.get(2)?,
            name: row.get(3)?,
        },
        kind,
        template: row.get(5)?,
        payload: Payload::from_json(&payload_str).unwrap_or_default(),
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        timeout_secs: row.get::<_, i64>(9)? as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Delay before a retried job becomes claimable again.
pub fn retry_at(now: DateTime<Utc>, backoff_secs: u64) -> DateTime<Utc> {
    now + Duration::seconds(backoff_secs as i64)
}
