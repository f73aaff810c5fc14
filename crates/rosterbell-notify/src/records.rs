//! HR read model and the due-set queries behind each notification kind.
//!
//! The HR application owns these tables; the notifier only reads them. They
//! are created if absent so the notifier can also run against a fresh file.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rosterbell_core::config::PolicyConfig;
use rosterbell_core::error::{Result, RosterbellError};
use rosterbell_core::types::{NotificationKind, Payload, Recipient, Snapshot};

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> RosterbellError + '_ {
    move |e| RosterbellError::Database(format!("{context}: {e}"))
}

// ─── Records ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
    pub manager_id: Option<i64>,
    pub active: bool,
}

impl Employee {
    pub fn recipient(&self) -> Recipient {
        Recipient::new(self.id, &self.email, &self.name)
    }
}

impl Snapshot for Employee {
    fn snapshot(&self) -> Payload {
        Payload::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
            .with("email", self.email.as_str())
            .with("role", self.role.as_str())
            .with("manager_id", self.manager_id)
            .with("active", self.active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
}

impl LeaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveStatus::Pending => "pending",
            LeaveStatus::Approved => "approved",
            LeaveStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveRequest {
    pub id: i64,
    pub employee_id: i64,
    pub approver_id: Option<i64>,
    pub status: LeaveStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Snapshot for LeaveRequest {
    fn snapshot(&self) -> Payload {
        Payload::new()
            .with("id", self.id)
            .with("employee_id", self.employee_id)
            .with("approver_id", self.approver_id)
            .with("status", self.status.as_str())
            .with("start_date", self.start_date.to_string())
            .with("end_date", self.end_date.to_string())
            .with("created_at", self.created_at.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimesheetStatus {
    Draft,
    Submitted,
    Approved,
}

impl TimesheetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimesheetStatus::Draft => "draft",
            TimesheetStatus::Submitted => "submitted",
            TimesheetStatus::Approved => "approved",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timesheet {
    pub id: i64,
    pub employee_id: i64,
    pub period_end: NaiveDate,
    pub status: TimesheetStatus,
}

impl Snapshot for Timesheet {
    fn snapshot(&self) -> Payload {
        Payload::new()
            .with("id", self.id)
            .with("employee_id", self.employee_id)
            .with("period_end", self.period_end.to_string())
            .with("status", self.status.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub id: i64,
    pub employee_id: i64,
    pub clock_in: DateTime<Utc>,
    pub clock_out: Option<DateTime<Utc>>,
}

impl Snapshot for AttendanceRecord {
    fn snapshot(&self) -> Payload {
        Payload::new()
            .with("id", self.id)
            .with("employee_id", self.employee_id)
            .with("clock_in", self.clock_in.to_rfc3339())
            .with("clock_out", self.clock_out.map(|t| t.to_rfc3339()))
    }
}

// ─── Due-set contract ─────────────────────────────────────────

/// One (recipient, kind) pair that is due, with its message payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DueNotice {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub payload: Payload,
}

/// Computes who is due for a notification kind right now.
#[async_trait]
pub trait DueSource: Send + Sync {
    async fn due(&self, kind: NotificationKind, now: DateTime<Utc>) -> Result<Vec<DueNotice>>;
}

// ─── SQLite implementation ────────────────────────────────────

/// Due-set queries over the HR tables.
pub struct SqliteDueSource {
    conn: Mutex<Connection>,
    policy: PolicyConfig,
    /// Roles that receive the weekly organisation digest.
    digest_roles: Vec<String>,
}

/// Pending leave row joined with its approver and requester.
struct PendingLeave {
    approver: Employee,
    requester_name: String,
    start_date: String,
    end_date: String,
    created_at: i64,
}

/// Overdue draft timesheet joined with its owner.
struct OverdueTimesheet {
    owner: Employee,
    manager_id: Option<i64>,
    period_end: String,
}

impl SqliteDueSource {
    pub fn open(path: &Path, policy: PolicyConfig, digest_roles: Vec<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("HR db open"))?;
        Self::with_connection(conn, policy, digest_roles)
    }

    pub fn open_in_memory(policy: PolicyConfig, digest_roles: Vec<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("HR db open"))?;
        Self::with_connection(conn, policy, digest_roles)
    }

    fn with_connection(
        conn: Connection,
        policy: PolicyConfig,
        digest_roles: Vec<String>,
    ) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("HR db busy timeout"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS employees (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'employee',
                manager_id INTEGER,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS leave_requests (
                id INTEGER PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                approver_id INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                decided_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS timesheets (
                id INTEGER PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                period_end TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft'
            );
            CREATE TABLE IF NOT EXISTS attendance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                employee_id INTEGER NOT NULL,
                clock_in INTEGER NOT NULL,
                clock_out INTEGER
            );",
        )
        .map_err(db_err("HR schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
            policy,
            digest_roles,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Writes (seeding / state changes) ─────────────────────

    pub fn upsert_employee(&self, e: &Employee) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO employees (id, name, email, role, manager_id, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![e.id, e.name, e.email, e.role, e.manager_id, e.active as i32],
            )
            .map_err(db_err("Save employee"))?;
        Ok(())
    }

    pub fn upsert_leave_request(&self, l: &LeaveRequest) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO leave_requests
                 (id, employee_id, approver_id, status, start_date, end_date, created_at, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    l.id,
                    l.employee_id,
                    l.approver_id,
                    l.status.as_str(),
                    l.start_date.to_string(),
                    l.end_date.to_string(),
                    l.created_at.timestamp(),
                    l.decided_at.map(|t| t.timestamp()),
                ],
            )
            .map_err(db_err("Save leave request"))?;
        Ok(())
    }

    pub fn upsert_timesheet(&self, t: &Timesheet) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO timesheets (id, employee_id, period_end, status)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![t.id, t.employee_id, t.period_end.to_string(), t.status.as_str()],
            )
            .map_err(db_err("Save timesheet"))?;
        Ok(())
    }

    /// Record an attendance clock-in and return the stored row.
    pub fn clock_in(&self, employee_id: i64, at: DateTime<Utc>) -> Result<AttendanceRecord> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attendance (employee_id, clock_in) VALUES (?1, ?2)",
            rusqlite::params![employee_id, at.timestamp()],
        )
        .map_err(db_err("Clock in"))?;
        Ok(AttendanceRecord {
            id: conn.last_insert_rowid(),
            employee_id,
            clock_in: at,
            clock_out: None,
        })
    }

    // ─── Reads ────────────────────────────────────────────────

    fn active_employees(&self) -> Result<Vec<Employee>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, email, role, manager_id, active
                 FROM employees WHERE active = 1 ORDER BY id",
            )
            .map_err(db_err("List employees"))?;
        let rows = stmt
            .query_map([], |row| row_to_employee(row, 0))
            .map_err(db_err("List employees"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List employees"))
    }

    /// Pending leave requests created at or before `created_before`, with active approvers.
    fn pending_leaves(&self, created_before: DateTime<Utc>) -> Result<Vec<PendingLeave>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.name, a.email, a.role, a.manager_id, a.active,
                        e.name, l.start_date, l.end_date, l.created_at
                 FROM leave_requests l
                 JOIN employees a ON a.id = l.approver_id
                 JOIN employees e ON e.id = l.employee_id
                 WHERE l.status = 'pending' AND a.active = 1 AND l.created_at <= ?1
                 ORDER BY a.id, l.created_at, l.id",
            )
            .map_err(db_err("Pending leave query"))?;
        let rows = stmt
            .query_map([created_before.timestamp()], |row| {
                Ok(PendingLeave {
                    approver: row_to_employee(row, 0)?,
                    requester_name: row.get(6)?,
                    start_date: row.get(7)?,
                    end_date: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .map_err(db_err("Pending leave query"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Pending leave query"))
    }

    /// Draft timesheets whose period ended before `today`.
    fn overdue_timesheets(&self, today: NaiveDate) -> Result<Vec<OverdueTimesheet>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT e.id, e.name, e.email, e.role, e.manager_id, e.active, t.period_end
                 FROM timesheets t
                 JOIN employees e ON e.id = t.employee_id
                 WHERE t.status = 'draft' AND e.active = 1 AND t.period_end < ?1
                 ORDER BY e.id, t.period_end",
            )
            .map_err(db_err("Overdue timesheet query"))?;
        let rows = stmt
            .query_map([today.to_string()], |row| {
                let owner = row_to_employee(row, 0)?;
                Ok(OverdueTimesheet {
                    manager_id: owner.manager_id,
                    owner,
                    period_end: row.get(6)?,
                })
            })
            .map_err(db_err("Overdue timesheet query"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Overdue timesheet query"))
    }

    fn approved_since(&self, since: DateTime<Utc>) -> Result<usize> {
        self.lock()
            .query_row(
                "SELECT COUNT(*) FROM leave_requests WHERE status = 'approved' AND decided_at >= ?1",
                [since.timestamp()],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err("Approved leave count"))
    }

    // ─── Policies ─────────────────────────────────────────────

    fn reminders(&self, now: DateTime<Utc>) -> Result<Vec<DueNotice>> {
        let cutoff = now - Duration::hours(self.policy.reminder_min_age_hours as i64);
        let mut by_approver: BTreeMap<i64, (Employee, Vec<String>)> = BTreeMap::new();
        for leave in self.pending_leaves(cutoff)? {
            let line = leave_line(&leave);
            by_approver
                .entry(leave.approver.id)
                .or_insert_with(|| (leave.approver, Vec::new()))
                .1
                .push(line);
        }

        Ok(by_approver
            .into_values()
            .map(|(approver, lines)| DueNotice {
                recipient: approver.recipient(),
                kind: NotificationKind::Reminder,
                payload: Payload::new()
                    .with("pending_count", lines.len())
                    .with("items", lines.join("\n")),
            })
            .collect())
    }

    fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<DueNotice>> {
        let mut by_owner: BTreeMap<i64, (Employee, Vec<String>)> = BTreeMap::new();
        for ts in self.overdue_timesheets(now.date_naive())? {
            let line = format!("- period ending {}", ts.period_end);
            by_owner
                .entry(ts.owner.id)
                .or_insert_with(|| (ts.owner, Vec::new()))
                .1
                .push(line);
        }

        Ok(by_owner
            .into_values()
            .map(|(owner, lines)| DueNotice {
                recipient: owner.recipient(),
                kind: NotificationKind::Overdue,
                payload: Payload::new()
                    .with("overdue_count", lines.len())
                    .with("items", lines.join("\n")),
            })
            .collect())
    }

    fn escalations(&self, now: DateTime<Utc>) -> Result<Vec<DueNotice>> {
        let Some(days) = self.policy.escalation_after_days else {
            tracing::debug!("⏭️ Escalations off: policy.escalation_after_days is not set");
            return Ok(Vec::new());
        };
        let cutoff = now - Duration::days(days as i64);
        let stale = self.pending_leaves(cutoff)?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let items: Vec<String> = stale
            .iter()
            .map(|l| format!("{} (approver: {})", leave_line(l), l.approver.name))
            .collect();
        let oldest_days = stale
            .iter()
            .map(|l| (now.timestamp() - l.created_at) / 86_400)
            .max()
            .unwrap_or(0);

        Ok(self
            .active_employees()?
            .into_iter()
            .filter(|e| self.policy.escalation_roles.contains(&e.role))
            .map(|e| DueNotice {
                recipient: e.recipient(),
                kind: NotificationKind::Escalation,
                payload: Payload::new()
                    .with("stale_count", stale.len())
                    .with("threshold_days", days as i64)
                    .with("oldest_days", oldest_days)
                    .with("items", items.join("\n")),
            })
            .collect())
    }

    fn daily_digests(&self, now: DateTime<Utc>) -> Result<Vec<DueNotice>> {
        #[derive(Default)]
        struct Acc {
            approvals: Vec<String>,
            team_overdue: Vec<String>,
        }

        let employees: BTreeMap<i64, Employee> = self
            .active_employees()?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();
        let mut by_manager: BTreeMap<i64, Acc> = BTreeMap::new();

        for leave in self.pending_leaves(now)? {
            let line = leave_line(&leave);
            by_manager.entry(leave.approver.id).or_default().approvals.push(line);
        }
        for ts in self.overdue_timesheets(now.date_naive())? {
            if let Some(manager_id) = ts.manager_id {
                by_manager
                    .entry(manager_id)
                    .or_default()
                    .team_overdue
                    .push(format!("- {}: period ending {}", ts.owner.name, ts.period_end));
            }
        }

        Ok(by_manager
            .into_iter()
            .filter_map(|(manager_id, acc)| {
                let manager = employees.get(&manager_id)?;
                Some(DueNotice {
                    recipient: manager.recipient(),
                    kind: NotificationKind::DigestDaily,
                    payload: Payload::new()
                        .with("date", now.date_naive().to_string())
                        .with("pending_approvals", acc.approvals.len())
                        .with("team_overdue_timesheets", acc.team_overdue.len())
                        .with("approval_items", none_if_empty(&acc.approvals))
                        .with("timesheet_items", none_if_empty(&acc.team_overdue)),
                })
            })
            .collect())
    }

    fn weekly_digests(&self, now: DateTime<Utc>) -> Result<Vec<DueNotice>> {
        let pending = self.pending_leaves(now)?.len();
        let overdue = self.overdue_timesheets(now.date_naive())?.len();
        let approved = self.approved_since(now - Duration::days(7))?;
        let week_start = (now - Duration::days(7)).date_naive();

        Ok(self
            .active_employees()?
            .into_iter()
            .filter(|e| self.digest_roles.contains(&e.role))
            .map(|e| DueNotice {
                recipient: e.recipient(),
                kind: NotificationKind::DigestWeekly,
                payload: Payload::new()
                    .with("week_start", week_start.to_string())
                    .with("week_end", now.date_naive().to_string())
                    .with("pending_leave", pending)
                    .with("overdue_timesheets", overdue)
                    .with("approved_leave", approved),
            })
            .collect())
    }
}

#[async_trait]
impl DueSource for SqliteDueSource {
    async fn due(&self, kind: NotificationKind, now: DateTime<Utc>) -> Result<Vec<DueNotice>> {
        match kind {
            NotificationKind::Reminder => self.reminders(now),
            NotificationKind::Overdue => self.overdue(now),
            NotificationKind::Escalation => self.escalations(now),
            NotificationKind::DigestDaily => self.daily_digests(now),
            NotificationKind::DigestWeekly => self.weekly_digests(now),
        }
    }
}

fn row_to_employee(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
        role: row.get(offset + 3)?,
        manager_id: row.get(offset + 4)?,
        active: row.get::<_, i32>(offset + 5)? != 0,
    })
}

fn leave_line(l: &PendingLeave) -> String {
    format!("- {}: {} → {}", l.requester_name, l.start_date, l.end_date)
}

fn none_if_empty(lines: &[String]) -> String {
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::TimeZone;
    use rosterbell_core::types::FieldValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
    }

    fn policy() -> PolicyConfig {
        PolicyConfig { escalation_after_days: Some(3), ..PolicyConfig::default() }
    }

    fn source_with(policy: PolicyConfig) -> SqliteDueSource {
        let roles = vec!["admin".into(), "hr".into()];
        let src = SqliteDueSource::open_in_memory(policy, roles).unwrap();
        src.upsert_employee(&employee(1, "Hoa", "hr", None)).unwrap();
        src.upsert_employee(&employee(2, "Minh", "manager", None)).unwrap();
        src.upsert_employee(&employee(3, "Lan", "employee", Some(2))).unwrap();
        src.upsert_employee(&employee(4, "Tuan", "employee", Some(2))).unwrap();
        src
    }

    fn source() -> SqliteDueSource {
        source_with(policy())
    }

    #[tokio::test]
    async fn test_reminder_groups_by_approver() {
        let src = source();
        src.upsert_leave_request(&pending_leave(10, 3, 2, now() - Duration::hours(5))).unwrap();
        src.upsert_leave_request(&pending_leave(11, 4, 2, now() - Duration::hours(1))).unwrap();
        let mut approved = pending_leave(12, 4, 2, now());
        approved.status = LeaveStatus::Approved;
        src.upsert_leave_request(&approved).unwrap();

        let due = src.due(NotificationKind::Reminder, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient.email, "minh@acme.test");
        assert_eq!(due[0].payload.get("pending_count"), Some(&FieldValue::Int(2)));
        assert!(due[0].payload.get("items").unwrap().to_string().contains("Lan"));
    }

    #[tokio::test]
    async fn test_reminder_min_age_is_respected() {
        let policy = PolicyConfig { reminder_min_age_hours: 4, ..policy() };
        let src = SqliteDueSource::open_in_memory(policy, vec![]).unwrap();
        src.upsert_employee(&employee(2, "Minh", "manager", None)).unwrap();
        src.upsert_employee(&employee(3, "Lan", "employee", Some(2))).unwrap();
        src.upsert_leave_request(&pending_leave(10, 3, 2, now() - Duration::hours(1))).unwrap();
        assert!(src.due(NotificationKind::Reminder, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overdue_only_past_draft_periods() {
        let src = source();
        let past = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let today = now().date_naive();
        for (id, period_end, status) in [
            (1, past, TimesheetStatus::Draft),
            (2, today, TimesheetStatus::Draft),
            (3, past, TimesheetStatus::Submitted),
        ] {
            src.upsert_timesheet(&Timesheet { id, employee_id: 3, period_end, status }).unwrap();
        }

        let due = src.due(NotificationKind::Overdue, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient.employee_id, 3);
        assert_eq!(due[0].payload.get("overdue_count"), Some(&FieldValue::Int(1)));
    }

    #[tokio::test]
    async fn test_escalation_goes_to_hr_after_threshold() {
        let src = source();
        src.upsert_leave_request(&pending_leave(10, 3, 2, now() - Duration::days(1))).unwrap();
        assert!(src.due(NotificationKind::Escalation, now()).await.unwrap().is_empty());

        src.upsert_leave_request(&pending_leave(11, 4, 2, now() - Duration::days(4))).unwrap();
        let due = src.due(NotificationKind::Escalation, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient.name, "Hoa");
        assert_eq!(due[0].payload.get("stale_count"), Some(&FieldValue::Int(1)));
        assert_eq!(due[0].payload.get("oldest_days"), Some(&FieldValue::Int(4)));
    }

    #[tokio::test]
    async fn test_no_escalations_without_threshold() {
        let src = source_with(PolicyConfig::default());
        src.upsert_leave_request(&pending_leave(10, 3, 2, now() - Duration::days(30))).unwrap();
        assert!(src.due(NotificationKind::Escalation, now()).await.unwrap().is_empty());
        assert_eq!(src.due(NotificationKind::Reminder, now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_digest_for_managers() {
        let src = source();
        src.upsert_leave_request(&pending_leave(10, 3, 2, now())).unwrap();
        src.upsert_timesheet(&Timesheet {
            id: 1,
            employee_id: 4,
            period_end: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            status: TimesheetStatus::Draft,
        })
        .unwrap();

        let due = src.due(NotificationKind::DigestDaily, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        let p = &due[0].payload;
        assert_eq!(due[0].recipient.employee_id, 2);
        assert_eq!(p.get("pending_approvals"), Some(&FieldValue::Int(1)));
        assert_eq!(p.get("team_overdue_timesheets"), Some(&FieldValue::Int(1)));
        assert!(p.get("timesheet_items").unwrap().to_string().contains("Tuan"));
    }

    #[tokio::test]
    async fn test_weekly_digest_for_privileged_roles() {
        let src = source();
        let mut approved = pending_leave(10, 3, 2, now() - Duration::days(3));
        approved.status = LeaveStatus::Approved;
        approved.decided_at = Some(now() - Duration::days(2));
        src.upsert_leave_request(&approved).unwrap();

        let due = src.due(NotificationKind::DigestWeekly, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient.name, "Hoa");
        assert_eq!(due[0].payload.get("approved_leave"), Some(&FieldValue::Int(1)));
        assert_eq!(due[0].payload.get("pending_leave"), Some(&FieldValue::Int(0)));
    }

    #[test]
    fn test_inactive_approver_is_ignored() {
        let src = source();
        let mut gone = employee(2, "Minh", "manager", None);
        gone.active = false;
        src.upsert_employee(&gone).unwrap();
        src.upsert_leave_request(&pending_leave(10, 3, 2, now())).unwrap();
        assert!(src.pending_leaves(now()).unwrap().is_empty());
    }

    #[test]
    fn test_clock_in_snapshot() {
        let src = source();
        let rec = src.clock_in(3, now()).unwrap();
        let row = rec.snapshot();
        assert_eq!(row.get("employee_id"), Some(&FieldValue::Int(3)));
        assert_eq!(row.get("clock_out"), Some(&FieldValue::Null));
    }
}
