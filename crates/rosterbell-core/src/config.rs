//! Rosterbell configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Result, RosterbellError};
use crate::types::NotificationKind;

const ESCALATION_NOTE: &str = "\
# Escalations are off until a threshold is chosen. To turn them on, add
# under [policy]:
#   escalation_after_days = <days a leave request may stay pending>

";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RosterbellConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

impl RosterbellConfig {
    /// Load config from the default path (~/.rosterbell/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RosterbellError::Config(format!("Failed to read config: {e}")))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("📄 Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RosterbellError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = toml::to_string_pretty(self)
            .map_err(|e| RosterbellError::Config(format!("Failed to serialize config: {e}")))?;
        if self.policy.escalation_after_days.is_none() {
            content.insert_str(0, ESCALATION_NOTE);
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(RosterbellError::Config("queue.max_attempts must be >= 1".into()));
        }
        if self.queue.workers == 0 {
            return Err(RosterbellError::Config("queue.workers must be >= 1".into()));
        }
        if self.queue.timeout_secs == 0 {
            return Err(RosterbellError::Config("queue.timeout_secs must be >= 1".into()));
        }
        if self.policy.escalation_after_days == Some(0) {
            return Err(RosterbellError::Config(
                "policy.escalation_after_days must be >= 1 when set".into(),
            ));
        }
        let mut seen = HashSet::new();
        for task in &self.scheduler.tasks {
            if !seen.insert(task.name.as_str()) {
                return Err(RosterbellError::Config(format!(
                    "Duplicate scheduled task name: '{}'",
                    task.name
                )));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Rosterbell home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rosterbell")
    }
}

/// Database (job queue + HR read model) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.rosterbell/rosterbell.db".into() }

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Outbound SMTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from_address() -> String { "hr-noreply@localhost".into() }
fn default_from_name() -> String { "HR Notifications".into() }

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: default_from_address(),
            from_name: default_from_name(),
        }
    }
}

/// Delivery queue and worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_failed_retention_days")]
    pub failed_retention_days: u32,
}

fn default_workers() -> usize { 4 }
fn default_max_attempts() -> u32 { 3 }
fn default_timeout_secs() -> u64 { 60 }
fn default_retry_backoff_secs() -> u64 { 30 }
fn default_failed_retention_days() -> u32 { 7 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            failed_retention_days: default_failed_retention_days(),
        }
    }
}

/// Scheduler configuration: tick cadence plus the task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_tasks")]
    pub tasks: Vec<TaskConfig>,
}

fn default_tick_secs() -> u64 { 30 }

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            tasks: default_tasks(),
        }
    }
}

/// One scheduled task registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    /// `daily 08:00`, `weekly mon 08:00`, `every 4h`, `every minute` or 5-field cron.
    pub trigger: String,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub action: TaskAction,
}

/// What a scheduled task does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// Compute due recipients for each kind and enqueue delivery jobs.
    Dispatch { kinds: Vec<NotificationKind> },
    /// Run the worker pool until the delivery queue is empty.
    DrainQueue,
    /// Delete dead-letter records past retention.
    PruneFailed,
}

/// Whether a task may start while a previous run is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Allow,
}

/// Where a task runs relative to the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Background,
    Foreground,
}

fn task(name: &str, trigger: &str, action: TaskAction) -> TaskConfig {
    TaskConfig {
        name: name.into(),
        trigger: trigger.into(),
        overlap: OverlapPolicy::Skip,
        mode: ExecutionMode::Background,
        action,
    }
}

/// The five fixed task definitions.
pub fn default_tasks() -> Vec<TaskConfig> {
    vec![
        task(
            "digest:daily",
            "daily 08:00",
            TaskAction::Dispatch { kinds: vec![NotificationKind::DigestDaily] },
        ),
        task(
            "digest:weekly",
            "weekly mon 08:00",
            TaskAction::Dispatch { kinds: vec![NotificationKind::DigestWeekly] },
        ),
        task(
            "reminders:pending",
            "every 4h",
            TaskAction::Dispatch {
                kinds: vec![
                    NotificationKind::Reminder,
                    NotificationKind::Overdue,
                    NotificationKind::Escalation,
                ],
            },
        ),
        task("queue:drain", "every minute", TaskAction::DrainQueue),
        task("queue:prune-failed", "weekly sun 03:00", TaskAction::PruneFailed),
    ]
}

/// Due-set policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub reminder_min_age_hours: u32,
    /// Days a pending leave request may wait before HR hears about it.
    /// Unset means no escalations are ever due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_after_days: Option<u32>,
    #[serde(default = "default_escalation_roles")]
    pub escalation_roles: Vec<String>,
}

fn default_escalation_roles() -> Vec<String> { vec!["hr".into()] }

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reminder_min_age_hours: 0,
            escalation_after_days: None,
            escalation_roles: default_escalation_roles(),
        }
    }
}

/// Realtime broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_privileged_roles")]
    pub privileged_roles: Vec<String>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_privileged_roles() -> Vec<String> { vec!["admin".into(), "hr".into()] }
fn default_channel_capacity() -> usize { 256 }

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            privileged_roles: default_privileged_roles(),
            channel_capacity: default_channel_capacity(),
        }
    }
}
