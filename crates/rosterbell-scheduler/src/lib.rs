//! # Rosterbell Scheduler
//!
//! Ultra-lightweight task scheduler for the HR notification pipeline.
//! Tokio timers only: zero overhead when idle.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval)
//!   ├── digest:daily        "daily 08:00"      → dispatch digest_daily
//!   ├── digest:weekly       "weekly mon 08:00" → dispatch digest_weekly
//!   ├── reminders:pending   "every 4h"         → dispatch reminder/overdue/escalation
//!   ├── queue:drain         "every minute"     → drain delivery queue
//!   └── queue:prune-failed  "weekly sun 03:00" → prune dead-letter records
//!          │
//!          └── named lock per task → skip trigger while previous run is active
//! ```

pub mod cron;
pub mod engine;
pub mod tasks;

pub use cron::CronSchedule;
pub use engine::{SchedulerEngine, TaskGuard, TaskHandler, TaskLocks, TickOutcome, handler_fn};
pub use tasks::{ScheduledTask, SchedulerConfig, Trigger};
