//! Task definitions: the static table of scheduled work.
//!
//! Tasks are declared once at startup (from config or the built-in defaults)
//! and never persisted. Only their next run time changes at runtime.

use chrono::{DateTime, Utc, Weekday};
use std::fmt;
use std::str::FromStr;

use rosterbell_core::config::{
    ExecutionMode, OverlapPolicy, SchedulerSection, TaskAction, TaskConfig,
};
use rosterbell_core::error::{Result, RosterbellError};

use crate::cron::CronSchedule;

/// When a task fires. All times are UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// `daily HH:MM`
    DailyAt { hour: u32, minute: u32 },
    /// `weekly <day> HH:MM`
    WeeklyOn { weekday: Weekday, hour: u32, minute: u32 },
    /// `every Nh`: on the hour, every N hours from midnight.
    EveryHours(u32),
    /// `every minute`
    EveryMinute,
    /// Raw 5-field cron expression.
    Cron(String),
}

impl Trigger {
    /// Equivalent 5-field cron expression.
    pub fn to_cron(&self) -> String {
        match self {
            Trigger::DailyAt { hour, minute } => format!("{minute} {hour} * * *"),
            Trigger::WeeklyOn { weekday, hour, minute } => {
                format!("{minute} {hour} * * {}", weekday.num_days_from_sunday())
            }
            Trigger::EveryHours(1) => "0 * * * *".to_string(),
            Trigger::EveryHours(n) => format!("0 */{n} * * *"),
            Trigger::EveryMinute => "* * * * *".to_string(),
            Trigger::Cron(expr) => expr.clone(),
        }
    }

    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.to_cron())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::DailyAt { hour, minute } => write!(f, "daily {hour:02}:{minute:02}"),
            Trigger::WeeklyOn { weekday, hour, minute } => write!(
                f,
                "weekly {} {hour:02}:{minute:02}",
                weekday.to_string().to_lowercase()
            ),
            Trigger::EveryHours(n) => write!(f, "every {n}h"),
            Trigger::EveryMinute => write!(f, "every minute"),
            Trigger::Cron(expr) => f.write_str(expr),
        }
    }
}

impl FromStr for Trigger {
    type Err = RosterbellError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || RosterbellError::Schedule(format!("Invalid trigger: '{s}'"));
        let parts: Vec<&str> = s.split_whitespace().collect();

        let trigger = match parts.as_slice() {
            ["daily", time] => {
                let (hour, minute) = parse_time(time).ok_or_else(bad)?;
                Trigger::DailyAt { hour, minute }
            }
            ["weekly", day, time] => {
                let weekday: Weekday = day.parse().map_err(|_| bad())?;
                let (hour, minute) = parse_time(time).ok_or_else(bad)?;
                Trigger::WeeklyOn { weekday, hour, minute }
            }
            ["every", "minute"] => Trigger::EveryMinute,
            ["every", hours] => {
                let n: u32 = hours
                    .strip_suffix('h')
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(bad)?;
                if !(1..=23).contains(&n) {
                    return Err(RosterbellError::Schedule(format!(
                        "Invalid trigger: '{s}' (hours must be 1-23, use 'daily HH:MM' instead)"
                    )));
                }
                Trigger::EveryHours(n)
            }
            _ if parts.len() == 5 => Trigger::Cron(parts.join(" ")),
            _ => return Err(bad()),
        };

        // Validates ranges for every form.
        trigger.schedule()?;
        Ok(trigger)
    }
}

fn parse_time(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// A registered scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Unique task identity; also the overlap lock key.
    pub name: String,
    pub trigger: Trigger,
    pub action: TaskAction,
    pub overlap: OverlapPolicy,
    pub mode: ExecutionMode,
    schedule: CronSchedule,
}

impl ScheduledTask {
    pub fn new(name: &str, trigger: Trigger, action: TaskAction) -> Result<Self> {
        let schedule = trigger.schedule()?;
        Ok(Self {
            name: name.to_string(),
            trigger,
            action,
            overlap: OverlapPolicy::Skip,
            mode: ExecutionMode::Background,
            schedule,
        })
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn from_config(config: &TaskConfig) -> Result<Self> {
        let trigger: Trigger = config.trigger.parse().map_err(|e| {
            RosterbellError::Config(format!("Task '{}': {e}", config.name))
        })?;
        Ok(Self::new(&config.name, trigger, config.action.clone())?
            .with_overlap(config.overlap)
            .with_mode(config.mode))
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_after(after)
    }
}

/// The scheduler's explicit configuration object, built once at startup.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub tasks: Vec<ScheduledTask>,
}

impl SchedulerConfig {
    pub fn new(tick_secs: u64, tasks: Vec<ScheduledTask>) -> Result<Self> {
        let mut names = std::collections::HashSet::new();
        for task in &tasks {
            if !names.insert(task.name.as_str()) {
                return Err(RosterbellError::Config(format!(
                    "Duplicate scheduled task name: '{}'",
                    task.name
                )));
            }
        }
        Ok(Self {
            tick_secs: tick_secs.max(1),
            tasks,
        })
    }

    pub fn from_config(section: &SchedulerSection) -> Result<Self> {
        let tasks = section
            .tasks
            .iter()
            .map(ScheduledTask::from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::new(section.tick_secs, tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rosterbell_core::config::default_tasks;

    #[test]
    fn test_parse_trigger_forms() {
        assert_eq!(
            "daily 08:00".parse::<Trigger>().unwrap(),
            Trigger::DailyAt { hour: 8, minute: 0 }
        );
        assert_eq!(
            "weekly mon 08:30".parse::<Trigger>().unwrap(),
            Trigger::WeeklyOn { weekday: Weekday::Mon, hour: 8, minute: 30 }
        );
        assert_eq!("every 4h".parse::<Trigger>().unwrap(), Trigger::EveryHours(4));
        assert_eq!("every minute".parse::<Trigger>().unwrap(), Trigger::EveryMinute);
        assert_eq!(
            "15  2 * * *".parse::<Trigger>().unwrap(),
            Trigger::Cron("15 2 * * *".into())
        );
    }

    #[test]
    fn test_reject_bad_triggers() {
        let bad_triggers = [
            "daily 25:00",
            "weekly funday 08:00",
            "every 0h",
            "every 24h",
            "hourly",
            "1 2 3",
        ];
        for bad in bad_triggers {
            assert!(bad.parse::<Trigger>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["daily 08:00", "weekly sun 03:00", "every 4h", "every minute"] {
            let t: Trigger = s.parse().unwrap();
            assert_eq!(t.to_string(), s);
        }
    }

    #[test]
    fn test_every_hours_next_after() {
        let task = ScheduledTask::new("r", Trigger::EveryHours(4), TaskAction::DrainQueue).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 3, 13, 5, 0).unwrap();
        assert_eq!(
            task.next_after(after).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_default_tasks_build() {
        let section = SchedulerSection::default();
        let config = SchedulerConfig::from_config(&section).unwrap();
        assert_eq!(config.tasks.len(), default_tasks().len());
        let weekly = config.tasks.iter().find(|t| t.name == "digest:weekly").unwrap();
        assert_eq!(
            weekly.trigger,
            Trigger::WeeklyOn { weekday: Weekday::Mon, hour: 8, minute: 0 }
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a = ScheduledTask::new("x", Trigger::EveryMinute, TaskAction::DrainQueue).unwrap();
        let b = a.clone();
        assert!(SchedulerConfig::new(30, vec![a, b]).is_err());
    }
}
