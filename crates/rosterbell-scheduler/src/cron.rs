//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, */N, N, A-B, A-B/N and comma lists of those.
//! Example: "0 8 * * 1" = every Monday at 8:00 (UTC)
//!
//! No cron crate dependency.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use rosterbell_core::error::{Result, RosterbellError};

/// Upper bound on how far ahead `next_after` searches.
const SEARCH_HORIZON_DAYS: i64 = 366 * 4;

/// A parsed 5-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse "MIN HOUR DOM MON DOW".
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(RosterbellError::Schedule(format!(
                "Invalid cron expression: '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let field = |raw: &str, min: u32, max: u32, name: &str| {
            parse_field(raw, min, max).ok_or_else(|| {
                RosterbellError::Schedule(format!(
                    "Invalid {name} field '{raw}' in cron expression '{expression}'"
                ))
            })
        };

        let minutes = field(parts[0], 0, 59, "minute")?;
        let hours = field(parts[1], 0, 23, "hour")?;
        let days_of_month = field(parts[2], 1, 31, "day-of-month")?;
        let months = field(parts[3], 1, 12, "month")?;
        // 7 is accepted as Sunday
        let mut days_of_week: Vec<u32> = field(parts[4], 0, 7, "day-of-week")?
            .into_iter()
            .map(|d| d % 7)
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    /// Whether `t` (truncated to the minute) matches the schedule.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(&t.month())
            && self.day_matches(t.date_naive())
            && self.hours.contains(&t.hour())
            && self.minutes.contains(&t.minute())
    }

    /// Standard cron semantics: when both DOM and DOW are restricted, either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);

        let mut candidate = after + Duration::minutes(1);
        candidate = candidate
            .with_second(0)
            .and_then(|c| c.with_nanosecond(0))
            .unwrap_or(candidate);

        while candidate <= horizon {
            if !self.months.contains(&candidate.month()) {
                candidate = first_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate.date_naive()) {
                candidate = next_midnight(candidate)?;
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = next_hour(candidate)?;
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }
}

/// Parse a cron expression and compute the next run time, logging bad input.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(after),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}

fn next_midnight(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn next_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let top = t.with_minute(0)?;
    Some(top + Duration::hours(1))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for item in field.split(',') {
        values.extend(parse_item(item.trim(), min, max)?);
    }
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

/// One comma-separated item: `*`, `*/N`, `N`, `A-B` or `A-B/N`.
fn parse_item(item: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, n)
        }
        None => (item, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/step" means N..=max stepping
        if step > 1 { (n, max) } else { (n, n) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}
