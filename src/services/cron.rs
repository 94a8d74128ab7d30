//! Five-field cron expressions (`minute hour day-of-month month day-of-week`)
//! evaluated in UTC.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Upper bound on candidate minutes inspected by [`CronSchedule::next_after`].
/// Hour, day and month mismatches skip ahead in larger steps, so any valid
/// expression resolves well within this.
const MAX_STEPS: usize = 100_000;

#[derive(Debug, Clone, Copy)]
struct Field {
    min: u32,
    max: u32,
    name: &'static str,
}

const MINUTE: Field = Field { min: 0, max: 59, name: "minute" };
const HOUR: Field = Field { min: 0, max: 23, name: "hour" };
const DAY_OF_MONTH: Field = Field { min: 1, max: 31, name: "day-of-month" };
const MONTH: Field = Field { min: 1, max: 12, name: "month" };
// 7 is accepted as an alias for Sunday and folded onto 0.
const DAY_OF_WEEK: Field = Field { min: 0, max: 7, name: "day-of-week" };

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::syntax(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(expression, fields[4], DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: parse_field(expression, fields[0], MINUTE)?,
            hours: parse_field(expression, fields[1], HOUR)?,
            days_of_month: parse_field(expression, fields[2], DAY_OF_MONTH)?,
            months: parse_field(expression, fields[3], MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the schedule fires at the minute containing `at`.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        bit(self.minutes, at.minute())
            && bit(self.hours, at.hour())
            && bit(self.months, at.month())
            && self.day_matches(at)
    }

    /// When both day fields are restricted a day matches if either does.
    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, at.day());
        let dow = bit(self.days_of_week, at.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First fire time strictly after `after`, at minute resolution.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after)? + Duration::minutes(1);

        for _ in 0..MAX_STEPS {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = start_of_hour(t)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(expression: &str, raw: &str, field: Field) -> Result<u64, CronError> {
    let mut mask = 0u64;
    for part in raw.split(',') {
        mask |= parse_part(expression, part, field)?;
    }
    Ok(mask)
}

fn parse_part(expression: &str, part: &str, field: Field) -> Result<u64, CronError> {
    let err = |reason: String| CronError::syntax(expression, format!("{}: {}", field.name, reason));

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| err(format!("invalid step '{step}'")))?;
            if step == 0 {
                return Err(err("step must be positive".to_string()));
            }
            (range, step)
        }
        None => (part, 1),
    };

    let value = |s: &str| -> Result<u32, CronError> {
        let v: u32 = s.parse().map_err(|_| err(format!("invalid value '{s}'")))?;
        if v < field.min || v > field.max {
            return Err(err(format!("{v} is outside {}-{}", field.min, field.max)));
        }
        Ok(v)
    };

    let (start, end) = if range == "*" {
        (field.min, field.max)
    } else if let Some((lo, hi)) = range.split_once('-') {
        let (lo, hi) = (value(lo)?, value(hi)?);
        if lo > hi {
            return Err(err(format!("range {lo}-{hi} is reversed")));
        }
        (lo, hi)
    } else {
        let v = value(range)?;
        // `5/15` means every 15 starting at 5.
        if part.contains('/') {
            (v, field.max)
        } else {
            (v, v)
        }
    };

    let mut mask = 0u64;
    let mut v = start;
    while v <= end {
        mask |= 1u64 << v;
        v += step;
    }
    Ok(mask)
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_second(0)?.with_nanosecond(0)
}

fn start_of_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    truncate_to_minute(t)?.with_minute(0)
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    start_of_hour(t)?.with_hour(0)
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    Syntax { expression: String, reason: String },
}

impl CronError {
    fn syntax(expression: &str, reason: String) -> Self {
        CronError::Syntax {
            expression: expression.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn hourly() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        assert_eq!(cron.next_after(at(2026, 3, 4, 10, 0)), Some(at(2026, 3, 4, 11, 0)));
        assert_eq!(cron.next_after(at(2026, 3, 4, 10, 59)), Some(at(2026, 3, 4, 11, 0)));
    }

    #[test]
    fn next_is_strictly_after_even_with_seconds() {
        let cron = CronSchedule::parse("30 2 * * *").unwrap();
        let t = at(2026, 3, 4, 2, 30) + Duration::seconds(15);
        assert_eq!(cron.next_after(t), Some(at(2026, 3, 5, 2, 30)));
    }

    #[test]
    fn monthly_rolls_over_year() {
        let cron = CronSchedule::parse("0 0 1 * *").unwrap();
        assert_eq!(cron.next_after(at(2026, 12, 15, 8, 0)), Some(at(2027, 1, 1, 0, 0)));
    }

    #[test]
    fn steps_lists_and_ranges() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // 2026-03-07 is a Saturday.
        assert_eq!(cron.next_after(at(2026, 3, 6, 17, 45)), Some(at(2026, 3, 9, 9, 0)));
        assert_eq!(cron.next_after(at(2026, 3, 9, 9, 0)), Some(at(2026, 3, 9, 9, 15)));

        let cron = CronSchedule::parse("5,35 0 * * *").unwrap();
        assert_eq!(cron.next_after(at(2026, 3, 9, 0, 5)), Some(at(2026, 3, 9, 0, 35)));
    }

    #[test]
    fn restricted_day_fields_are_ored() {
        // The 13th of the month, or any Friday.
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2026-03-06 is a Friday, before the 13th.
        assert_eq!(cron.next_after(at(2026, 3, 1, 0, 0)), Some(at(2026, 3, 6, 0, 0)));
    }

    #[test]
    fn sunday_as_seven() {
        let cron = CronSchedule::parse("0 12 * * 7").unwrap();
        // 2026-03-08 is a Sunday.
        assert_eq!(cron.next_after(at(2026, 3, 4, 0, 0)), Some(at(2026, 3, 8, 12, 0)));
    }

    #[test]
    fn impossible_date_never_fires() {
        let cron = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
            assert!(CronSchedule::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
