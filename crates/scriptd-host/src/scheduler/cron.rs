//! Five-field cron expressions evaluated in UTC.
//!
//! Fields are minute, hour, day-of-month, month and day-of-week. Each field
//! accepts `*`, `n`, `a-b`, `*/s`, `a-b/s`, `n/s` and comma lists. Months and
//! weekdays also accept three-letter names. When both day fields are
//! restricted a day matches if either one does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` looks before giving up (e.g. `0 0 30 2 *`)
const SEARCH_LIMIT_DAYS: i64 = 5 * 366;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,

    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_offset: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_offset: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    name_offset: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    name_offset: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &DAY_NAMES,
    name_offset: 0,
};

/// A compiled cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(spec: &str) -> Result<Self, CronError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(CronError::Empty);
        }

        let expanded = expand_macro(trimmed).unwrap_or(trimmed);
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let (minutes, _) = parse_field(fields[0], &MINUTE)?;
        let (hours, _) = parse_field(fields[1], &HOUR)?;
        let (days_of_month, dom_restricted) = parse_field(fields[2], &DAY_OF_MONTH)?;
        let (months, _) = parse_field(fields[3], &MONTH)?;
        let (mut days_of_week, dow_restricted) = parse_field(fields[4], &DAY_OF_WEEK)?;

        // 7 is another spelling of Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    /// The expression as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after + Duration::days(SEARCH_LIMIT_DAYS);

        while t <= limit {
            if !bit(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }

            if !self.matches_day(t.date_naive()) {
                t = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }

            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
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

    /// The next `count` fire times after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        bit(self.minutes, t.minute())
            && bit(self.hours, t.hour())
            && bit(self.months, t.month())
            && self.matches_day(t.date_naive())
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
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
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn expand_macro(spec: &str) -> Option<&'static str> {
    let expanded = match spec.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" | "daily" => "0 0 * * *",
        "@hourly" | "hourly" => "0 * * * *",
        _ => return None,
    };
    Some(expanded)
}

/// Returns the bit set and whether the field restricts anything
fn parse_field(text: &str, spec: &FieldSpec) -> Result<(u64, bool), CronError> {
    let err = |reason: String| CronError::Field {
        field: spec.name,
        value: text.to_string(),
        reason,
    };

    let mut mask = 0u64;
    for item in text.split(',') {
        if item.is_empty() {
            return Err(err("empty list item".to_string()));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("invalid step '{}'", step)))?;
                if step == 0 {
                    return Err(err("step must be positive".to_string()));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let start = parse_value(a, spec).map_err(&err)?;
            let end = parse_value(b, spec).map_err(&err)?;
            if start > end {
                return Err(err(format!("range {}-{} is backwards", start, end)));
            }
            (start, end)
        } else {
            let value = parse_value(range, spec).map_err(&err)?;
            // `n/s` runs from n to the end of the field
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            mask |= 1 << value;
        }
    }

    Ok((mask, !text.starts_with('*')))
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            let lower = text.to_ascii_lowercase();
            let index = spec
                .names
                .iter()
                .position(|name| *name == lower)
                .ok_or_else(|| format!("'{}' is not a number", text))?;
            index as u32 + spec.name_offset
        }
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} is out of range {}-{}",
            value, spec.min, spec.max
        ));
    }
    Ok(value)
}
