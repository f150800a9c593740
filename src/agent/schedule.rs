//! Reconciliation schedules: fixed intervals and cron rules.
//!
//! A [`Schedule`] is parsed once from a human-supplied expression and is
//! immutable afterwards. Two forms are accepted:
//!
//! - a duration: `"30m"`, `"1h"`, `"1h30m"`, `"2d"` (units `s m h d w`), or
//!   `"@every 45m"`;
//! - a 5-field cron expression (`minute hour day-of-month month day-of-week`)
//!   with `*`, lists, ranges, steps and month/day names, or one of the macros
//!   `@hourly @daily @midnight @weekly @monthly @yearly @annually`.
//!
//! Anything else is rejected at parse time, including cron expressions that
//! can never fire.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{
    DateTime, Datelike, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Years searched ahead for a cron match. Covers a Feb 29 rule across a
/// skipped leap year (2100).
const CRON_HORIZON_YEARS: i32 = 9;

/// A repeatable timing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    expr: String,
    rule: Rule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Interval(Duration),
    Cron(CronRule),
}

impl Schedule {
    /// Parse a schedule expression.
    pub fn parse(expr: &str) -> ValidationResult<Self> {
        let trimmed = expr.trim();
        let invalid = |reason: String| ValidationError::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("schedule is empty".into()));
        }

        let rule = if let Some(every) = trimmed.strip_prefix("@every") {
            Rule::Interval(parse_duration(every).map_err(invalid)?)
        } else if trimmed.starts_with('@') || trimmed.contains(char::is_whitespace) {
            Rule::Cron(CronRule::parse(trimmed).map_err(invalid)?)
        } else {
            Rule::Interval(parse_duration(trimmed).map_err(invalid)?)
        };

        Ok(Self {
            expr: trimmed.to_string(),
            rule,
        })
    }

    /// A fixed-interval schedule.
    pub fn every(interval: Duration) -> ValidationResult<Self> {
        if interval.is_zero() {
            return Err(ValidationError::InvalidSchedule {
                expr: "0s".into(),
                reason: "interval must be greater than zero".into(),
            });
        }
        Ok(Self {
            expr: duration_expr(interval),
            rule: Rule::Interval(interval),
        })
    }

    /// The expression this schedule was parsed from.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The fixed interval, for interval schedules.
    pub fn interval(&self) -> Option<Duration> {
        match &self.rule {
            Rule::Interval(d) => Some(*d),
            Rule::Cron(_) => None,
        }
    }

    pub fn is_cron(&self) -> bool {
        matches!(self.rule, Rule::Cron(_))
    }

    /// Next fire instant strictly after `after`, cron rules evaluated in local time.
    pub fn next(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        self.next_in(after, &Local)
    }

    /// Next fire instant strictly after `after`, cron rules evaluated in `tz`.
    ///
    /// Deterministic for interval schedules (`after + interval`).
    pub fn next_in<Tz: TimeZone>(&self, after: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
        match &self.rule {
            Rule::Interval(d) => add_std(after, *d),
            Rule::Cron(cron) => cron.next_after(after, tz).unwrap_or_else(|| {
                // Parse-time validation guarantees a match exists; this only
                // guards against calendar arithmetic overflow.
                tracing::warn!(expr = %self.expr, "cron rule found no match, retrying in 1d");
                add_std(after, Duration::from_secs(86_400))
            }),
        }
    }

    /// How long to wait from `now` until `next`. Overdue fire times (e.g. after
    /// the machine was suspended) yield zero so the tick fires immediately.
    pub fn wait_until(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl FromStr for Schedule {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Schedule {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.expr
    }
}

fn add_std(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a positive duration such as `"30s"`, `"5m"`, `"1h30m"` or `"2d"`.
///
/// Returns the reason on failure so callers can wrap it in the error that
/// names their field.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration is empty".into());
    }
    if s.starts_with('-') {
        return Err("duration must be positive".into());
    }

    let mut total: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number at \"{rest}\""));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number too large: {}", &rest[..digits]))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit_secs: u64 = match &rest[..unit_len] {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            "" => return Err("missing unit (one of s, m, h, d, w)".into()),
            other => return Err(format!("unknown unit \"{other}\"")),
        };
        rest = &rest[unit_len..];

        total = amount
            .checked_mul(unit_secs)
            .and_then(|secs| total.checked_add(secs))
            .ok_or("duration is too large")?;
    }

    if total == 0 {
        return Err("duration must be greater than zero".into());
    }
    Ok(Duration::from_secs(total))
}

/// Render a duration in the form [`parse_duration`] accepts (`"1h30m"`,
/// `"45s"`). Sub-second remainders round up to the next whole second.
pub fn duration_expr(d: Duration) -> String {
    let mut secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    if out.is_empty() {
        out.push_str("0s");
    }
    out
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Parsed 5-field cron rule. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronRule {
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    /// Day-of-month field was unrestricted (`*`).
    any_day: bool,
    /// Day-of-week field was unrestricted (`*`).
    any_weekday: bool,
}

impl CronRule {
    fn parse(expr: &str) -> Result<Self, String> {
        let expanded = match expr {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(format!("unknown macro \"{other}\""));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 cron fields (minute hour day month weekday), got {}",
                fields.len()
            ));
        }

        let minutes = parse_field(fields[0], "minute", 0, 59, &[])?;
        let hours = parse_field(fields[1], "hour", 0, 23, &[])?;
        let days = parse_field(fields[2], "day-of-month", 1, 31, &[])?;
        let months = parse_field(fields[3], "month", 1, 12, MONTH_NAMES)?;
        let mut weekdays = parse_field(fields[4], "day-of-week", 0, 7, WEEKDAY_NAMES)?;
        // 7 is an alias for Sunday.
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        let rule = Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
            any_day: fields[2].starts_with('*'),
            any_weekday: fields[4].starts_with('*'),
        };

        let reference = NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .ok_or("calendar reference out of range")?;
        if rule.next_after(reference, &Utc).is_none() {
            return Err("expression never matches a calendar date".into());
        }
        Ok(rule)
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days, date.day());
        let dow = has(self.weekdays, date.weekday().num_days_from_sunday());
        match (self.any_day, self.any_weekday) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            // Both restricted: classic cron fires when either matches.
            (false, false) => dom || dow,
        }
    }

    fn next_after<Tz: TimeZone>(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(tz).naive_local();
        let mut t = local.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);
        let horizon = t.year() + CRON_HORIZON_YEARS;

        while t.year() <= horizon {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += chrono::Duration::minutes(1);
                continue;
            }

            // Local times inside a DST gap do not exist; during an overlap
            // the earlier instant is used, so the rule fires once.
            match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    let utc = dt.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
                LocalResult::None => {}
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

fn has(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Parse one cron field into a bitset over `min..=max`.
fn parse_field(field: &str, name: &str, min: u32, max: u32, names: &[&str]) -> Result<u64, String> {
    let mut set = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step \"{step}\" in {name} field"))?;
                if step == 0 {
                    return Err(format!("step must be positive in {name} field"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, name, min, names)?,
                parse_value(b, name, min, names)?,
            )
        } else {
            let v = parse_value(range, name, min, names)?;
            // `5/10` means "from 5 to the end, every 10".
            (v, if step.is_some() { max } else { v })
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!(
                "{name} value \"{range}\" out of range {min}-{max}"
            ));
        }

        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            set |= 1u64 << v;
            v += step;
        }
    }
    Ok(set)
}

fn parse_value(token: &str, name: &str, min: u32, names: &[&str]) -> Result<u32, String> {
    if let Ok(v) = token.parse::<u32>() {
        return Ok(v);
    }
    let lower = token.to_ascii_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|idx| idx as u32 + min)
        .ok_or_else(|| format!("invalid {name} value \"{token}\""))
}
