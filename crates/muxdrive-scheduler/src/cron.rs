//! 5-field cron expressions
//!
//! Grammar: `minute hour day-of-month month day-of-week`, whitespace
//! separated. Each field accepts `*`, `?` (same as `*`), comma lists,
//! `a-b` ranges, and `*/step` or `a-b/step`. Month names (`jan`..`dec`)
//! and weekday names (`sun`..`sat`) are accepted; weekday `7` normalizes
//! to `0`. Out-of-range numbers clamp to the field bounds; descending
//! ranges and zero steps are errors.
//!
//! Day matching uses standard cron OR semantics: when both day-of-month
//! and day-of-week are restricted, a day matches if either does.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};

use muxdrive_core::{EngineError, EngineResult};

/// How far the next-occurrence search looks before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366;

const MONTH_ALIASES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_ALIASES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    All,
    Step(u32),
    Value(u32),
    Range(u32, u32),
    RangeStep(u32, u32, u32),
}

#[derive(Debug, Clone)]
struct Field {
    parts: Vec<Part>,
    /// Expanded value set within the field bounds.
    values: BTreeSet<u32>,
    /// False when the field is a bare wildcard.
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|part| match part {
                Part::All => "*".to_string(),
                Part::Step(s) => format!("*/{s}"),
                Part::Value(v) => v.to_string(),
                Part::Range(a, b) => format!("{a}-{b}"),
                Part::RangeStep(a, b, s) => format!("{a}-{b}/{s}"),
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// A parsed, normalized cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

impl CronExpr {
    /// Parses a 5-field expression.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = input.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::InvalidCron(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, None)?,
            hour: parse_field(fields[1], 0, 23, None)?,
            dom: parse_field(fields[2], 1, 31, None)?,
            month: parse_field(fields[3], 1, 12, Some(&MONTH_ALIASES))?,
            dow: parse_field(fields[4], 0, 6, Some(&DOW_ALIASES))?,
        })
    }

    /// Whether `at` (minute precision) satisfies the expression.
    pub fn matches(&self, at: NaiveDateTime) -> bool {
        self.minute.contains(at.minute())
            && self.hour.contains(at.hour())
            && self.month.contains(at.month())
            && self.day_matches(at.date())
    }

    /// Standard cron OR day semantics.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_hit = self.dom.contains(date.day());
        let dow_hit = self.dow.contains(date.weekday().num_days_from_sunday());
        match (self.dom.restricted, self.dow.restricted) {
            (false, false) => true,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (true, true) => dom_hit || dow_hit,
        }
    }

    /// First instant strictly after `after` (truncated to the minute) that
    /// satisfies the expression, or `None` within a one-year horizon.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .naive_utc()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| after.naive_utc());
        let mut cur = start + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);

        while cur <= horizon {
            if !self.month.contains(cur.month()) {
                cur = first_minute_of_next_month(cur)?;
                continue;
            }
            if !self.day_matches(cur.date()) {
                cur = (cur.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(cur.hour()) {
                cur = cur
                    .with_minute(0)
                    .map(|t| t + Duration::hours(1))?;
                continue;
            }
            if !self.minute.contains(cur.minute()) {
                cur += Duration::minutes(1);
                continue;
            }
            return Some(DateTime::from_naive_utc_and_offset(cur, Utc));
        }
        None
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.dom, self.month, self.dow
        )
    }
}

impl FromStr for CronExpr {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn first_minute_of_next_month(at: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_field(
    text: &str,
    min: u32,
    max: u32,
    aliases: Option<&[&str]>,
) -> EngineResult<Field> {
    let mut parts = Vec::new();
    let mut values = BTreeSet::new();
    let mut restricted = false;

    for raw in text.split(',') {
        let part = parse_part(raw, min, max, aliases)?;
        match part {
            Part::All => {
                for v in min..=max {
                    values.insert(v);
                }
            }
            Part::Step(step) => {
                restricted = true;
                let mut v = min;
                while v <= max {
                    values.insert(v);
                    v += step;
                }
            }
            Part::Value(v) => {
                restricted = true;
                values.insert(v);
            }
            Part::Range(a, b) => {
                restricted = true;
                for v in a..=b {
                    values.insert(v);
                }
            }
            Part::RangeStep(a, b, step) => {
                restricted = true;
                let mut v = a;
                while v <= b {
                    values.insert(v);
                    v += step;
                }
            }
        }
        parts.push(part);
    }

    Ok(Field {
        parts,
        values,
        restricted,
    })
}

fn parse_part(
    raw: &str,
    min: u32,
    max: u32,
    aliases: Option<&[&str]>,
) -> EngineResult<Part> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EngineError::InvalidCron("empty field element".into()));
    }
    // `?` normalizes to `*`.
    if raw == "*" || raw == "?" {
        return Ok(Part::All);
    }

    let (base, step) = match raw.split_once('/') {
        Some((base, step_text)) => {
            let step: u32 = step_text
                .parse()
                .map_err(|_| EngineError::InvalidCron(format!("bad step '{step_text}'")))?;
            if step == 0 {
                return Err(EngineError::InvalidCron("step must be > 0".into()));
            }
            (base, Some(step))
        }
        None => (raw, None),
    };

    if base == "*" || base == "?" {
        return Ok(match step {
            Some(s) => Part::Step(s),
            None => Part::All,
        });
    }

    if let Some((a_text, b_text)) = base.split_once('-') {
        let a = parse_value(a_text, min, max, aliases)?;
        let b = parse_value(b_text, min, max, aliases)?;
        if a > b {
            return Err(EngineError::InvalidCron(format!(
                "range {a}-{b} is not ascending"
            )));
        }
        return Ok(match step {
            Some(s) => Part::RangeStep(a, b, s),
            None => Part::Range(a, b),
        });
    }

    let value = parse_value(base, min, max, aliases)?;
    match step {
        // "5/2" has no range to step over.
        Some(_) => Err(EngineError::InvalidCron(format!(
            "step requires '*' or a range, found '{raw}'"
        ))),
        None => Ok(Part::Value(value)),
    }
}

fn parse_value(
    text: &str,
    min: u32,
    max: u32,
    aliases: Option<&[&str]>,
) -> EngineResult<u32> {
    let lower = text.to_ascii_lowercase();
    if let Some(names) = aliases {
        if let Some(index) = names.iter().position(|n| *n == lower) {
            return Ok(min + index as u32);
        }
    }
    let mut value: u32 = text
        .parse()
        .map_err(|_| EngineError::InvalidCron(format!("bad value '{text}'")))?;
    // Weekday 7 is Sunday.
    if max == 6 && value == 7 {
        value = 0;
    }
    Ok(value.clamp(min, max))
}
