//! Five-field cron parsing and the one-minute tick driver for the
//! `scheduled` entrypoint.
//!
//! Matching is membership-based: an expression matches a timestamp iff each
//! field matches the corresponding date component. Ticks are fire-and-forget
//! so a slow handler never blocks the next dispatch.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};

#[derive(Debug, Clone, Copy)]
struct FieldRange {
    min: u32,
    max: u32,
}

const MINUTE: FieldRange = FieldRange { min: 0, max: 59 };
const HOUR: FieldRange = FieldRange { min: 0, max: 23 };
const DAY_OF_MONTH: FieldRange = FieldRange { min: 1, max: 31 };
const MONTH: FieldRange = FieldRange { min: 1, max: 12 };
const DAY_OF_WEEK: FieldRange = FieldRange { min: 0, max: 6 };

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression: membership sets for the five fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    pub source: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
}

impl CronExpr {
    /// True iff every field matches the date (month 1-based, Sunday = 0).
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.days_of_month.contains(&at.day())
            && self.months.contains(&at.month())
            && self
                .days_of_week
                .contains(&at.weekday().num_days_from_sunday())
    }
}

/// Parse a cron expression: the five-field standard plus named shortcuts.
pub fn parse_cron(expr: &str) -> Result<CronExpr> {
    let normalized = match expr.trim() {
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        "@weekly" => "0 0 * * 0",
        "@monthly" => "0 0 1 * *",
        "@yearly" | "@annually" => "0 0 1 1 *",
        other => other,
    };

    let fields: Vec<&str> = normalized.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(anyhow!(
            "cron expression '{expr}' must have 5 fields, got {}",
            fields.len()
        ));
    }

    Ok(CronExpr {
        source: expr.trim().to_string(),
        minutes: parse_field(fields[0], MINUTE, None)?,
        hours: parse_field(fields[1], HOUR, None)?,
        days_of_month: parse_field(fields[2], DAY_OF_MONTH, None)?,
        months: parse_field(fields[3], MONTH, Some(&MONTH_NAMES))?,
        days_of_week: parse_field(fields[4], DAY_OF_WEEK, Some(&DAY_NAMES))?,
    })
}

/// Parse one field: `*`, `V`, `A-B`, `A-B/S`, `*/S`, and comma lists, with
/// optional month/day names. Day-of-week 7 collapses to 0.
fn parse_field(field: &str, range: FieldRange, names: Option<&[&str]>) -> Result<BTreeSet<u32>> {
    let mut out = BTreeSet::new();
    for part in field.split(',') {
        let (spec, step) = match part.split_once('/') {
            Some((spec, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| anyhow!("invalid cron step '{step}'"))?;
                if step == 0 {
                    return Err(anyhow!("cron step cannot be zero"));
                }
                (spec, step)
            }
            None => (part, 1),
        };

        let (start, end) = if spec == "*" {
            (range.min, range.max)
        } else if let Some((a, b)) = spec.split_once('-') {
            (
                parse_value(a, range, names)?,
                parse_value(b, range, names)?,
            )
        } else {
            let value = parse_value(spec, range, names)?;
            // A single value with a step means "from value to max".
            if step > 1 {
                (value, range.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(anyhow!("invalid cron range '{part}'"));
        }
        let mut v = start;
        while v <= end {
            out.insert(v);
            v += step;
        }
    }
    Ok(out)
}

fn parse_value(value: &str, range: FieldRange, names: Option<&[&str]>) -> Result<u32> {
    let upper = value.to_ascii_uppercase();
    if let Some(names) = names {
        if let Some(index) = names.iter().position(|n| *n == upper) {
            // Names map onto the field's own base (months are 1-based).
            return Ok(range.min + index as u32);
        }
    }
    let mut n: u32 = value
        .parse()
        .map_err(|_| anyhow!("invalid cron value '{value}'"))?;
    // Day-of-week wildcard 7 is Sunday.
    if range.max == 6 && n == 7 {
        n = 0;
    }
    if n < range.min || n > range.max {
        return Err(anyhow!(
            "cron value {n} out of range {}-{}",
            range.min,
            range.max
        ));
    }
    Ok(n)
}

/// Milliseconds until the next top of the minute, for tick alignment.
pub fn ms_until_next_minute(now: DateTime<Utc>) -> u64 {
    let ms_into_minute = (now.second() as u64) * 1000 + now.timestamp_subsec_millis() as u64;
    60_000 - ms_into_minute.min(59_999)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let cron = parse_cron("*/5 * * * *").unwrap();
        assert!(cron.matches(at(2025, 1, 1, 0, 0)));
        assert!(cron.matches(at(2025, 1, 1, 0, 5)));
        assert!(!cron.matches(at(2025, 1, 1, 0, 3)));
    }

    #[test]
    fn ranges_lists_and_steps() {
        let cron = parse_cron("0-10/2,30 9-17 * * 1-5").unwrap();
        assert!(cron.matches(at(2025, 1, 6, 9, 4))); // Monday
        assert!(cron.matches(at(2025, 1, 6, 9, 30)));
        assert!(!cron.matches(at(2025, 1, 6, 9, 5)));
        assert!(!cron.matches(at(2025, 1, 4, 9, 4))); // Saturday
        assert!(!cron.matches(at(2025, 1, 6, 8, 4)));
    }

    #[test]
    fn month_and_day_names() {
        let cron = parse_cron("0 0 * JAN,jul SUN").unwrap();
        assert!(cron.matches(at(2025, 1, 5, 0, 0))); // a January Sunday
        assert!(cron.matches(at(2025, 7, 6, 0, 0))); // a July Sunday
        assert!(!cron.matches(at(2025, 2, 2, 0, 0))); // February Sunday
        assert!(!cron.matches(at(2025, 1, 6, 0, 0))); // January Monday
    }

    #[test]
    fn day_of_week_seven_is_sunday() {
        let seven = parse_cron("0 0 * * 7").unwrap();
        let zero = parse_cron("0 0 * * 0").unwrap();
        assert_eq!(seven.days_of_week, zero.days_of_week);
    }

    #[test]
    fn named_shortcuts() {
        assert_eq!(parse_cron("@daily").unwrap(), parse_cron("0 0 * * *").unwrap());
        assert_eq!(parse_cron("@hourly").unwrap(), parse_cron("0 * * * *").unwrap());
        assert_eq!(parse_cron("@weekly").unwrap(), parse_cron("0 0 * * 0").unwrap());
        assert_eq!(parse_cron("@monthly").unwrap(), parse_cron("0 0 1 * *").unwrap());
        assert_eq!(parse_cron("@yearly").unwrap(), parse_cron("0 0 1 1 *").unwrap());
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse_cron("* * * *").is_err());
        assert!(parse_cron("61 * * * *").is_err());
        assert!(parse_cron("* * * * 8").is_err());
        assert!(parse_cron("*/0 * * * *").is_err());
        assert!(parse_cron("5-1 * * * *").is_err());
        assert!(parse_cron("x * * * *").is_err());
    }

    #[test]
    fn tick_alignment_is_within_a_minute() {
        let ms = ms_until_next_minute(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap());
        assert_eq!(ms, 30_000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any minute the set contains matches a date built at that
            /// minute, and vice versa.
            #[test]
            fn minute_membership_matches(minute in 0u32..60) {
                let cron = parse_cron("*/7 * * * *").unwrap();
                let date = Utc.with_ymd_and_hms(2025, 3, 10, 12, minute, 0).unwrap();
                prop_assert_eq!(cron.matches(date), minute % 7 == 0);
            }

            /// A parsed single-value field matches exactly that value.
            #[test]
            fn exact_minute_field(minute in 0u32..60) {
                let cron = parse_cron(&format!("{minute} * * * *")).unwrap();
                for probe in 0u32..60 {
                    let date = Utc.with_ymd_and_hms(2025, 3, 10, 12, probe, 0).unwrap();
                    prop_assert_eq!(cron.matches(date), probe == minute);
                }
            }
        }
    }
}
