use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ChangeflowError, ChangeflowResult, ErrorKind};

/// Upper bound on the days searched for the next match; covers leap-day-only expressions.
const MAX_SEARCH_DAYS: i64 = 366 * 8;

/// A five-field cron expression evaluated in UTC.
///
/// Fields are minute, hour, day of month, month and day of week. Each field accepts `*`, `*/n`,
/// `a`, `a-b`, `a-b/n`, `a/n` and comma-separated lists of those. Days of week go from 0 to 7 where
/// both 0 and 7 mean Sunday. When both day fields are restricted a day matching either one fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day of month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day of week",
    min: 0,
    max: 7,
};

impl CronSchedule {
    pub fn parse(expression: &str) -> ChangeflowResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            bail!(
                ErrorKind::ConfigurationError,
                "Invalid cron expression",
                format!(
                    "Expected 5 fields (minute hour day-of-month month day-of-week), found {} in `{expression}`",
                    fields.len()
                )
            );
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        // 7 is an alias of Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
            day_of_month_restricted: !fields[2].starts_with('*'),
            day_of_week_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns the first matching minute strictly after `after`.
    ///
    /// Returns `None` if nothing matches within the next eight years, e.g. for `0 0 31 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|time| time.with_nanosecond(0))?
            + Duration::minutes(1);
        let start_date = start.date_naive();

        for offset in 0..MAX_SEARCH_DAYS {
            let date = start_date.checked_add_signed(Duration::days(offset))?;
            if !self.matches_day(date) {
                continue;
            }

            let (first_hour, first_minute) = if offset == 0 {
                (start.hour(), start.minute())
            } else {
                (0, 0)
            };

            for hour in first_hour..24 {
                if !bit_set(self.hours, hour) {
                    continue;
                }

                let from_minute = if hour == first_hour { first_minute } else { 0 };
                for minute in from_minute..60 {
                    if bit_set(self.minutes, minute) {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
        }

        None
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !bit_set(self.months, date.month()) {
            return false;
        }

        let day_of_month = bit_set(self.days_of_month, date.day());
        let day_of_week = bit_set(self.days_of_week, date.weekday().num_days_from_sunday());

        if self.day_of_month_restricted && self.day_of_week_restricted {
            day_of_month || day_of_week
        } else {
            day_of_month && day_of_week
        }
    }
}

impl FromStr for CronSchedule {
    type Err = ChangeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn bit_set(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

fn parse_field(field: &str, spec: FieldSpec) -> ChangeflowResult<u64> {
    let mut bits = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(parse_number(step, spec)?)),
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((start, end)) = range.split_once('-') {
            (parse_number(start, spec)?, parse_number(end, spec)?)
        } else {
            let start = parse_number(range, spec)?;
            // `a/n` runs from `a` to the end of the field.
            (start, if step.is_some() { spec.max } else { start })
        };

        if start < spec.min || end > spec.max || start > end {
            bail!(
                ErrorKind::ConfigurationError,
                "Invalid cron expression",
                format!(
                    "The {} range `{part}` must lie within {}-{}",
                    spec.name, spec.min, spec.max
                )
            );
        }

        let step = step.unwrap_or(1);
        if step == 0 {
            bail!(
                ErrorKind::ConfigurationError,
                "Invalid cron expression",
                format!("The {} step in `{part}` must be greater than zero", spec.name)
            );
        }

        let mut value = start;
        while value <= end {
            bits |= 1 << value;
            value += step;
        }
    }

    Ok(bits)
}

fn parse_number(value: &str, spec: FieldSpec) -> ChangeflowResult<u32> {
    value.parse::<u32>().map_err(|err| {
        crate::changeflow_error!(
            ErrorKind::ConfigurationError,
            "Invalid cron expression",
            format!("`{value}` is not a valid {} value", spec.name),
            source: err
        )
    })
}
