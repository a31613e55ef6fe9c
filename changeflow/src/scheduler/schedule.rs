use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::bail;
use crate::changeflow_error;
use crate::error::{ChangeflowError, ChangeflowResult, ErrorKind};
use crate::scheduler::cron::CronSchedule;

const CRON_PREFIX: &str = "USING CRON";
const DAILY_PREFIX: &str = "AT";
const CRON_TIMEZONE: &str = "UTC";

/// When a job runs.
///
/// Schedules are parsed once when a job is defined. Accepted forms:
///
/// - `"5 minutes"`, `"30s"`, `"250ms"`, `"1 hour"`: fixed interval.
/// - `"USING CRON 0 * * * * UTC"` or a bare `"0 * * * *"`: five-field cron expression in UTC.
/// - `"AT 02:30"`: once a day at the given UTC time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    FixedInterval(Duration),
    Cron(CronSchedule),
    DailyAt(NaiveTime),
}

impl Schedule {
    pub fn parse(expression: &str) -> ChangeflowResult<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            bail!(
                ErrorKind::ConfigurationError,
                "Invalid schedule",
                "The schedule expression is empty"
            );
        }

        if let Some(rest) = strip_prefix_ignore_case(expression, CRON_PREFIX) {
            return parse_cron(rest).map(Schedule::Cron);
        }

        if let Some(rest) = strip_prefix_ignore_case(expression, DAILY_PREFIX) {
            let time = NaiveTime::parse_from_str(rest.trim(), "%H:%M").map_err(|err| {
                changeflow_error!(
                    ErrorKind::ConfigurationError,
                    "Invalid schedule",
                    format!("`{}` is not a time of day in HH:MM form", rest.trim()),
                    source: err
                )
            })?;

            return Ok(Schedule::DailyAt(time));
        }

        if expression.split_whitespace().count() == 5 {
            return CronSchedule::parse(expression).map(Schedule::Cron);
        }

        parse_interval(expression).map(Schedule::FixedInterval)
    }

    /// Returns the first time strictly after `after` at which the job is due.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::FixedInterval(interval) => {
                let interval = ChronoDuration::from_std(*interval).ok()?;
                after.checked_add_signed(interval)
            }
            Schedule::Cron(cron) => cron.next_after(after),
            Schedule::DailyAt(time) => {
                let today = Utc.from_utc_datetime(&after.date_naive().and_time(*time));
                if today > after {
                    Some(today)
                } else {
                    today.checked_add_signed(ChronoDuration::days(1))
                }
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = ChangeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::FixedInterval(interval) => write!(f, "every {}ms", interval.as_millis()),
            Schedule::Cron(cron) => write!(f, "{CRON_PREFIX} {cron} {CRON_TIMEZONE}"),
            Schedule::DailyAt(time) => write!(f, "{DAILY_PREFIX} {}", time.format("%H:%M")),
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    let rest = &value[prefix.len()..];

    // The prefix must be followed by whitespace, so `ATX` or `5 AT` are not mistaken for it.
    if head.eq_ignore_ascii_case(prefix) && rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

fn parse_cron(rest: &str) -> ChangeflowResult<CronSchedule> {
    let mut fields: Vec<&str> = rest.split_whitespace().collect();

    if fields.len() == 6 {
        let timezone = fields.pop().unwrap_or_default();
        if !timezone.eq_ignore_ascii_case(CRON_TIMEZONE) {
            bail!(
                ErrorKind::ConfigurationError,
                "Invalid schedule",
                format!("Cron schedules are evaluated in UTC, `{timezone}` is not supported")
            );
        }
    }

    CronSchedule::parse(&fields.join(" "))
}

fn parse_interval(expression: &str) -> ChangeflowResult<Duration> {
    let digits_end = expression
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(expression.len());
    let (amount, unit) = expression.split_at(digits_end);

    let invalid = || {
        changeflow_error!(
            ErrorKind::ConfigurationError,
            "Invalid schedule",
            format!(
                "`{expression}` is neither an interval such as `5 minutes`, a cron expression nor `AT HH:MM`"
            )
        )
    };

    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    if amount == 0 {
        bail!(
            ErrorKind::ConfigurationError,
            "Invalid schedule",
            format!("The interval of `{expression}` must be greater than zero")
        );
    }

    let interval = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => Duration::from_millis(amount),
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(amount),
        "m" | "min" | "mins" | "minute" | "minutes" => {
            Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?)
        }
        "h" | "hr" | "hrs" | "hour" | "hours" => {
            Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?)
        }
        _ => return Err(invalid()),
    };

    Ok(interval)
}
