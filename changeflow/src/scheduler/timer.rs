use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Converts a UTC wall-clock time to a tokio [`Instant`].
///
/// Times that already passed map to "now", so a job that fell behind runs immediately instead of
/// waiting for its next slot.
pub fn date_time_to_instant(date_time: DateTime<Utc>) -> Instant {
    let now = Utc::now();
    let delay = (date_time - now).to_std().unwrap_or(Duration::ZERO);

    Instant::now() + delay
}

/// Sleeps until the given UTC time.
pub async fn sleep_until_date_time(date_time: DateTime<Utc>) {
    tokio::time::sleep_until(date_time_to_instant(date_time)).await;
}
