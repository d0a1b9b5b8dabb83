use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use tracing::warn;

use crate::model::{Ms, Span};

const MINUTE_MS: Ms = 60_000;

/// The fixed daily template availability is computed against.
/// Hours are UTC; buckets run from `start_hour` to `end_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub bucket_minutes: u32,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 18,
            bucket_minutes: 60,
        }
    }
}

impl WorkingHours {
    pub fn is_valid(&self) -> bool {
        self.start_hour < self.end_hour
            && self.end_hour <= 24
            && self.bucket_minutes > 0
            && ((self.end_hour - self.start_hour) * 60) % self.bucket_minutes == 0
    }

    /// Working window of `date`.
    pub fn window(&self, date: NaiveDate) -> Span {
        let day = day_start_ms(date);
        Span::new(
            day + Ms::from(self.start_hour) * 60 * MINUTE_MS,
            day + Ms::from(self.end_hour) * 60 * MINUTE_MS,
        )
    }

    /// Ordered bucket list for `date`.
    pub fn buckets(&self, date: NaiveDate) -> Vec<Span> {
        let window = self.window(date);
        let step = Ms::from(self.bucket_minutes) * MINUTE_MS;
        let mut buckets = Vec::new();
        let mut start = window.start;
        while start + step <= window.end {
            buckets.push(Span::new(start, start + step));
            start += step;
        }
        buckets
    }
}

/// Midnight UTC of `date` in Unix ms.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// The whole of `date`, midnight to midnight.
pub fn day_span(date: NaiveDate) -> Span {
    let start = day_start_ms(date);
    Span::new(start, start + 24 * 60 * MINUTE_MS)
}

/// Time-of-day range on `date`. `None` if `end` is not after `start`;
/// `NaiveTime::MIN` as `end` means the following midnight.
pub fn time_range_on(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Option<Span> {
    let day = day_start_ms(date);
    let offset = |t: NaiveTime| {
        let since_midnight = t.signed_duration_since(NaiveTime::MIN);
        since_midnight.num_milliseconds()
    };
    let end_ms = if end == NaiveTime::MIN {
        24 * 60 * MINUTE_MS
    } else {
        offset(end)
    };
    Span::checked(day + offset(start), day + end_ms)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// How long one attempt waits for a scoped lock.
    pub lock_timeout: Duration,
    /// Extra attempts after the first lock timeout.
    pub lock_retries: u32,
    pub working_hours: WorkingHours,
    /// Compact on startup once the replayed log holds this many events.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_timeout: Duration::from_millis(2_000),
            lock_retries: 3,
            working_hours: WorkingHours::default(),
            compact_threshold: 1_000,
            metrics_port: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw}");
            None
        }
    }
}

impl Config {
    /// Read `COACHBOOK_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let working_hours = WorkingHours {
            start_hour: env_parse("COACHBOOK_DAY_START_HOUR")
                .unwrap_or(defaults.working_hours.start_hour),
            end_hour: env_parse("COACHBOOK_DAY_END_HOUR").unwrap_or(defaults.working_hours.end_hour),
            bucket_minutes: env_parse("COACHBOOK_BUCKET_MINUTES")
                .unwrap_or(defaults.working_hours.bucket_minutes),
        };
        let working_hours = if working_hours.is_valid() {
            working_hours
        } else {
            warn!(?working_hours, "invalid working hours, using defaults");
            defaults.working_hours
        };

        Self {
            data_dir: std::env::var("COACHBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_timeout: env_parse("COACHBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            lock_retries: env_parse("COACHBOOK_LOCK_RETRIES").unwrap_or(defaults.lock_retries),
            working_hours,
            compact_threshold: env_parse("COACHBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env_parse("COACHBOOK_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    #[test]
    fn default_buckets_are_hourly_business_hours() {
        let wh = WorkingHours::default();
        let buckets = wh.buckets(date());
        let day = day_start_ms(date());
        assert_eq!(buckets.len(), 9);
        assert_eq!(buckets[0], Span::new(day + 9 * H, day + 10 * H));
        assert_eq!(buckets[8], Span::new(day + 17 * H, day + 18 * H));
    }

    #[test]
    fn half_hour_buckets() {
        let wh = WorkingHours {
            start_hour: 10,
            end_hour: 12,
            bucket_minutes: 30,
        };
        assert_eq!(wh.buckets(date()).len(), 4);
    }

    #[test]
    fn invalid_working_hours() {
        let inverted = WorkingHours {
            start_hour: 18,
            end_hour: 9,
            bucket_minutes: 60,
        };
        assert!(!inverted.is_valid());
        let ragged = WorkingHours {
            start_hour: 9,
            end_hour: 10,
            bucket_minutes: 45,
        };
        assert!(!ragged.is_valid());
        assert!(WorkingHours::default().is_valid());
    }

    #[test]
    fn day_start_is_utc_midnight() {
        // 2025-03-14T00:00:00Z
        assert_eq!(day_start_ms(date()), 1_741_910_400_000);
        assert_eq!(day_span(date()).duration_ms(), 24 * H);
    }

    #[test]
    fn time_range_on_date() {
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        let day = day_start_ms(date());
        assert_eq!(
            time_range_on(date(), t(14), t(15)),
            Some(Span::new(day + 14 * H, day + 15 * H))
        );
        assert_eq!(
            time_range_on(date(), t(23), NaiveTime::MIN),
            Some(Span::new(day + 23 * H, day + 24 * H))
        );
        assert_eq!(time_range_on(date(), t(15), t(14)), None);
    }
}
