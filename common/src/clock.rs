use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Earliest wall-clock reading treated as synchronized (2024-01-01T00:00:00Z).
pub const MIN_SYNCED_EPOCH_SECS: i64 = 1_704_067_200;

/// One reading of both clocks, taken once per loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    pub ms: u64,
    pub epoch_secs: Option<i64>,
}

impl Now {
    pub fn monotonic(ms: u64) -> Self {
        Self {
            ms,
            epoch_secs: None,
        }
    }

    pub fn with_epoch(ms: u64, epoch_secs: i64) -> Self {
        Self {
            ms,
            epoch_secs: Some(epoch_secs),
        }
    }

    /// Drops wall-clock readings from before time sync.
    pub fn synced(ms: u64, epoch_secs: i64) -> Self {
        Self {
            ms,
            epoch_secs: (epoch_secs >= MIN_SYNCED_EPOCH_SECS).then_some(epoch_secs),
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS` in the configured timezone, empty without a synced clock.
pub fn format_start_date_time(epoch_secs: Option<i64>, tz: Tz) -> String {
    epoch_secs
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|utc| {
            utc.with_timezone(&tz)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_default()
}
