use serde::Serialize;

use crate::error::{ConfigError, TradeError};

/// Length of a tumbling window. Windows are aligned to the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowDuration {
    millis: i64,
}

impl WindowDuration {
    pub fn from_secs(secs: i64) -> Result<Self, ConfigError> {
        if secs <= 0 {
            return Err(ConfigError::NonPositiveWindow {
                value: secs,
                unit: "s",
            });
        }
        let millis = secs.checked_mul(1000).ok_or_else(|| ConfigError::Invalid {
            var: "window duration",
            reason: format!("{secs}s overflows milliseconds"),
        })?;
        Ok(Self { millis })
    }

    pub fn from_millis(millis: i64) -> Result<Self, ConfigError> {
        if millis <= 0 {
            return Err(ConfigError::NonPositiveWindow {
                value: millis,
                unit: "ms",
            });
        }
        Ok(Self { millis })
    }

    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    /// Start of the half-open window `[start, start + duration)` containing `event_time_ms`.
    pub fn assign(&self, event_time_ms: i64) -> Result<i64, TradeError> {
        if event_time_ms < 0 {
            return Err(TradeError::NegativeEventTime(event_time_ms));
        }
        let start = event_time_ms - event_time_ms.rem_euclid(self.millis);
        // The end must be representable for close detection to work.
        start
            .checked_add(self.millis)
            .ok_or(TradeError::EventTimeOverflow(event_time_ms))?;
        Ok(start)
    }

    /// Exclusive end of the window starting at `window_start`.
    pub fn window_end(&self, window_start: i64) -> i64 {
        window_start.saturating_add(self.millis)
    }
}

/// Identity of one candle: an instrument and the start of its window.
///
/// Ordered by instrument, then start, so a range over one instrument yields
/// its windows oldest first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WindowKey {
    pub instrument: String,
    pub window_start: i64,
}

impl WindowKey {
    pub fn new(instrument: impl Into<String>, window_start: i64) -> Self {
        Self {
            instrument: instrument.into(),
            window_start,
        }
    }
}
