use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::window::WindowDuration;

pub const WINDOW_SECONDS_VAR: &str = "OHLCV_WINDOW_SECONDS";
pub const INSTRUMENT_FILTER_VAR: &str = "INSTRUMENT_FILTER";

/// Immutable settings fixed at startup and handed to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    window: WindowDuration,
    instrument_filter: Option<BTreeSet<String>>,
}

impl AggregatorConfig {
    pub fn new(window: WindowDuration) -> Self {
        Self {
            window,
            instrument_filter: None,
        }
    }

    /// Restrict aggregation to the given instruments. An empty list means no filter.
    pub fn with_instrument_filter<I, S>(mut self, instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = instruments
            .into_iter()
            .map(Into::into)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.instrument_filter = (!set.is_empty()).then_some(set);
        self
    }

    /// Build from `OHLCV_WINDOW_SECONDS` and `INSTRUMENT_FILTER` as resolved by
    /// `lookup`, e.g. `|var| std::env::var(var).ok()`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = lookup(WINDOW_SECONDS_VAR).ok_or(ConfigError::Missing {
            var: WINDOW_SECONDS_VAR,
        })?;
        let secs: i64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
            var: WINDOW_SECONDS_VAR,
            reason: format!("'{raw}': {e}"),
        })?;
        let config = Self::new(WindowDuration::from_secs(secs)?);

        Ok(match lookup(INSTRUMENT_FILTER_VAR) {
            Some(list) => config.with_instrument_filter(list.split(',')),
            None => config,
        })
    }

    pub fn window(&self) -> WindowDuration {
        self.window
    }

    pub fn instrument_filter(&self) -> Option<&BTreeSet<String>> {
        self.instrument_filter.as_ref()
    }

    pub fn allows(&self, instrument: &str) -> bool {
        self.instrument_filter
            .as_ref()
            .is_none_or(|set| set.contains(instrument))
    }
}
