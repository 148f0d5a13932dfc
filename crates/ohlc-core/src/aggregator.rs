use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::candle::Candle;
use crate::config::AggregatorConfig;
use crate::emitter::{CandleSink, Emitter};
use crate::error::AggregateError;
use crate::state::CandleStateStore;
use crate::trade::{RawTrade, Trade};
use crate::window::WindowKey;

/// Counters for everything the aggregator accepted, dropped or emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub accepted: u64,
    pub invalid: u64,
    /// Trades whose window had already closed. These are lost, not re-aggregated.
    pub late_dropped: u64,
    pub filtered: u64,
    pub emitted: u64,
    pub emit_failures: u64,
}

/// Outcome of ingesting one trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    Accepted {
        key: WindowKey,
        /// The trade opened a new window.
        created: bool,
        /// Windows of this instrument now closed and awaiting emission.
        closed: usize,
    },
    /// Instrument is outside the configured allow-list.
    Filtered,
}

/// Tumbling-window OHLCV aggregator.
///
/// A window is open while its key is in the store. It closes once a trade of
/// the same instrument reaches the window end; the per-instrument watermark is
/// the largest accepted event time. Closed windows are emitted oldest first and
/// removed only after the sink accepted them.
pub struct Aggregator {
    config: AggregatorConfig,
    store: CandleStateStore,
    watermarks: HashMap<String, i64>,
    stats: AggregatorStats,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            store: CandleStateStore::new(config.window()),
            config,
            watermarks: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn store(&self) -> &CandleStateStore {
        &self.store
    }

    pub fn watermark(&self, instrument: &str) -> Option<i64> {
        self.watermarks.get(instrument).copied()
    }

    /// Validate a wire record and ingest it.
    pub fn ingest_raw(&mut self, raw: RawTrade) -> Result<Ingest, AggregateError> {
        match Trade::try_from(raw) {
            Ok(trade) => self.ingest(&trade),
            Err(e) => {
                self.stats.invalid += 1;
                warn!(error = %e, "rejected invalid trade");
                Err(e.into())
            }
        }
    }

    /// Fold a trade into its window and advance the instrument's watermark.
    /// Emission is a separate step, see [`Aggregator::emit_closed`].
    pub fn ingest(&mut self, trade: &Trade) -> Result<Ingest, AggregateError> {
        let instrument = trade.instrument();
        if !self.config.allows(instrument) {
            self.stats.filtered += 1;
            debug!(instrument, "ignored trade outside instrument filter");
            return Ok(Ingest::Filtered);
        }

        let window = self.config.window();
        let window_start = match window.assign(trade.event_time_ms()) {
            Ok(start) => start,
            Err(e) => {
                self.stats.invalid += 1;
                warn!(instrument, error = %e, "rejected invalid trade");
                return Err(e.into());
            }
        };
        let window_end = window.window_end(window_start);

        if let Some(&watermark) = self.watermarks.get(instrument)
            && window_end <= watermark
        {
            self.stats.late_dropped += 1;
            warn!(
                instrument,
                event_time_ms = trade.event_time_ms(),
                window_end,
                watermark,
                late_dropped = self.stats.late_dropped,
                "dropped late trade for closed window"
            );
            return Err(AggregateError::ClockRegression {
                instrument: instrument.to_string(),
                event_time_ms: trade.event_time_ms(),
                window_end_ms: window_end,
                watermark_ms: watermark,
            });
        }

        let key = WindowKey::new(instrument, window_start);
        let (state, created) = self.store.get_or_create(key.clone(), trade);
        if !created && let Err(e) = state.apply(trade) {
            self.stats.invalid += 1;
            warn!(instrument, window_start, error = %e, "rejected invalid trade");
            return Err(e.into());
        }

        let watermark = match self.watermarks.get_mut(instrument) {
            Some(w) => {
                *w = (*w).max(trade.event_time_ms());
                *w
            }
            None => {
                self.watermarks
                    .insert(instrument.to_string(), trade.event_time_ms());
                trade.event_time_ms()
            }
        };
        self.stats.accepted += 1;

        let closed = self.store.keys_older_than(instrument, watermark).len();
        debug!(
            instrument,
            window_start,
            price = %trade.price(),
            quantity = %trade.quantity(),
            created,
            closed,
            "applied trade"
        );

        Ok(Ingest::Accepted {
            key,
            created,
            closed,
        })
    }

    /// Emit every closed window of `instrument`, oldest first.
    ///
    /// A candle leaves the store only once the sink accepted it. On a sink
    /// error the failing candle and all later ones stay put for a retry.
    pub async fn emit_closed<S: CandleSink>(
        &mut self,
        emitter: &mut Emitter<S>,
        instrument: &str,
    ) -> Result<Vec<Candle>, AggregateError> {
        let Some(watermark) = self.watermark(instrument) else {
            return Ok(Vec::new());
        };
        let window = self.config.window();

        let mut emitted = Vec::new();
        for key in self.store.keys_older_than(instrument, watermark) {
            let Some(state) = self.store.get(&key) else {
                continue;
            };
            let candle = state.finalize(&key, window.window_end(key.window_start));

            if let Err(e) = emitter.emit(&candle).await {
                self.stats.emit_failures += 1;
                warn!(
                    instrument,
                    window_start = key.window_start,
                    error = %e,
                    "emission failed, candle kept for retry"
                );
                return Err(e.into());
            }

            self.store.remove(&key);
            self.stats.emitted += 1;
            emitted.push(candle);
        }

        Ok(emitted)
    }

    /// Number of closed windows still waiting for a successful emission.
    pub fn pending(&self) -> usize {
        self.watermarks
            .iter()
            .map(|(instrument, &watermark)| self.store.keys_older_than(instrument, watermark).len())
            .sum()
    }

    /// Re-attempt emission of every closed window across all instruments.
    pub async fn retry_pending<S: CandleSink>(
        &mut self,
        emitter: &mut Emitter<S>,
    ) -> Result<Vec<Candle>, AggregateError> {
        let mut instruments: Vec<String> = self
            .watermarks
            .iter()
            .filter(|(instrument, watermark)| {
                !self
                    .store
                    .keys_older_than(instrument, **watermark)
                    .is_empty()
            })
            .map(|(instrument, _)| instrument.clone())
            .collect();
        instruments.sort();

        let mut emitted = Vec::new();
        for instrument in &instruments {
            emitted.extend(self.emit_closed(emitter, instrument).await?);
        }
        Ok(emitted)
    }

    /// Ingest a wire record and emit whatever it closed.
    ///
    /// A `SinkUnavailable` error means the trade itself was applied; only the
    /// emission needs retrying.
    pub async fn process<S: CandleSink>(
        &mut self,
        raw: RawTrade,
        emitter: &mut Emitter<S>,
    ) -> Result<Vec<Candle>, AggregateError> {
        let ingest = self.ingest_raw(raw)?;
        self.emit_after(ingest, emitter).await
    }

    /// Same as [`Aggregator::process`] for an already validated trade.
    pub async fn process_trade<S: CandleSink>(
        &mut self,
        trade: &Trade,
        emitter: &mut Emitter<S>,
    ) -> Result<Vec<Candle>, AggregateError> {
        let ingest = self.ingest(trade)?;
        self.emit_after(ingest, emitter).await
    }

    async fn emit_after<S: CandleSink>(
        &mut self,
        ingest: Ingest,
        emitter: &mut Emitter<S>,
    ) -> Result<Vec<Candle>, AggregateError> {
        match ingest {
            Ingest::Accepted { key, closed, .. } if closed > 0 => {
                self.emit_closed(emitter, &key.instrument).await
            }
            _ => Ok(Vec::new()),
        }
    }
}
