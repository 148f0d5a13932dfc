use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::TradeError;
use crate::trade::Trade;
use crate::window::WindowKey;

/// Running OHLCV accumulator for a window that is still open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleState {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    trade_count: u64,
}

impl CandleState {
    /// Seed a candle from the first trade observed in its window.
    pub fn open_with(trade: &Trade) -> Self {
        Self {
            open: trade.price(),
            high: trade.price(),
            low: trade.price(),
            close: trade.price(),
            volume: trade.quantity(),
            trade_count: 1,
        }
    }

    /// Fold a trade in. `close` follows arrival order, not event time.
    ///
    /// Fails without touching the state when the window volume would overflow.
    pub fn apply(&mut self, trade: &Trade) -> Result<(), TradeError> {
        let volume = self
            .volume
            .checked_add(trade.quantity())
            .ok_or(TradeError::VolumeOverflow(trade.quantity()))?;

        self.high = self.high.max(trade.price());
        self.low = self.low.min(trade.price());
        self.close = trade.price();
        self.volume = volume;
        self.trade_count += 1;
        Ok(())
    }

    pub fn finalize(&self, key: &WindowKey, window_end: i64) -> Candle {
        Candle {
            instrument: key.instrument.clone(),
            window_start: key.window_start,
            window_end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
        }
    }

    pub fn open(&self) -> Decimal {
        self.open
    }

    pub fn high(&self) -> Decimal {
        self.high
    }

    pub fn low(&self) -> Decimal {
        self.low
    }

    pub fn close(&self) -> Decimal {
        self.close
    }

    pub fn volume(&self) -> Decimal {
        self.volume
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }
}

/// A finalized OHLCV candle for one instrument over `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub window_start: i64,
    pub window_end: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
}

impl Candle {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.instrument.clone(), self.window_start)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.window_start)
    }

    /// Output shape handed to downstream consumers.
    pub fn to_record(&self) -> CandleRecord<'_> {
        CandleRecord {
            candle: self,
            timestamp_ms: self.window_end,
        }
    }
}

/// A candle plus `timestamp_ms`, the window end that downstream consumers key on.
#[derive(Debug, Serialize)]
pub struct CandleRecord<'a> {
    #[serde(flatten)]
    pub candle: &'a Candle,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(price: Decimal, qty: Decimal, t: i64) -> Trade {
        Trade::new("BTC/USD", price, qty, t).unwrap()
    }

    #[test]
    fn first_trade_seeds_every_price() {
        let state = CandleState::open_with(&trade(dec!(100), dec!(1), 0));
        assert_eq!(state.open(), dec!(100));
        assert_eq!(state.high(), dec!(100));
        assert_eq!(state.low(), dec!(100));
        assert_eq!(state.close(), dec!(100));
        assert_eq!(state.volume(), dec!(1));
        assert_eq!(state.trade_count(), 1);
    }

    #[test]
    fn apply_tracks_extremes_and_last_price() {
        let mut state = CandleState::open_with(&trade(dec!(100), dec!(1), 0));
        state.apply(&trade(dec!(105), dec!(2), 30_000)).unwrap();
        state.apply(&trade(dec!(98), dec!(0.5), 10_000)).unwrap();
        state.apply(&trade(dec!(101), dec!(0.25), 20_000)).unwrap();

        assert_eq!(state.open(), dec!(100));
        assert_eq!(state.high(), dec!(105));
        assert_eq!(state.low(), dec!(98));
        // Last applied wins even though its event time is not the latest.
        assert_eq!(state.close(), dec!(101));
        assert_eq!(state.volume(), dec!(3.75));
        assert_eq!(state.trade_count(), 4);
    }

    #[test]
    fn volume_overflow_leaves_state_untouched() {
        let huge = Decimal::MAX - dec!(1);
        let mut state = CandleState::open_with(&trade(dec!(100), huge, 0));
        let before = state.clone();

        let err = state.apply(&trade(dec!(200), huge, 1_000)).unwrap_err();

        assert_eq!(err, TradeError::VolumeOverflow(huge));
        assert_eq!(state, before);
    }

    #[test]
    fn finalize_copies_key_and_window() {
        let state = CandleState::open_with(&trade(dec!(100), dec!(1), 0));
        let candle = state.finalize(&WindowKey::new("BTC/USD", 0), 60_000);
        assert_eq!(candle.instrument, "BTC/USD");
        assert_eq!(candle.window_start, 0);
        assert_eq!(candle.window_end, 60_000);
        assert_eq!(candle.key(), WindowKey::new("BTC/USD", 0));
        assert_eq!(
            candle.start_time().unwrap(),
            DateTime::from_timestamp(0, 0).unwrap()
        );
    }

    #[test]
    fn record_serializes_flat_with_timestamp() {
        let state = CandleState::open_with(&trade(dec!(100.5), dec!(1), 0));
        let candle = state.finalize(&WindowKey::new("BTC/USD", 0), 60_000);
        let json = serde_json::to_value(candle.to_record()).unwrap();

        assert_eq!(json["instrument"], "BTC/USD");
        assert_eq!(json["window_start"], 0);
        assert_eq!(json["window_end"], 60_000);
        assert_eq!(json["timestamp_ms"], 60_000);
        assert_eq!(json["open"], "100.5");
        assert_eq!(json["trade_count"], 1);
    }
}
