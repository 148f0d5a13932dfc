use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::candle::CandleState;
use crate::trade::Trade;
use crate::window::{WindowDuration, WindowKey};

/// In-progress candles keyed by `(instrument, window_start)`.
///
/// An entry exists exactly while its window is open or awaiting emission.
#[derive(Debug)]
pub struct CandleStateStore {
    window: WindowDuration,
    candles: BTreeMap<WindowKey, CandleState>,
}

impl CandleStateStore {
    pub fn new(window: WindowDuration) -> Self {
        Self {
            window,
            candles: BTreeMap::new(),
        }
    }

    /// Existing accumulator for `key`, or a fresh one seeded from `trade`.
    /// The flag is `true` when the accumulator was created by this call.
    pub fn get_or_create(&mut self, key: WindowKey, trade: &Trade) -> (&mut CandleState, bool) {
        match self.candles.entry(key) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => (entry.insert(CandleState::open_with(trade)), true),
        }
    }

    pub fn get(&self, key: &WindowKey) -> Option<&CandleState> {
        self.candles.get(key)
    }

    pub fn remove(&mut self, key: &WindowKey) -> Option<CandleState> {
        self.candles.remove(key)
    }

    /// Keys of `instrument` whose window end is at or before `watermark_ms`, oldest first.
    pub fn keys_older_than(&self, instrument: &str, watermark_ms: i64) -> Vec<WindowKey> {
        let lower = WindowKey::new(instrument, i64::MIN);
        let upper = WindowKey::new(instrument, i64::MAX);
        self.candles
            .range(lower..=upper)
            .map(|(key, _)| key)
            .take_while(|key| self.window.window_end(key.window_start) <= watermark_ms)
            .cloned()
            .collect()
    }

    /// All keys currently held, ordered by instrument then window start.
    pub fn open_keys(&self) -> Vec<WindowKey> {
        self.candles.keys().cloned().collect()
    }

    pub fn window(&self) -> WindowDuration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}
