use ohlc_core::trade::RawTrade;

use crate::error::SourceError;
use crate::kraken::KrakenSource;
use crate::replay::ReplaySource;

/// Where trades come from. `next` returns `Ok(None)` at end of stream.
pub enum TradeSource {
    /// Recorded trades read back from a newline-delimited JSON file.
    Replay(ReplaySource),
    /// Live trades polled from Kraken's public REST API.
    Kraken(KrakenSource),
}

impl TradeSource {
    /// Source name (for logging/display).
    pub fn name(&self) -> &str {
        match self {
            TradeSource::Replay(source) => source.label(),
            TradeSource::Kraken(_) => "kraken",
        }
    }

    pub async fn next(&mut self) -> Result<Option<RawTrade>, SourceError> {
        match self {
            TradeSource::Replay(source) => source.next().await,
            TradeSource::Kraken(source) => source.next().await,
        }
    }
}

impl From<ReplaySource> for TradeSource {
    fn from(source: ReplaySource) -> Self {
        TradeSource::Replay(source)
    }
}

impl From<KrakenSource> for TradeSource {
    fn from(source: KrakenSource) -> Self {
        TradeSource::Kraken(source)
    }
}
