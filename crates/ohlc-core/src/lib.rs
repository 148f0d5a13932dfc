//! Tumbling-window aggregation of trades into OHLCV candles.
//!
//! Trades flow through [`window::WindowDuration::assign`] into the
//! [`state::CandleStateStore`] owned by an [`aggregator::Aggregator`], which
//! emits each window through an [`emitter::Emitter`] once the instrument's
//! event time moves past the window end.

pub mod aggregator;
pub mod archive;
pub mod candle;
pub mod config;
pub mod emitter;
pub mod error;
pub mod schema;
pub mod state;
pub mod trade;
pub mod window;

pub use aggregator::{Aggregator, AggregatorStats, Ingest};
pub use candle::{Candle, CandleState};
pub use config::AggregatorConfig;
pub use emitter::{CandleSink, Emitter};
pub use error::{AggregateError, ArchiveError, ConfigError, SinkError, TradeError};
pub use trade::{RawTrade, Trade};
pub use window::{WindowDuration, WindowKey};
