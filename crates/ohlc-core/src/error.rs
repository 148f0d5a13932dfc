use rust_decimal::Decimal;
use thiserror::Error;

/// Why a trade record was rejected before it could touch any candle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("quantity must not be negative, got {0}")]
    NegativeQuantity(Decimal),

    #[error("event time must not be negative, got {0}ms")]
    NegativeEventTime(i64),

    #[error("event time {0}ms has no representable window end")]
    EventTimeOverflow(i64),

    #[error("window volume overflows when adding quantity {0}")]
    VolumeOverflow(Decimal),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("invalid trade: {0}")]
    InvalidTrade(#[from] TradeError),

    #[error(
        "late trade for {instrument} at {event_time_ms}ms: window closed at {window_end_ms}ms, watermark is {watermark_ms}ms"
    )]
    ClockRegression {
        instrument: String,
        event_time_ms: i64,
        window_end_ms: i64,
        watermark_ms: i64,
    },

    #[error("emission failed: {0}")]
    SinkUnavailable(#[from] SinkError),
}

impl AggregateError {
    /// Rejections of a single trade never halt the stream; sink failures do.
    pub fn is_trade_rejection(&self) -> bool {
        !matches!(self, AggregateError::SinkUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("window duration must be positive, got {value}{unit}")]
    NonPositiveWindow { value: i64, unit: &'static str },

    #[error("{var} not set")]
    Missing { var: &'static str },

    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("No candles archived for {instrument} on {date}")]
    NoData {
        instrument: String,
        date: chrono::NaiveDate,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}
