use ohlc_core::error::{AggregateError, SinkError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: malformed trade record: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl SourceError {
    /// Errors after which the stream can keep going.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SourceError::Malformed { .. } | SourceError::RateLimited { .. } => true,
            SourceError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
            // Kraken reports an overloaded backend as `EService:Unavailable` or `EService:Busy`.
            SourceError::Api { status, message } => {
                *status >= 500 || message.starts_with("EService:")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("sink still unavailable after {attempts} attempt(s): {source}")]
    SinkUnavailable {
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Aggregate(AggregateError),
}
