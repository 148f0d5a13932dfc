use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use ohlc_core::aggregator::{Aggregator, AggregatorStats};
use ohlc_core::emitter::{CandleSink, Emitter};
use ohlc_core::error::{AggregateError, SinkError};
use ohlc_core::window::WindowKey;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, SourceError};
use crate::source::TradeSource;

/// How hard to retry a sink that refused a candle before giving up the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the first retry; grows linearly with each attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub stats: AggregatorStats,
    /// Source records that were not trade objects at all.
    pub malformed: u64,
    /// Windows still open when the stream ended, by instrument then start.
    /// They are not flushed.
    pub open_windows: Vec<WindowKey>,
}

/// Pull trades from `source` until end of stream or `shutdown` resolves,
/// aggregating them and emitting closed candles through `emitter`.
///
/// Rejected trades, late trades and malformed records are logged and skipped.
/// A sink failure is retried per `retry`; the run aborts only when the sink
/// stays unavailable or the source fails for good.
pub async fn run<S, F>(
    source: &mut TradeSource,
    aggregator: &mut Aggregator,
    emitter: &mut Emitter<S>,
    retry: RetryPolicy,
    shutdown: F,
) -> Result<RunSummary, PipelineError>
where
    S: CandleSink,
    F: Future<Output = ()>,
{
    info!(
        source = source.name(),
        sink = emitter.sink().name(),
        window_ms = aggregator.config().window().as_millis(),
        "starting aggregation"
    );

    let mut shutdown = std::pin::pin!(shutdown);
    let mut malformed = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            next = source.next() => next,
        };

        let raw = match next {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!(source = source.name(), "end of stream");
                break;
            }
            Err(SourceError::RateLimited { retry_after_secs }) => {
                warn!(retry_after_secs, "source rate limited");
                if !sleep_unless_shutdown(Duration::from_secs(retry_after_secs), &mut shutdown).await
                {
                    info!("shutdown requested");
                    break;
                }
                continue;
            }
            Err(e) if e.is_recoverable() => {
                if matches!(e, SourceError::Malformed { .. }) {
                    malformed += 1;
                    warn!(error = %e, "skipping unreadable record");
                } else {
                    warn!(source = source.name(), error = %e, "source hiccup, polling again");
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match aggregator.process(raw, emitter).await {
            Ok(candles) => {
                if !candles.is_empty() {
                    debug!(count = candles.len(), "emitted closed windows");
                }
            }
            Err(AggregateError::SinkUnavailable(e)) => {
                warn!(error = %e, pending = aggregator.pending(), "sink unavailable, retrying");
                retry_pending(aggregator, emitter, retry, e, &mut shutdown).await?;
            }
            // Already logged and counted by the aggregator.
            Err(_) => {}
        }
    }

    flush(emitter, retry).await?;

    let summary = RunSummary {
        stats: aggregator.stats(),
        malformed,
        open_windows: aggregator.store().open_keys(),
    };
    info!(
        accepted = summary.stats.accepted,
        emitted = summary.stats.emitted,
        invalid = summary.stats.invalid,
        late_dropped = summary.stats.late_dropped,
        filtered = summary.stats.filtered,
        malformed = summary.malformed,
        open_windows = summary.open_windows.len(),
        sink_accepted = emitter.emitted(),
        "aggregation finished"
    );
    for key in &summary.open_windows {
        info!(
            instrument = %key.instrument,
            window_start = key.window_start,
            "window left open until a later trade closes it"
        );
    }
    Ok(summary)
}

/// Sleep for `delay`, returning `false` if `shutdown` resolved first.
async fn sleep_unless_shutdown<F: Future<Output = ()>>(
    delay: Duration,
    shutdown: &mut Pin<&mut F>,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn retry_pending<S, F>(
    aggregator: &mut Aggregator,
    emitter: &mut Emitter<S>,
    retry: RetryPolicy,
    mut last: SinkError,
    shutdown: &mut Pin<&mut F>,
) -> Result<(), PipelineError>
where
    S: CandleSink,
    F: Future<Output = ()>,
{
    let mut attempt = 0;
    loop {
        if !sleep_unless_shutdown(retry.backoff * (attempt + 1), shutdown).await {
            warn!(
                attempts = attempt,
                pending = aggregator.pending(),
                "shutdown requested during sink outage"
            );
            return Err(PipelineError::SinkUnavailable {
                attempts: attempt,
                source: last,
            });
        }
        attempt += 1;

        match aggregator.retry_pending(emitter).await {
            Ok(candles) => {
                info!(attempt, emitted = candles.len(), "sink recovered");
                return Ok(());
            }
            Err(AggregateError::SinkUnavailable(source)) if attempt >= retry.max_attempts => {
                return Err(PipelineError::SinkUnavailable {
                    attempts: attempt,
                    source,
                });
            }
            Err(AggregateError::SinkUnavailable(e)) => {
                warn!(attempt, error = %e, "sink still unavailable");
                last = e;
            }
            Err(e) => return Err(PipelineError::Aggregate(e)),
        }
    }
}

/// Flush the sink, retrying per `retry`. A buffering sink keeps its batch on
/// failure, so candles it already accepted are not lost between attempts.
async fn flush<S: CandleSink>(emitter: &mut Emitter<S>, retry: RetryPolicy) -> Result<(), PipelineError> {
    let mut attempt = 0;
    loop {
        let Err(e) = emitter.flush().await else {
            return Ok(());
        };
        if attempt >= retry.max_attempts {
            return Err(PipelineError::SinkUnavailable {
                attempts: attempt,
                source: e,
            });
        }
        attempt += 1;
        warn!(attempt, error = %e, "sink flush failed, retrying");
        tokio::time::sleep(retry.backoff * attempt).await;
    }
}
