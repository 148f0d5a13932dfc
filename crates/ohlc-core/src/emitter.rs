use async_trait::async_trait;
use tracing::debug;

use crate::candle::Candle;
use crate::error::SinkError;

/// Downstream consumer of finalized candles.
///
/// Delivery and retry guarantees beyond a successful `send` belong to the sink.
#[async_trait]
pub trait CandleSink: Send {
    /// Sink name (for logging/display).
    fn name(&self) -> &str;

    /// Hand one finalized candle to the sink. An error means the candle was not accepted.
    async fn send(&mut self, candle: &Candle) -> Result<(), SinkError>;

    /// Push out anything the sink buffers. Called on shutdown.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl<S: CandleSink + ?Sized> CandleSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&mut self, candle: &Candle) -> Result<(), SinkError> {
        (**self).send(candle).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush().await
    }
}

/// Hands finalized candles to a sink and counts what it delivered.
pub struct Emitter<S> {
    sink: S,
    emitted: u64,
}

impl<S: CandleSink> Emitter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, emitted: 0 }
    }

    pub async fn emit(&mut self, candle: &Candle) -> Result<(), SinkError> {
        self.sink.send(candle).await?;
        self.emitted += 1;
        debug!(
            sink = self.sink.name(),
            instrument = %candle.instrument,
            window_start = candle.window_start,
            open = %candle.open,
            high = %candle.high,
            low = %candle.low,
            close = %candle.close,
            volume = %candle.volume,
            "emitted candle"
        );
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), SinkError> {
        self.sink.flush().await
    }

    /// Number of candles the sink has accepted.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
