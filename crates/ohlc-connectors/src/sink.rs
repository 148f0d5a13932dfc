use std::fs::File;
use std::io::{BufWriter, Stdout, Write};
use std::path::Path;

use async_trait::async_trait;
use ohlc_core::archive::CandleArchive;
use ohlc_core::candle::Candle;
use ohlc_core::emitter::CandleSink;
use ohlc_core::error::SinkError;
use tracing::info;

/// Writes one JSON object per candle, newline-delimited.
pub struct JsonLinesSink<W> {
    name: String,
    writer: W,
}

impl JsonLinesSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new("stdout", std::io::stdout())
    }
}

impl JsonLinesSink<BufWriter<File>> {
    /// Create (or truncate) a JSON-lines file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self::new(path.display().to_string(), BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: Write + Send> CandleSink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, candle: &Candle) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&candle.to_record())?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Buffers candles and writes them to the Parquet archive in batches.
pub struct ArchiveSink {
    archive: CandleArchive,
    batch_size: usize,
    batch: Vec<Candle>,
}

impl ArchiveSink {
    pub fn new(archive: CandleArchive, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            archive,
            batch_size,
            batch: Vec::with_capacity(batch_size),
        }
    }

    /// Candles accepted but not yet written.
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    fn write_batch(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let files = self.archive.write_batch(&self.batch)?;
        info!(
            candles = self.batch.len(),
            files = files.len(),
            "wrote candle batch to archive"
        );
        self.batch.clear();
        Ok(())
    }
}

#[async_trait]
impl CandleSink for ArchiveSink {
    fn name(&self) -> &str {
        "archive"
    }

    async fn send(&mut self, candle: &Candle) -> Result<(), SinkError> {
        self.batch.push(candle.clone());
        if self.batch.len() < self.batch_size {
            return Ok(());
        }
        if let Err(e) = self.write_batch() {
            // Not accepted: the caller keeps the candle and will send it again.
            self.batch.pop();
            return Err(e);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.write_batch()
    }
}
