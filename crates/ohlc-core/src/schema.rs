use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray, TimestampMillisecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::ArchiveError;

/// Arrow schema of an archived candle. Prices and volume are decimal strings so
/// no precision is lost on the way through Parquet.
pub fn candle_schema() -> Schema {
    let timestamp = DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()));
    Schema::new(vec![
        Field::new("instrument", DataType::Utf8, false),
        Field::new("window_start", timestamp.clone(), false),
        Field::new("window_end", timestamp, false),
        Field::new("open", DataType::Utf8, false),
        Field::new("high", DataType::Utf8, false),
        Field::new("low", DataType::Utf8, false),
        Field::new("close", DataType::Utf8, false),
        Field::new("volume", DataType::Utf8, false),
        Field::new("trade_count", DataType::UInt64, false),
    ])
}

fn decimal_column(candles: &[Candle], value: impl Fn(&Candle) -> Decimal) -> ArrayRef {
    let values: Vec<String> = candles.iter().map(|c| value(c).to_string()).collect();
    Arc::new(StringArray::from(
        values.iter().map(|s| s.as_str()).collect::<Vec<&str>>(),
    ))
}

pub fn candles_to_record_batch(candles: &[Candle]) -> Result<RecordBatch, ArchiveError> {
    let schema = Arc::new(candle_schema());

    let instruments: Vec<&str> = candles.iter().map(|c| c.instrument.as_str()).collect();
    let starts: Vec<i64> = candles.iter().map(|c| c.window_start).collect();
    let ends: Vec<i64> = candles.iter().map(|c| c.window_end).collect();
    let trade_counts: Vec<u64> = candles.iter().map(|c| c.trade_count).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(instruments)),
        Arc::new(TimestampMillisecondArray::from(starts).with_timezone("UTC")),
        Arc::new(TimestampMillisecondArray::from(ends).with_timezone("UTC")),
        decimal_column(candles, |c| c.open),
        decimal_column(candles, |c| c.high),
        decimal_column(candles, |c| c.low),
        decimal_column(candles, |c| c.close),
        decimal_column(candles, |c| c.volume),
        Arc::new(UInt64Array::from(trade_counts)),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, index: usize, name: &str) -> Result<&'a StringArray, ArchiveError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| ArchiveError::InvalidData(format!("expected {name} column")))
}

fn timestamp_column<'a>(
    batch: &'a RecordBatch,
    index: usize,
    name: &str,
) -> Result<&'a TimestampMillisecondArray, ArchiveError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .ok_or_else(|| ArchiveError::InvalidData(format!("expected {name} column")))
}

fn parse_decimal(column: &StringArray, row: usize, name: &str) -> Result<Decimal, ArchiveError> {
    column
        .value(row)
        .parse()
        .map_err(|e| ArchiveError::InvalidData(format!("invalid {name}: {e}")))
}

pub fn record_batch_to_candles(batch: &RecordBatch) -> Result<Vec<Candle>, ArchiveError> {
    let instruments = string_column(batch, 0, "instrument")?;
    let starts = timestamp_column(batch, 1, "window_start")?;
    let ends = timestamp_column(batch, 2, "window_end")?;
    let opens = string_column(batch, 3, "open")?;
    let highs = string_column(batch, 4, "high")?;
    let lows = string_column(batch, 5, "low")?;
    let closes = string_column(batch, 6, "close")?;
    let volumes = string_column(batch, 7, "volume")?;
    let trade_counts = batch
        .column(8)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| ArchiveError::InvalidData("expected trade_count column".into()))?;

    let mut candles = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        candles.push(Candle {
            instrument: instruments.value(i).to_string(),
            window_start: starts.value(i),
            window_end: ends.value(i),
            open: parse_decimal(opens, i, "open")?,
            high: parse_decimal(highs, i, "high")?,
            low: parse_decimal(lows, i, "low")?,
            close: parse_decimal(closes, i, "close")?,
            volume: parse_decimal(volumes, i, "volume")?,
            trade_count: trade_counts.value(i),
        });
    }

    Ok(candles)
}

pub fn write_parquet(path: &Path, candles: &[Candle]) -> Result<(), ArchiveError> {
    let batch = candles_to_record_batch(candles)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Vec<Candle>, ArchiveError> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut all_candles = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut candles = record_batch_to_candles(&batch)?;
        all_candles.append(&mut candles);
    }

    Ok(all_candles)
}
