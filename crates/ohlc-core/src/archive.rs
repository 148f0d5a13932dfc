use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::candle::Candle;
use crate::error::ArchiveError;
use crate::schema;

/// Filesystem-backed Parquet archive of finalized candles.
///
/// Directory layout:
/// `{root}/data/{INSTRUMENT}/{YYYY}/{MM}/{YYYY-MM-DD}/{first_start}-{last_start}.parquet`
/// where the instrument has `/` replaced by `-` and the date is the UTC date of
/// each candle's window start.
pub struct CandleArchive {
    data_dir: PathBuf,
}

impl CandleArchive {
    /// Create an archive rooted at the given directory.
    /// The `data/` subdirectory is used automatically.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            data_dir: root.as_ref().join("data"),
        }
    }

    /// Directory name used for an instrument.
    pub fn instrument_dir_name(instrument: &str) -> String {
        instrument.replace(['/', '\\', ':'], "-")
    }

    /// Directory holding all batches for an instrument on a given date.
    pub fn day_dir(&self, instrument: &str, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(Self::instrument_dir_name(instrument))
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%Y-%m-%d").to_string())
    }

    /// Path of the batch file for candles spanning `[first_start, last_start]`.
    pub fn batch_path(
        &self,
        instrument: &str,
        date: NaiveDate,
        first_start: i64,
        last_start: i64,
    ) -> PathBuf {
        self.day_dir(instrument, date)
            .join(format!("{first_start}-{last_start}.parquet"))
    }

    pub fn has_data(&self, instrument: &str, date: NaiveDate) -> bool {
        self.day_dir(instrument, date).exists()
    }

    /// Write a batch of candles, one file per instrument and UTC day.
    /// Creates parent directories as needed. Returns the files written.
    pub fn write_batch(&self, candles: &[Candle]) -> Result<Vec<PathBuf>, ArchiveError> {
        let mut groups: BTreeMap<(&str, NaiveDate), Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            let date = candle
                .start_time()
                .ok_or_else(|| {
                    ArchiveError::InvalidData(format!(
                        "invalid window start: {}",
                        candle.window_start
                    ))
                })?
                .date_naive();
            groups
                .entry((candle.instrument.as_str(), date))
                .or_default()
                .push(candle.clone());
        }

        let mut written = Vec::with_capacity(groups.len());
        for ((instrument, date), mut group) in groups {
            group.sort_by_key(|c| c.window_start);
            let first = group.first().map(|c| c.window_start).unwrap_or_default();
            let last = group.last().map(|c| c.window_start).unwrap_or_default();

            let path = self.batch_path(instrument, date, first, last);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            schema::write_parquet(&path, &group)?;
            written.push(path);
        }

        Ok(written)
    }

    /// Read all candles for an instrument on a specific date, sorted by window start.
    pub fn read_day(&self, instrument: &str, date: NaiveDate) -> Result<Vec<Candle>, ArchiveError> {
        let dir = self.day_dir(instrument, date);
        if !dir.exists() {
            return Err(ArchiveError::NoData {
                instrument: instrument.to_string(),
                date,
            });
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "parquet") {
                files.push(path);
            }
        }
        files.sort();

        let mut candles = Vec::new();
        for file in files {
            candles.append(&mut schema::read_parquet(&file)?);
        }
        candles.sort_by_key(|c| c.window_start);
        Ok(candles)
    }

    /// Read candles for an instrument across a date range (inclusive).
    /// Skips dates without data.
    pub fn read_range(
        &self,
        instrument: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>, ArchiveError> {
        let mut all_candles = Vec::new();
        for date in self.list_dates(instrument)? {
            if date >= start && date <= end {
                all_candles.append(&mut self.read_day(instrument, date)?);
            }
        }
        Ok(all_candles)
    }

    /// Read every archived candle for an instrument, sorted by window start.
    pub fn read_all(&self, instrument: &str) -> Result<Vec<Candle>, ArchiveError> {
        let mut all_candles = Vec::new();
        for date in self.list_dates(instrument)? {
            all_candles.append(&mut self.read_day(instrument, date)?);
        }
        Ok(all_candles)
    }

    /// List all instrument directories in the archive.
    pub fn list_instruments(&self) -> Result<Vec<String>, ArchiveError> {
        if !self.data_dir.exists() {
            return Ok(Vec::new());
        }

        let mut instruments = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                instruments.push(name.to_string());
            }
        }
        instruments.sort();
        Ok(instruments)
    }

    /// List all dates with data for a given instrument, sorted ascending.
    pub fn list_dates(&self, instrument: &str) -> Result<Vec<NaiveDate>, ArchiveError> {
        let instrument_dir = self.data_dir.join(Self::instrument_dir_name(instrument));
        if !instrument_dir.exists() {
            return Ok(Vec::new());
        }

        let mut dates = Vec::new();

        for year_entry in std::fs::read_dir(&instrument_dir)? {
            let year_entry = year_entry?;
            if !year_entry.file_type()?.is_dir() {
                continue;
            }

            for month_entry in std::fs::read_dir(year_entry.path())? {
                let month_entry = month_entry?;
                if !month_entry.file_type()?.is_dir() {
                    continue;
                }

                for day_entry in std::fs::read_dir(month_entry.path())? {
                    let day_entry = day_entry?;
                    if day_entry.file_type()?.is_dir()
                        && let Some(name) = day_entry.file_name().to_str()
                        && let Ok(date) = NaiveDate::parse_from_str(name, "%Y-%m-%d")
                    {
                        dates.push(date);
                    }
                }
            }
        }

        dates.sort();
        Ok(dates)
    }

    /// Get the date range (earliest, latest) for an instrument, or None if no data.
    pub fn date_range(
        &self,
        instrument: &str,
    ) -> Result<Option<(NaiveDate, NaiveDate)>, ArchiveError> {
        let dates = self.list_dates(instrument)?;
        Ok(dates.first().copied().zip(dates.last().copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn millis(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn make_candle(instrument: &str, start: i64) -> Candle {
        Candle {
            instrument: instrument.into(),
            window_start: start,
            window_end: start + 60_000,
            open: dec!(100.00),
            high: dec!(101.00),
            low: dec!(99.00),
            close: dec!(100.50),
            volume: dec!(2.5),
            trade_count: 3,
        }
    }

    #[test]
    fn day_dir_format_sanitizes_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        let path = archive.day_dir("BTC/USD", date(2025, 1, 15));
        let expected = dir.path().join("data/BTC-USD/2025/01/2025-01-15");
        assert_eq!(path, expected);
    }

    #[test]
    fn write_and_read_day() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        let candles = vec![
            make_candle("BTC/USD", millis(2025, 1, 15, 14, 31)),
            make_candle("BTC/USD", millis(2025, 1, 15, 14, 30)),
        ];

        let written = archive.write_batch(&candles).unwrap();
        assert_eq!(written.len(), 1);
        assert!(archive.has_data("BTC/USD", date(2025, 1, 15)));

        let result = archive.read_day("BTC/USD", date(2025, 1, 15)).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result[0].window_start < result[1].window_start);
    }

    #[test]
    fn read_day_missing_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        let result = archive.read_day("BTC/USD", date(2025, 1, 15));
        assert!(matches!(result, Err(ArchiveError::NoData { .. })));
    }

    #[test]
    fn batch_split_by_instrument_and_day() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        let candles = vec![
            make_candle("BTC/USD", millis(2025, 1, 15, 23, 59)),
            make_candle("BTC/USD", millis(2025, 1, 16, 0, 0)),
            make_candle("ETH/USD", millis(2025, 1, 15, 12, 0)),
        ];

        let written = archive.write_batch(&candles).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(
            archive.list_dates("BTC/USD").unwrap(),
            vec![date(2025, 1, 15), date(2025, 1, 16)]
        );
        assert_eq!(
            archive.list_instruments().unwrap(),
            vec!["BTC-USD", "ETH-USD"]
        );
    }

    #[test]
    fn successive_batches_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());

        archive
            .write_batch(&[make_candle("BTC/USD", millis(2025, 1, 15, 10, 0))])
            .unwrap();
        archive
            .write_batch(&[
                make_candle("BTC/USD", millis(2025, 1, 15, 10, 1)),
                make_candle("BTC/USD", millis(2025, 1, 15, 10, 2)),
            ])
            .unwrap();

        let all = archive.read_all("BTC/USD").unwrap();
        let starts: Vec<i64> = all.iter().map(|c| c.window_start).collect();
        assert_eq!(
            starts,
            vec![
                millis(2025, 1, 15, 10, 0),
                millis(2025, 1, 15, 10, 1),
                millis(2025, 1, 15, 10, 2)
            ]
        );
    }

    #[test]
    fn read_range_skips_dates_outside() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        archive
            .write_batch(&[
                make_candle("BTC/USD", millis(2025, 1, 14, 9, 0)),
                make_candle("BTC/USD", millis(2025, 1, 15, 9, 0)),
                make_candle("BTC/USD", millis(2025, 1, 17, 9, 0)),
            ])
            .unwrap();

        let result = archive
            .read_range("BTC/USD", date(2025, 1, 15), date(2025, 1, 16))
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn list_instruments_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        assert!(archive.list_instruments().unwrap().is_empty());
        assert_eq!(archive.date_range("BTC/USD").unwrap(), None);
    }

    #[test]
    fn date_range_spans_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        archive
            .write_batch(&[
                make_candle("BTC/USD", millis(2025, 1, 15, 9, 0)),
                make_candle("BTC/USD", millis(2025, 2, 3, 9, 0)),
            ])
            .unwrap();

        assert_eq!(
            archive.date_range("BTC-USD").unwrap(),
            Some((date(2025, 1, 15), date(2025, 2, 3)))
        );
    }
}
