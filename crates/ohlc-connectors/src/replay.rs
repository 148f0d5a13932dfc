use std::path::Path;

use ohlc_core::trade::RawTrade;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

use crate::error::SourceError;

/// Replays trades from newline-delimited JSON, one trade object per line.
/// Blank lines are skipped. End of input is end of stream.
pub struct ReplaySource {
    label: String,
    lines: Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>,
    line_no: usize,
}

impl ReplaySource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(path.display().to_string(), file))
    }

    pub fn from_reader<R>(label: impl Into<String>, reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        Self {
            label: label.into(),
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn next(&mut self) -> Result<Option<RawTrade>, SourceError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| SourceError::Malformed {
                    line: self.line_no,
                    reason: e.to_string(),
                });
        }
    }
}
