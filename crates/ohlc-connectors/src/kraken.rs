use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use ohlc_core::trade::{RawTrade, WireNumber};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SourceError;

const KRAKEN_PUBLIC_URL: &str = "https://api.kraken.com/0/public";

/// Live trade source polling Kraken's public `Trades` endpoint for one pair.
/// Starts from the current time, so no history is replayed. Never ends on its own.
pub struct KrakenSource {
    client: Client,
    base_url: String,
    instrument: String,
    pair: String,
    poll_interval: Duration,
    since: Option<String>,
    buffer: VecDeque<Result<RawTrade, SourceError>>,
    polled: bool,
}

impl KrakenSource {
    /// `instrument` labels emitted trades; `pair` is the Kraken pair name (e.g. `XBTUSD`).
    pub fn new(instrument: impl Into<String>, pair: impl Into<String>, poll_interval: Duration) -> Self {
        Self::with_base_url(instrument, pair, poll_interval, KRAKEN_PUBLIC_URL.to_string())
    }

    /// Create with a custom base URL (for testing).
    pub fn with_base_url(
        instrument: impl Into<String>,
        pair: impl Into<String>,
        poll_interval: Duration,
        base_url: String,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url,
            instrument: instrument.into(),
            pair: pair.into(),
            poll_interval,
            since: None,
            buffer: VecDeque::new(),
            polled: false,
        }
    }

    /// Default Kraken pair for an instrument such as `BTC/USD`.
    pub fn default_pair(instrument: &str) -> String {
        instrument.replace('/', "").to_uppercase()
    }

    /// Next buffered trade, polling when the buffer is empty. Every poll after
    /// the first one, failed or not, waits `poll_interval` first.
    pub async fn next(&mut self) -> Result<Option<RawTrade>, SourceError> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return row.map(Some);
            }
            if self.polled {
                tokio::time::sleep(self.poll_interval).await;
            }
            self.polled = true;
            self.poll().await?;
        }
    }

    async fn poll(&mut self) -> Result<(), SourceError> {
        let since = self
            .since
            .clone()
            .unwrap_or_else(|| Utc::now().timestamp().to_string());

        let response = self
            .client
            .get(format!("{}/Trades", self.base_url))
            .query(&[("pair", self.pair.as_str()), ("since", since.as_str())])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited {
                retry_after_secs: 60,
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status,
                message: body,
            });
        }

        let body: KrakenResponse = response.json().await?;

        let (trades, last) = parse_trades_response(body, &self.instrument)?;
        let skipped = trades.iter().filter(|row| row.is_err()).count();
        if skipped > 0 {
            warn!(instrument = %self.instrument, skipped, "Kraken response had malformed rows");
        }
        debug!(
            instrument = %self.instrument,
            count = trades.len(),
            "polled Kraken trades"
        );
        self.buffer.extend(trades);
        if last.is_some() {
            self.since = last;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct KrakenResponse {
    #[serde(default)]
    error: Vec<String>,
    result: Option<serde_json::Map<String, Value>>,
}

/// Turn a `Trades` response into raw trades plus the `last` cursor.
///
/// Each trade is `[price, volume, time, side, type, misc, trade_id]` with
/// price and volume as strings and time in fractional seconds. A row that is
/// not an array becomes a `Malformed` entry numbered by its position.
fn parse_trades_response(
    body: KrakenResponse,
    instrument: &str,
) -> Result<(Vec<Result<RawTrade, SourceError>>, Option<String>), SourceError> {
    if !body.error.is_empty() {
        return Err(SourceError::Api {
            status: 0,
            message: body.error.join(", "),
        });
    }

    let result = body
        .result
        .ok_or_else(|| SourceError::Parse("no result in response".into()))?;

    let last = result.get("last").map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    let rows = result
        .iter()
        .find(|(key, _)| key.as_str() != "last")
        .and_then(|(_, value)| value.as_array())
        .cloned()
        .unwrap_or_default();

    let trades = rows
        .iter()
        .enumerate()
        .map(|(i, row)| parse_trade_row(i + 1, row, instrument))
        .collect();
    Ok((trades, last))
}

fn parse_trade_row(line: usize, row: &Value, instrument: &str) -> Result<RawTrade, SourceError> {
    let fields = row.as_array().ok_or_else(|| SourceError::Malformed {
        line,
        reason: format!("expected trade array, got {row}"),
    })?;

    let text = |i: usize| match fields.get(i) {
        Some(Value::String(s)) => Some(WireNumber::Text(s.clone())),
        Some(Value::Number(n)) => n.as_f64().map(WireNumber::Float),
        _ => None,
    };

    let event_time_ms = fields
        .get(2)
        .and_then(Value::as_f64)
        .map(|secs| WireNumber::Int((secs * 1000.0).round() as i64));

    Ok(RawTrade {
        instrument: Some(instrument.to_string()),
        price: text(0),
        quantity: text(1),
        event_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ohlc_core::trade::Trade;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE: &str = r#"{
        "error": [],
        "result": {
            "XXBTZUSD": [
                ["97012.10000", "0.00150000", 1736951400.1234, "b", "m", "", 1],
                ["97013.00000", "0.25000000", 1736951401.5, "s", "l", "", 2]
            ],
            "last": "1736951401500000000"
        }
    }"#;

    #[test]
    fn parse_trades() {
        let body: KrakenResponse = serde_json::from_str(SAMPLE).unwrap();
        let (trades, last) = parse_trades_response(body, "BTC/USD").unwrap();

        assert_eq!(last.as_deref(), Some("1736951401500000000"));
        assert_eq!(trades.len(), 2);

        let first = Trade::try_from(trades[0].as_ref().unwrap().clone()).unwrap();
        assert_eq!(first.instrument(), "BTC/USD");
        assert_eq!(first.price(), dec!(97012.1));
        assert_eq!(first.quantity(), dec!(0.0015));
        assert_eq!(first.event_time_ms(), 1_736_951_400_123);

        let second = Trade::try_from(trades[1].as_ref().unwrap().clone()).unwrap();
        assert_eq!(second.event_time_ms(), 1_736_951_401_500);
    }

    #[test]
    fn parse_error_response() {
        let body: KrakenResponse =
            serde_json::from_str(r#"{"error": ["EQuery:Unknown asset pair"]}"#).unwrap();
        let err = parse_trades_response(body, "BTC/USD").unwrap_err();
        assert!(matches!(err, SourceError::Api { status: 0, .. }));
    }

    #[test]
    fn parse_empty_result() {
        let body: KrakenResponse =
            serde_json::from_str(r#"{"error": [], "result": {"XXBTZUSD": [], "last": "0"}}"#)
                .unwrap();
        let (trades, last) = parse_trades_response(body, "BTC/USD").unwrap();
        assert!(trades.is_empty());
        assert_eq!(last.as_deref(), Some("0"));
    }

    #[test]
    fn malformed_row_skipped_rest_kept() {
        let body: KrakenResponse = serde_json::from_str(
            r#"{"error": [], "result": {"XXBTZUSD": [
                "oops",
                ["97012.10000", "0.00150000", 1736951400.1234, "b", "m", "", 1]
            ], "last": "7"}}"#,
        )
        .unwrap();
        let (trades, last) = parse_trades_response(body, "BTC/USD").unwrap();

        assert_eq!(last.as_deref(), Some("7"));
        assert_eq!(trades.len(), 2);
        assert!(matches!(trades[0], Err(SourceError::Malformed { line: 1, .. })));
        assert!(trades[0].as_ref().unwrap_err().is_recoverable());
        assert!(trades[1].is_ok());
    }

    #[tokio::test]
    async fn server_error_is_recoverable_and_next_poll_resumes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Trades"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Trades"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE))
            .mount(&server)
            .await;

        let mut source = KrakenSource::with_base_url(
            "BTC/USD",
            "XBTUSD",
            Duration::from_millis(10),
            server.uri(),
        );

        let err = source.next().await.unwrap_err();
        assert!(matches!(err, SourceError::Api { status: 502, .. }));
        assert!(err.is_recoverable());

        let trade = source.next().await.unwrap().unwrap();
        assert_eq!(trade.instrument.as_deref(), Some("BTC/USD"));
    }

    #[test]
    fn default_pair_strips_separator() {
        assert_eq!(KrakenSource::default_pair("btc/usd"), "BTCUSD");
    }
}
