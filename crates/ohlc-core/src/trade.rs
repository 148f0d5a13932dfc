use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::TradeError;

/// A validated trade. Fields are private so a trade cannot change after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trade {
    instrument: String,
    price: Decimal,
    quantity: Decimal,
    event_time_ms: i64,
}

impl Trade {
    pub fn new(
        instrument: impl Into<String>,
        price: Decimal,
        quantity: Decimal,
        event_time_ms: i64,
    ) -> Result<Self, TradeError> {
        let instrument = instrument.into();
        if instrument.trim().is_empty() {
            return Err(TradeError::MissingField("instrument"));
        }
        if price <= Decimal::ZERO {
            return Err(TradeError::NonPositivePrice(price));
        }
        if quantity < Decimal::ZERO {
            return Err(TradeError::NegativeQuantity(quantity));
        }
        if event_time_ms < 0 {
            return Err(TradeError::NegativeEventTime(event_time_ms));
        }

        Ok(Self {
            instrument,
            price,
            quantity,
            event_time_ms,
        })
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Event time in milliseconds since the epoch. Windowing uses this, never arrival time.
    pub fn event_time_ms(&self) -> i64 {
        self.event_time_ms
    }
}

/// A numeric field as it appears on the wire: a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

impl WireNumber {
    fn to_decimal(&self, field: &'static str) -> Result<Decimal, TradeError> {
        let invalid = |reason: String| TradeError::InvalidField { field, reason };
        match self {
            WireNumber::Int(v) => Ok(Decimal::from(*v)),
            WireNumber::Float(v) => f64_to_decimal(*v).map_err(invalid),
            WireNumber::Text(s) => {
                let s = s.trim();
                s.parse::<Decimal>()
                    .or_else(|_| Decimal::from_scientific(s))
                    .map_err(|e| invalid(format!("'{s}': {e}")))
            }
        }
    }

    fn to_millis(&self, field: &'static str) -> Result<i64, TradeError> {
        let invalid = |reason: String| TradeError::InvalidField { field, reason };
        match self {
            WireNumber::Int(v) => Ok(*v),
            WireNumber::Float(v) => f64_to_millis(*v).map_err(invalid),
            WireNumber::Text(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(v) => Ok(v),
                    Err(_) => s
                        .parse::<f64>()
                        .map_err(|e| invalid(format!("'{s}': {e}")))
                        .and_then(|v| f64_to_millis(v).map_err(invalid)),
                }
            }
        }
    }
}

fn f64_to_decimal(val: f64) -> Result<Decimal, String> {
    if !val.is_finite() {
        return Err(format!("non-finite value {val}"));
    }
    Decimal::try_from(val).map_err(|e| format!("invalid decimal value {val}: {e}"))
}

fn f64_to_millis(val: f64) -> Result<i64, String> {
    if !val.is_finite() {
        return Err(format!("non-finite value {val}"));
    }
    if val.fract() != 0.0 {
        return Err(format!("{val} is not a whole number of milliseconds"));
    }
    if val < i64::MIN as f64 || val > i64::MAX as f64 {
        return Err(format!("{val} is out of range"));
    }
    Ok(val as i64)
}

/// A trade record as delivered by a source, before validation.
///
/// Every field is optional so that a record with a missing field still
/// deserializes and is rejected as an invalid trade rather than a malformed line.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTrade {
    #[serde(default, alias = "product_id", alias = "symbol", alias = "pair")]
    pub instrument: Option<String>,

    #[serde(default)]
    pub price: Option<WireNumber>,

    #[serde(default, alias = "qty", alias = "volume")]
    pub quantity: Option<WireNumber>,

    #[serde(
        default,
        alias = "timestamp_ms",
        alias = "eventTimeMs",
        alias = "time_ms"
    )]
    pub event_time_ms: Option<WireNumber>,
}

impl TryFrom<RawTrade> for Trade {
    type Error = TradeError;

    fn try_from(raw: RawTrade) -> Result<Self, Self::Error> {
        let instrument = raw
            .instrument
            .ok_or(TradeError::MissingField("instrument"))?;
        let price = raw
            .price
            .ok_or(TradeError::MissingField("price"))?
            .to_decimal("price")?;
        let quantity = raw
            .quantity
            .ok_or(TradeError::MissingField("quantity"))?
            .to_decimal("quantity")?;
        let event_time_ms = raw
            .event_time_ms
            .ok_or(TradeError::MissingField("event_time_ms"))?
            .to_millis("event_time_ms")?;

        Trade::new(instrument, price, quantity, event_time_ms)
    }
}
