//! Poloniex public API response parser
//!
//! Stateless functions converting JSON responses into typed records.

use crate::fetcher::{FetcherError, FetcherResult};
use crate::{Side, Trade};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

/// Format of the `date` field in trade history responses (UTC)
const TRADE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Stateless parser for Poloniex API responses
pub struct PoloniexParser;

/// Order book snapshot fields used for sequencing
#[derive(Debug, Deserialize)]
struct RawOrderBook {
    seq: u64,
}

impl PoloniexParser {
    /// Parse a `returnTradeHistory` response into trades
    ///
    /// # Format
    /// `[{"globalTradeID":..,"tradeID":..,"date":"2017-03-10 01:31:08","type":"sell","rate":"..","amount":"..","total":".."}, ...]`
    /// or `{"error": ".."}`
    pub fn parse_trade_history(response: Value) -> FetcherResult<Vec<Trade>> {
        Self::check_api_error(&response)?;

        let items = response
            .as_array()
            .ok_or_else(|| FetcherError::ParseError("Trade history is not an array".to_string()))?;

        items.iter().map(Self::parse_trade).collect()
    }

    /// Parse one trade object
    pub fn parse_trade(value: &Value) -> FetcherResult<Trade> {
        let obj = value
            .as_object()
            .ok_or_else(|| FetcherError::ParseError("Trade is not an object".to_string()))?;

        let trade_id = obj
            .get("tradeID")
            .and_then(Self::as_i64_lenient)
            .ok_or_else(|| FetcherError::ParseError("Invalid tradeID".to_string()))?;

        let global_trade_id = obj
            .get("globalTradeID")
            .and_then(Self::as_i64_lenient)
            .unwrap_or(0);

        let date = obj
            .get("date")
            .and_then(Value::as_str)
            .ok_or_else(|| FetcherError::ParseError("Missing date".to_string()))?;
        let timestamp = Self::parse_date(date)?;

        let side = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FetcherError::ParseError("Missing type".to_string()))
            .and_then(|s| Side::from_str(s).map_err(FetcherError::ParseError))?;

        let trade = Trade {
            trade_id,
            global_trade_id,
            timestamp,
            side,
            rate: Self::parse_decimal(obj.get("rate"), "rate")?,
            amount: Self::parse_decimal(obj.get("amount"), "amount")?,
            total: Self::parse_decimal(obj.get("total"), "total")?,
        };

        trade.validate().map_err(FetcherError::ParseError)?;
        Ok(trade)
    }

    /// Parse a `returnOrderBook` response and return its sequence number
    pub fn parse_order_book_seq(response: Value) -> FetcherResult<u64> {
        Self::check_api_error(&response)?;
        let book: RawOrderBook = serde_json::from_value(response)
            .map_err(|e| FetcherError::ParseError(format!("Invalid order book: {e}")))?;
        Ok(book.seq)
    }

    /// Parse a UTC `YYYY-MM-DD HH:MM:SS` date into Unix milliseconds
    pub fn parse_date(date: &str) -> FetcherResult<i64> {
        NaiveDateTime::parse_from_str(date, TRADE_DATE_FORMAT)
            .map(|dt| dt.and_utc().timestamp_millis())
            .map_err(|e| FetcherError::ParseError(format!("Invalid date '{date}': {e}")))
    }

    fn check_api_error(response: &Value) -> FetcherResult<()> {
        match response.get("error").and_then(Value::as_str) {
            Some(message) => Err(FetcherError::ApiError(message.to_string())),
            None => Ok(()),
        }
    }

    fn as_i64_lenient(value: &Value) -> Option<i64> {
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }

    fn parse_decimal(value: Option<&Value>, field: &str) -> FetcherResult<Decimal> {
        let value = value.ok_or_else(|| FetcherError::ParseError(format!("Missing {field}")))?;
        match value {
            Value::String(s) => Decimal::from_str(s)
                .map_err(|e| FetcherError::ParseError(format!("Invalid {field} '{s}': {e}"))),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .map_err(|e| FetcherError::ParseError(format!("Invalid {field} '{n}': {e}"))),
            _ => Err(FetcherError::ParseError(format!("Invalid {field} type"))),
        }
    }
}
