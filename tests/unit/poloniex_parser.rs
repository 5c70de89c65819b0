use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use tick_downloader::fetcher::parser::PoloniexParser;
use tick_downloader::fetcher::poloniex::PoloniexClient;
use tick_downloader::fetcher::FetcherError;
use tick_downloader::Side;

#[test]
fn test_trade_history_preserves_decimal_precision() {
    let response = json!([
        {"globalTradeID": 394131410, "tradeID": 23123413, "date": "2018-11-02 12:00:00",
         "type": "buy", "rate": "0.00001234", "amount": "81036.45867099", "total": "0.99998989"}
    ]);

    let trades = PoloniexParser::parse_trade_history(response).unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.global_trade_id, 394131410);
    assert_eq!(trade.side, Side::Buy);
    assert_eq!(trade.rate, Decimal::from_str("0.00001234").unwrap());
    assert_eq!(trade.amount, Decimal::from_str("81036.45867099").unwrap());
    assert_eq!(trade.total, Decimal::from_str("0.99998989").unwrap());
    assert_eq!(trade.timestamp, 1_541_160_000_000);
}

#[test]
fn test_numeric_fields_accepted() {
    let response = json!([
        {"globalTradeID": 1, "tradeID": 2, "date": "2018-11-02 12:00:00",
         "type": "sell", "rate": 0.5, "amount": 2, "total": 1}
    ]);
    let trades = PoloniexParser::parse_trade_history(response).unwrap();
    assert_eq!(trades[0].rate, Decimal::new(5, 1));
    assert_eq!(trades[0].amount, Decimal::new(2, 0));
}

#[test]
fn test_empty_history_is_not_an_error() {
    let trades = PoloniexParser::parse_trade_history(json!([])).unwrap();
    assert!(trades.is_empty());
}

#[test]
fn test_malformed_responses_rejected() {
    assert!(matches!(
        PoloniexParser::parse_trade_history(json!({"result": []})),
        Err(FetcherError::ParseError(_))
    ));

    let unknown_side = json!([{"tradeID": 1, "date": "2018-11-02 12:00:00", "type": "hold",
                               "rate": "1", "amount": "1", "total": "1"}]);
    assert!(PoloniexParser::parse_trade_history(unknown_side).is_err());

    let zero_amount = json!([{"tradeID": 1, "date": "2018-11-02 12:00:00", "type": "buy",
                              "rate": "1", "amount": "0", "total": "0"}]);
    assert!(PoloniexParser::parse_trade_history(zero_amount).is_err());
}

#[test]
fn test_parse_date_is_utc() {
    assert_eq!(PoloniexParser::parse_date("1970-01-01 00:00:01").unwrap(), 1_000);
    assert!(PoloniexParser::parse_date("2018-11-02T12:00:00Z").is_err());
}

#[test]
fn test_query_window_matches_inclusive_backfill_bounds() {
    // A backtracked window ends one millisecond before the oldest returned trade
    let oldest = 1_541_160_000_000;
    let params = PoloniexClient::trade_history_params("BTC_XMR", 1_541_073_600_000, oldest - 1).unwrap();
    let end = params.iter().find(|(k, _)| *k == "end").map(|(_, v)| v.clone()).unwrap();
    assert_eq!(end, "1541159999");
}
