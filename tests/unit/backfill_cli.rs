use clap::Parser;
use tick_downloader::cli::backfill::{parse_end_time, parse_start_time};
use tick_downloader::cli::{Cli, Commands, OutputFormat, ResumeMode};

#[test]
fn test_defaults() {
    let cli = Cli::parse_from([
        "tick-downloader",
        "backfill",
        "--symbol",
        "BTC_ETH",
        "--start",
        "2016-01-01",
        "--end",
        "2016-12-31",
        "--output",
        "out/btc_eth.csv",
    ]);
    assert_eq!(cli.output_format, OutputFormat::Human);
    assert!(cli.metrics_addr.is_none());
    assert_eq!(cli.command.name(), "backfill");

    let Commands::Backfill(args) = cli.command;
    assert_eq!(args.resume, ResumeMode::On);
    assert!(args.resume_dir.is_none());
    assert!(args.max_retries.is_none());

    let config = args.config();
    assert_eq!(config.page_record_cap, 50_000);
    assert_eq!(config.page_delay_ms, 2_500);
    assert_eq!(config.retry.max_retries, None);
    assert!(config.validate().is_ok());
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::parse_from([
        "tick-downloader",
        "backfill",
        "--symbol",
        "BTC_ETH",
        "--start",
        "2016-01-01",
        "--end",
        "2016-01-02",
        "--output",
        "o.csv",
        "--output-format",
        "json",
        "--metrics-addr",
        "127.0.0.1:9000",
        "--resume",
        "verify",
        "--resume-dir",
        "state",
    ]);
    assert_eq!(cli.output_format, OutputFormat::Json);
    assert_eq!(cli.metrics_addr.unwrap().port(), 9000);
    let Commands::Backfill(args) = cli.command;
    assert_eq!(args.resume, ResumeMode::Verify);
    assert_eq!(args.resume_dir.unwrap().to_str(), Some("state"));
}

#[test]
fn test_invalid_flags_rejected() {
    let base = [
        "tick-downloader",
        "backfill",
        "--symbol",
        "BTC_ETH",
        "--start",
        "2016-01-01",
        "--end",
        "2016-01-02",
        "--output",
        "o.csv",
    ];

    let zero_cap: Vec<&str> = base.iter().copied().chain(["--record-cap", "0"]).collect();
    assert!(Cli::try_parse_from(zero_cap).is_err());

    let bad_resume: Vec<&str> = base.iter().copied().chain(["--resume", "sometimes"]).collect();
    assert!(Cli::try_parse_from(bad_resume).is_err());

    assert!(Cli::try_parse_from(["tick-downloader", "backfill", "--symbol", "BTC_ETH"]).is_err());
}

#[test]
fn test_single_day_range() {
    let start = parse_start_time("2016-01-01").unwrap();
    let end = parse_end_time("2016-01-01").unwrap();
    assert_eq!(end - start, 86_400_000);

    let offset = parse_start_time("2016-01-01T02:00:00+02:00").unwrap();
    assert_eq!(offset, start);
}
