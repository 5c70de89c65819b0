//! `backfill` command: paginated trade history download through the supervisor

use crate::backfill::BackfillConfig;
use crate::downloader::{
    DataSource, DownloadProgress, DownloadReport, DownloadRequest, DownloadSupervisor, JobStatus,
    RetryPolicy,
};
use crate::fetcher::poloniex::{PoloniexClient, POLONIEX_PUBLIC_URL};
use crate::resume::{ResumeState, ResumeStore};
use crate::shutdown::SharedShutdown;
use crate::sink::Destination;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::CliError;

/// Try to parse datetime from RFC3339 format.
///
/// Inputs without a timezone designator are taken as UTC.
fn try_parse_datetime_rfc3339(input: &str) -> Option<i64> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.timestamp_millis());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{input}Z")) {
        return Some(dt.timestamp_millis());
    }

    None
}

fn parse_date(input: &str, which: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| CliError::InvalidArgument(format!("Invalid {which} time '{input}': {e}")))
}

/// Parse a start time from YYYY-MM-DD (start of day, UTC) or RFC3339
pub fn parse_start_time(input: &str) -> Result<i64, CliError> {
    if let Some(ts) = try_parse_datetime_rfc3339(input) {
        return Ok(ts);
    }
    let datetime = parse_date(input, "start")?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CliError::InvalidArgument("Invalid start time".to_string()))?;
    Ok(datetime.and_utc().timestamp_millis())
}

/// Parse an exclusive end time from YYYY-MM-DD or RFC3339.
///
/// A date-only end includes that whole day, so the exclusive bound is the
/// following midnight UTC.
pub fn parse_end_time(input: &str) -> Result<i64, CliError> {
    if let Some(ts) = try_parse_datetime_rfc3339(input) {
        return Ok(ts);
    }
    let datetime = parse_date(input, "end")?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CliError::InvalidArgument("Invalid end time".to_string()))?
        + ChronoDuration::days(1);
    Ok(datetime.and_utc().timestamp_millis())
}

/// Resume modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Ignore and do not write checkpoints
    Off,
    /// Resume from a checkpoint if one exists
    On,
    /// Delete existing checkpoints and start fresh
    Reset,
    /// Check that every checkpoint loads before starting
    Verify,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(ResumeMode::Off),
            "on" => Ok(ResumeMode::On),
            "reset" => Ok(ResumeMode::Reset),
            "verify" => Ok(ResumeMode::Verify),
            _ => Err(format!(
                "Invalid resume mode: {s}. Valid options: on, off, reset, verify"
            )),
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Tick Downloader CLI
#[derive(Parser, Debug)]
#[command(name = "tick-downloader")]
#[command(about = "Download complete, ordered trade and tick history from market-data APIs", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Backfill trade history from a paginated API
    Backfill(BackfillArgs),
}

impl Commands {
    /// Subcommand name as typed on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Backfill(_) => "backfill",
        }
    }
}

/// Arguments for the `backfill` command
#[derive(Parser, Debug)]
pub struct BackfillArgs {
    /// Currency pair (e.g., BTC_XMR)
    #[arg(long)]
    pub symbol: String,

    /// Start time (YYYY-MM-DD or RFC3339)
    #[arg(long)]
    pub start: String,

    /// End time (YYYY-MM-DD includes the whole day, or RFC3339)
    #[arg(long)]
    pub end: String,

    /// Output CSV file
    #[arg(long)]
    pub output: PathBuf,

    /// API base URL
    #[arg(long, default_value = POLONIEX_PUBLIC_URL)]
    pub base_url: String,

    /// Pause between pages in milliseconds
    #[arg(long, default_value = "2500")]
    pub page_delay_ms: u64,

    /// Page size at which the API truncates results
    #[arg(long, default_value = "50000", value_parser = clap::value_parser!(u64).range(1..))]
    pub record_cap: u64,

    /// Resume state directory; checkpoints are only written when set
    #[arg(long)]
    pub resume_dir: Option<PathBuf>,

    /// Resume mode: on, off, reset, or verify
    #[arg(long, default_value = "on")]
    pub resume: ResumeMode,

    /// Give up on a page after this many consecutive failures (default: retry forever)
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl BackfillArgs {
    /// Backfill configuration from the flags
    pub fn config(&self) -> BackfillConfig {
        let mut retry = RetryPolicy::default();
        if let Some(max) = self.max_retries {
            retry = retry.with_max_retries(max);
        }
        BackfillConfig::default()
            .with_page_record_cap(self.record_cap as usize)
            .with_page_delay(Duration::from_millis(self.page_delay_ms))
            .with_retry(retry)
    }

    /// Run the backfill to completion or cancellation
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let start = parse_start_time(&self.start)?;
        let end = parse_end_time(&self.end)?;

        let store = self.prepare_resume()?;
        let mut supervisor = DownloadSupervisor::new().with_shutdown(shutdown);
        if let Some(store) = store {
            supervisor = supervisor.with_resume(store);
        }

        let request = DownloadRequest::historical(
            self.symbol.clone(),
            start,
            end,
            Destination::Flatfile {
                path: self.output.clone(),
            },
        );
        let source = DataSource::Paginated {
            fetcher: Arc::new(PoloniexClient::new(self.base_url.clone())),
            config: self.config(),
        };

        info!(
            symbol = %self.symbol,
            start,
            end,
            output = %self.output.display(),
            "Starting backfill"
        );
        let id = supervisor.start(request, source)?;

        let bar = create_progress_bar(&self.symbol);
        let mut progress = supervisor.subscribe_progress(id)?;
        let bar_task = {
            let bar = bar.clone();
            tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let snapshot = progress.borrow_and_update().clone();
                    update_progress_bar(&bar, &snapshot);
                }
            })
        };

        let report = supervisor.wait(id).await?;
        let _ = bar_task.await;
        bar.finish_and_clear();

        match cli.output_format {
            OutputFormat::Json => output_json(self, start, end, &report),
            OutputFormat::Human => output_human(self, &report),
        }

        match report.status {
            JobStatus::Completed => Ok(()),
            JobStatus::Cancelled => {
                info!("Backfill cancelled; rerun with the same arguments to resume");
                Ok(())
            }
            _ => Err(CliError::DownloadFailed(
                report.error.unwrap_or_else(|| format!("{:?}", report.status)),
            )),
        }
    }

    fn prepare_resume(&self) -> Result<Option<ResumeStore>, CliError> {
        let Some(dir) = &self.resume_dir else {
            return Ok(None);
        };
        match self.resume {
            ResumeMode::Off => return Ok(None),
            ResumeMode::Reset => handle_resume_reset(dir)?,
            ResumeMode::Verify => handle_resume_verify(dir)?,
            ResumeMode::On => {}
        }
        Ok(Some(ResumeStore::new(dir)))
    }
}

/// Delete an existing resume directory
fn handle_resume_reset(resume_dir: &Path) -> Result<(), CliError> {
    if resume_dir.exists() {
        info!(dir = %resume_dir.display(), "Reset mode: deleting existing resume directory");
        std::fs::remove_dir_all(resume_dir).map_err(|e| {
            CliError::InvalidArgument(format!(
                "Failed to delete resume directory {}: {e}",
                resume_dir.display()
            ))
        })?;
    }
    Ok(())
}

/// Check that every state file in the resume directory loads
fn handle_resume_verify(resume_dir: &Path) -> Result<(), CliError> {
    if !resume_dir.exists() {
        info!("Verify mode: resume directory does not exist, nothing to verify");
        return Ok(());
    }

    let entries = std::fs::read_dir(resume_dir).map_err(|e| {
        CliError::InvalidArgument(format!(
            "Failed to read resume directory {}: {e}",
            resume_dir.display()
        ))
    })?;

    let mut valid_count = 0;
    let mut error_count = 0;

    for entry in entries {
        let path = entry
            .map_err(|e| CliError::InvalidArgument(format!("Failed to read directory entry: {e}")))?
            .path();
        if path.extension().is_some_and(|ext| ext == "json") {
            match ResumeState::load(&path) {
                Ok(_) => valid_count += 1,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Invalid resume state");
                    error_count += 1;
                }
            }
        }
    }

    if error_count > 0 {
        return Err(CliError::InvalidArgument(format!(
            "Verify failed: {error_count} invalid resume state file(s) found. Use --resume reset to clear."
        )));
    }

    info!(valid = valid_count, "Verify passed");
    Ok(())
}

fn output_json(args: &BackfillArgs, start: i64, end: i64, report: &DownloadReport) {
    let output = serde_json::json!({
        "success": report.status == JobStatus::Completed,
        "status": format!("{:?}", report.status),
        "symbol": args.symbol,
        "start_time": start,
        "end_time": end,
        "output_path": args.output.display().to_string(),
        "trades_written": report.records_written,
        "retries": report.retries,
        "final_position": report.final_position,
        "error": report.error,
    });
    println!("{output}");
}

fn output_human(args: &BackfillArgs, report: &DownloadReport) {
    match report.status {
        JobStatus::Completed | JobStatus::Cancelled => {
            if report.status == JobStatus::Completed {
                println!("\nBackfill completed successfully!");
            } else {
                println!("\nBackfill cancelled.");
            }
            println!("Symbol: {}", args.symbol);
            println!("Output: {}", args.output.display());
            println!("Trades written: {}", report.records_written);
            if report.retries > 0 {
                println!("Retries: {}", report.retries);
            }
        }
        _ => {
            eprintln!("\nBackfill failed!");
            if let Some(e) = &report.error {
                eprintln!("Error: {e}");
            }
        }
    }
}

// ─── Progress bar ────────────────────────────────────────────────────────────

/// Percentage bar fed by progress snapshots
fn create_progress_bar(symbol: &str) -> ProgressBar {
    let pb = ProgressBar::new(1000);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(format!("Backfilling {symbol}"));
    pb
}

fn update_progress_bar(bar: &ProgressBar, progress: &DownloadProgress) {
    if let Some(pct) = progress.percentage() {
        bar.set_position((pct * 10.0).round() as u64);
    }
    bar.set_message(format!(
        "{} trades, {} retries",
        progress.records_written, progress.retries
    ));
}
