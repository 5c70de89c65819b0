//! CLI command implementations and process setup

pub mod backfill;
pub mod error;

pub use backfill::{BackfillArgs, Cli, Commands, OutputFormat, ResumeMode};
pub use error::CliError;

use crate::shutdown::{self, SharedShutdown, ShutdownCoordinator};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
const DEFAULT_LOG_DIRECTIVE: &str = "tick_downloader=info";

/// Install the tracing subscriber. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Register the process-wide shutdown handle and trip it on Ctrl+C
fn install_shutdown() -> SharedShutdown {
    let handle = ShutdownCoordinator::shared();
    shutdown::set_global_shutdown(handle.clone());

    let on_signal = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received; cancelling downloads and flushing sinks");
            on_signal.request_shutdown();
        }
    });
    handle
}

impl Cli {
    /// Start the metrics exporter if requested, then run the selected command
    pub async fn run(&self) -> Result<(), CliError> {
        if let Some(addr) = self.metrics_addr {
            crate::metrics::init_metrics(addr)
                .await
                .map_err(|e| CliError::Metrics(e.to_string()))?;
        }

        let shutdown = install_shutdown();
        match &self.command {
            Commands::Backfill(args) => args.execute(self, shutdown).await,
        }
    }
}
