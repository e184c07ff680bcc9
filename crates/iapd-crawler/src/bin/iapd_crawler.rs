use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iapd_crawler::{Config, Pipeline, RunSummary};

/// **IAPD Brochure Pipeline CLI**
///
/// Ingests the SEC IAPD daily firm feed, discovers and downloads Form ADV
/// Part 2 brochures, classifies their text, and maintains the cumulative
/// IAPD_Data.csv output.
#[derive(Parser)]
#[command(name = "iapd-crawler")]
#[command(about = "SEC IAPD brochure acquisition and classification pipeline")]
#[command(version)]
struct Cli {
    /// Directory under which the Data/ tree lives
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Cap firms processed from the daily feed
    #[arg(long)]
    index_limit: Option<usize>,

    /// Permits/second for firm-info API calls (default 2)
    #[arg(long)]
    api_rate_limit: Option<u32>,

    /// Permits/second for PDF downloads (default 5)
    #[arg(long)]
    download_rate_limit: Option<u32>,

    /// Archive the existing data directory before running
    #[arg(long)]
    force_restart: bool,

    /// Force incremental filtering on (default: on when a master exists)
    #[arg(long, conflicts_with = "no_incremental")]
    incremental: bool,

    /// Force incremental filtering off
    #[arg(long)]
    no_incremental: bool,

    /// Master CSV consulted by the incremental filter
    #[arg(long)]
    baseline_file: Option<PathBuf>,

    /// Mark every brochure SKIPPED instead of downloading
    #[arg(long)]
    skip_downloads: bool,

    /// Catalog worker pool width
    #[arg(long)]
    workers: Option<usize>,

    /// Increase log verbosity
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::from_env();
        if let Some(dir) = self.working_dir {
            config.working_dir = dir;
        }
        if let Some(limit) = self.index_limit {
            config.index_limit = Some(limit);
        }
        if let Some(rate) = self.api_rate_limit {
            config.rate_limits.api_per_second = rate;
        }
        if let Some(rate) = self.download_rate_limit {
            config.rate_limits.download_per_second = rate;
        }
        config.force_restart = self.force_restart;
        config.incremental = if self.incremental {
            Some(true)
        } else if self.no_incremental {
            Some(false)
        } else {
            None
        };
        if let Some(path) = self.baseline_file {
            config.baseline_file = Some(path);
        }
        config.skip_downloads = self.skip_downloads;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.verbose = self.verbose;
        config
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "iapd_crawler=debug,iapd_core=debug"
    } else {
        "iapd_crawler=info,iapd_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.into_config();
    if let Err(err) = config.validate() {
        error!("{}", err);
        std::process::exit(err.exit_code());
    }

    let pipeline = match Pipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!("{}", err);
            std::process::exit(err.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing the in-flight item");
                cancel.cancel();
            }
        });
    }

    match pipeline.run(&cancel).await {
        Ok(summary) => {
            print_summary(&summary);
            std::process::exit(0);
        }
        Err(err) => {
            error!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run Results:");
    println!("  Operation ID: {}", summary.operation_id);
    println!("  Firms extracted: {}", summary.firms_extracted);
    println!("  Firms cataloged: {}", summary.firms_cataloged);
    println!(
        "  Firms with new brochures: {}",
        summary.firms_with_new_brochures
    );
    println!(
        "  Brochures discovered: {} ({} filtered as already processed)",
        summary.brochures_discovered, summary.brochures_filtered
    );
    println!("  Brochures emitted: {}", summary.brochures_emitted);
    println!(
        "  Downloads: {} attempted, {} succeeded, {} failed, {} invalid, {} no URL, {} skipped",
        summary.downloads_attempted,
        summary.downloads_succeeded,
        summary.downloads_failed,
        summary.downloads_invalid,
        summary.downloads_no_url,
        summary.downloads_skipped
    );
    println!(
        "  Classifications: {} produced, {} skipped",
        summary.classifications_produced, summary.classifications_skipped
    );
    println!("  Rows written to dated file: {}", summary.rows_written);
    println!("  Rows appended to master: {}", summary.rows_appended);

    if !summary.errors.is_empty() {
        println!("  Errors:");
        for error in &summary.errors {
            println!("    - {}", error);
        }
    }

    if let Some(duration) = summary.end_time.map(|end| end - summary.start_time) {
        println!("  Duration: {}s", duration.num_seconds());
    }
}
