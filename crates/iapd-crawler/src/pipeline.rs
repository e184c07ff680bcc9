use chrono::Local;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::BrochureCatalog;
use crate::classifier::BrochureClassifier;
use crate::extract::{PdfTextExtractor, TextExtractor};
use crate::feed::FeedAcquirer;
use crate::fetcher::BrochureFetcher;
use crate::firms::FirmExtractor;
use crate::http::{HttpClient, HttpFetch};
use crate::incremental::IncrementalFilter;
use crate::merger::OutputMerger;
use crate::rate_limiter::EndpointRateLimiter;
use crate::retry::RetryExecutor;
use iapd_core::utils::{format_mmddyyyy, format_yyyymmdd};
use iapd_core::{Config, PipelineError, RunSummary};

/// **Pipeline Orchestrator**
///
/// Runs the stages in order (feed acquisition, firm extraction, brochure
/// cataloging, PDF fetching, and the classify-and-merge pass) with
/// file-based handoffs between them. Every stage's output is flushed and
/// fsynced before the next stage reads it, so an interrupted run leaves a
/// consistent prefix on disk and the next run replays only what is missing
/// from the master.
pub struct Pipeline {
    config: Config,
    http: Arc<dyn HttpFetch>,
    retry: RetryExecutor,
    extractor: Arc<dyn TextExtractor>,
}

impl Pipeline {
    /// Pipeline with the production PDF text extractor.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        Self::with_extractor(config, Arc::new(PdfTextExtractor))
    }

    /// Pipeline with a caller-supplied text extractor.
    pub fn with_extractor(
        config: Config,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let http: Arc<dyn HttpFetch> = Arc::new(HttpClient::new(&config.http)?);
        let retry = RetryExecutor::from_http_config(&config.http);
        Ok(Self {
            config,
            http,
            retry,
            extractor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute one full run.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::new();
        let today = Local::now().date_naive();
        let stamp = format_yyyymmdd(&today);
        let date_added = format_mmddyyyy(&today);
        let layout = self.config.layout();

        info!("Starting pipeline run {} for {}", summary.operation_id, stamp);

        if self.config.force_restart {
            let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
            layout.archive(&timestamp)?;
        }
        layout.ensure()?;

        // Fingerprints of already-processed brochure versions.
        let baseline = self.config.baseline_path();
        let incremental_on = self.config.incremental.unwrap_or_else(|| baseline.exists());
        let filter = if incremental_on {
            IncrementalFilter::load(&baseline)?
        } else {
            info!("Incremental filtering disabled for this run");
            IncrementalFilter::empty()
        };
        if let Some(date) = filter.max_filing_date() {
            info!("Newest filing date in master: {}", format_mmddyyyy(&date));
        }

        // Stage A: locate and decode the daily feed.
        let acquirer = FeedAcquirer::new(
            self.http.clone(),
            self.retry.clone(),
            self.config.endpoints.feed_base.clone(),
            layout.firm_files_dir.clone(),
        );
        let xml_path = acquirer.acquire(today, cancel).await?;

        // Stage B: project firms into stage-1.
        let stage1 = layout.stage1_csv(&stamp);
        summary.firms_extracted = FirmExtractor::new(self.config.index_limit)
            .extract(&xml_path, &stage1, &date_added)?;

        // Stage C: enumerate brochure versions, dropping known fingerprints.
        let stage2 = layout.stage2_csv(&stamp);
        let catalog = BrochureCatalog::new(
            self.http.clone(),
            self.retry.clone(),
            EndpointRateLimiter::api(self.config.rate_limits.api_per_second)?,
            self.config.endpoints.api_base.clone(),
            self.config.workers,
        );
        let catalog_stats = catalog
            .catalog(&stage1, &stage2, filter.fingerprints(), cancel)
            .await?;
        summary.firms_cataloged = catalog_stats.firms_processed;
        summary.firms_with_new_brochures = catalog_stats.firms_with_brochures;
        summary.brochures_discovered = catalog_stats.brochures_discovered;
        summary.brochures_filtered = catalog_stats.brochures_filtered;
        summary.brochures_emitted = catalog_stats.brochures_emitted;
        summary.errors.extend(catalog_stats.errors);

        // Stage D: download the PDFs.
        let stage3 = layout.stage3_csv(&stamp);
        let fetcher = BrochureFetcher::new(
            self.http.clone(),
            self.retry.clone(),
            EndpointRateLimiter::download(self.config.rate_limits.download_per_second)?,
            self.config.endpoints.files_base.clone(),
            layout.downloads_dir.clone(),
            self.config.skip_downloads,
        );
        let fetch_stats = fetcher.fetch(&stage2, &stage3, cancel).await?;
        summary.downloads_attempted = fetch_stats.attempted;
        summary.downloads_succeeded = fetch_stats.succeeded;
        summary.downloads_failed = fetch_stats.failed;
        summary.downloads_invalid = fetch_stats.invalid;
        summary.downloads_no_url = fetch_stats.no_url;
        summary.downloads_skipped = fetch_stats.skipped;
        summary.errors.extend(fetch_stats.errors);

        // Stages E and F: classify, join, and merge into the master.
        let merger = OutputMerger::new(
            BrochureClassifier::new(self.extractor.clone()),
            layout.downloads_dir.clone(),
            self.config.endpoints.files_base.clone(),
        );
        let dated = layout.dated_csv(&stamp);
        let merge_stats = merger
            .merge(&stage1, &stage3, &dated, &layout.master_csv(), &date_added)
            .await?;
        summary.classifications_produced = merge_stats.classifications_produced;
        summary.classifications_skipped = merge_stats.classifications_skipped;
        summary.rows_written = merge_stats.rows_written;
        summary.rows_appended = merge_stats.rows_appended;

        summary.finish(true);
        self.write_summary_artifact(&layout, &summary);
        info!(
            "Run {} complete: {} firms, {} brochures emitted ({} filtered), \
             {} downloads ok / {} failed / {} invalid, {} rows written, {} appended",
            summary.operation_id,
            summary.firms_extracted,
            summary.brochures_emitted,
            summary.brochures_filtered,
            summary.downloads_succeeded,
            summary.downloads_failed,
            summary.downloads_invalid,
            summary.rows_written,
            summary.rows_appended
        );
        Ok(summary)
    }

    /// Drop the run summary into `Data/Logs` for operators. Failure to write
    /// the artifact never fails a finished run.
    fn write_summary_artifact(&self, layout: &iapd_core::DataLayout, summary: &RunSummary) {
        let path = layout
            .logs_dir
            .join(format!("run_{}.json", summary.operation_id));
        match serde_json::to_vec_pretty(summary) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&path, bytes) {
                    warn!("Could not write run summary {}: {}", path.display(), err);
                }
            }
            Err(err) => warn!("Could not serialize run summary: {}", err),
        }
    }
}
