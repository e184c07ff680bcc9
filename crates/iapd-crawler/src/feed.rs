use chrono::{Duration as ChronoDuration, NaiveDate};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::HttpFetch;
use crate::retry::{classify_default, RetryExecutor};
use iapd_core::utils::{build_feed_url, format_file_size};
use iapd_core::PipelineError;

/// Calendar days to walk back from today looking for a published feed.
const LOOKBACK_DAYS: i64 = 7;

/// **Feed Acquirer**
///
/// Locates, downloads, and gunzips the most recent IAPD daily firm feed.
/// Candidate URLs are composed per calendar day starting from today and
/// walking back up to seven days; a 404 is terminal for that candidate only,
/// while transport faults retry within the candidate. When no candidate in
/// the window serves a nonempty body the run aborts with `FeedUnavailable`.
pub struct FeedAcquirer {
    http: Arc<dyn HttpFetch>,
    retry: RetryExecutor,
    feed_base: String,
    firm_files_dir: PathBuf,
}

impl FeedAcquirer {
    pub fn new(
        http: Arc<dyn HttpFetch>,
        retry: RetryExecutor,
        feed_base: String,
        firm_files_dir: PathBuf,
    ) -> Self {
        Self {
            http,
            retry,
            feed_base,
            firm_files_dir,
        }
    }

    /// Download the newest available daily feed and return the path to the
    /// uncompressed XML.
    pub async fn acquire(
        &self,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        for days_back in 0..=LOOKBACK_DAYS {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let candidate = today - ChronoDuration::days(days_back);
            let url = build_feed_url(&self.feed_base, &candidate);
            debug!("Trying feed candidate: {}", url);

            let response = self
                .retry
                .run(cancel, classify_default, || {
                    self.http.get_success(&url, cancel)
                })
                .await;

            match response {
                Ok(response) if response.body.is_empty() => {
                    warn!("Feed for {} served an empty body, trying previous day", candidate);
                }
                Ok(response) => {
                    info!(
                        "Downloaded feed for {} ({})",
                        candidate,
                        format_file_size(response.body.len() as u64)
                    );
                    match self.save_and_decompress(&candidate, &response.body) {
                        Ok(xml_path) => return Ok(xml_path),
                        Err(err) => {
                            warn!(
                                "Feed for {} could not be decompressed ({}), trying previous day",
                                candidate, err
                            );
                        }
                    }
                }
                Err(err) if err.is_cancelled() => return Err(PipelineError::Cancelled),
                Err(err) => {
                    debug!("Feed candidate {} unavailable: {}", candidate, err);
                }
            }
        }

        Err(PipelineError::FeedUnavailable {
            days: LOOKBACK_DAYS as u32,
        })
    }

    /// Write the gz body next to its future XML sibling, then inflate it.
    fn save_and_decompress(
        &self,
        date: &NaiveDate,
        body: &[u8],
    ) -> Result<PathBuf, PipelineError> {
        let stem = format!("IA_FIRM_SEC_Feed_{}", date.format("%m_%d_%Y"));
        let gz_path = self.firm_files_dir.join(format!("{stem}.xml.gz"));
        let xml_path = self.firm_files_dir.join(format!("{stem}.xml"));

        std::fs::write(&gz_path, body)?;

        let mut decoder = GzDecoder::new(File::open(&gz_path)?);
        let mut output = File::create(&xml_path)?;
        std::io::copy(&mut decoder, &mut output)?;
        output.sync_all()?;

        debug!("Decompressed feed to {}", xml_path.display());
        Ok(xml_path)
    }
}
