use indicatif::ProgressBar;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::{HttpErrorKind, HttpFetch};
use crate::rate_limiter::EndpointRateLimiter;
use crate::retry::{classify_default, RetryExecutor};
use iapd_core::models::{BrochureDownload, BrochureRef, DownloadStatus};
use iapd_core::schema::{self, STAGE3_COLUMNS};
use iapd_core::utils::{build_brochure_url, format_file_size, looks_like_pdf};
use iapd_core::PipelineError;

/// Statistics for one fetch pass.
#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub invalid: u32,
    pub no_url: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
}

/// **Brochure Fetcher**
///
/// Downloads each stage-2 brochure PDF under the download rate limit and
/// records a per-item verdict. Single-item failures never abort the stage;
/// stage-3 carries exactly one row per stage-2 input row. Downloads run
/// sequentially, which trivially keeps throughput inside the bucket.
pub struct BrochureFetcher {
    http: Arc<dyn HttpFetch>,
    retry: RetryExecutor,
    limiter: EndpointRateLimiter,
    files_base: String,
    downloads_dir: PathBuf,
    skip_downloads: bool,
}

impl BrochureFetcher {
    pub fn new(
        http: Arc<dyn HttpFetch>,
        retry: RetryExecutor,
        limiter: EndpointRateLimiter,
        files_base: String,
        downloads_dir: PathBuf,
        skip_downloads: bool,
    ) -> Self {
        Self {
            http,
            retry,
            limiter,
            files_base,
            downloads_dir,
            skip_downloads,
        }
    }

    /// Download every stage-2 brochure and write the stage-3 CSV.
    pub async fn fetch(
        &self,
        stage2_path: &Path,
        stage3_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchStats, PipelineError> {
        let brochures = load_brochures(stage2_path)?;
        let mut writer = schema::create_csv_with_header(stage3_path, &STAGE3_COLUMNS)?;
        let mut stats = FetchStats::default();
        let progress = ProgressBar::new(brochures.len() as u64);
        let mut cancelled = false;

        for brochure in brochures {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.download_one(&brochure, cancel).await {
                Ok(download) => {
                    tally(&mut stats, &download);
                    writer.write_record(download.to_stage3_record())?;
                    progress.inc(1);
                }
                Err(PipelineError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        progress.finish_and_clear();
        schema::finish_csv(writer)?;
        if cancelled {
            return Err(PipelineError::Cancelled);
        }
        Ok(stats)
    }

    async fn download_one(
        &self,
        brochure: &BrochureRef,
        cancel: &CancellationToken,
    ) -> Result<BrochureDownload, PipelineError> {
        if self.skip_downloads {
            return Ok(outcome(brochure, DownloadStatus::Skipped, None, None));
        }
        if brochure.brochure_version_id.is_empty() {
            debug!(
                "Brochure {:?} of firm {} has no version id",
                brochure.brochure_name, brochure.firm_crd_number
            );
            return Ok(outcome(brochure, DownloadStatus::NoUrl, None, None));
        }

        let source = build_brochure_url(&self.files_base, &brochure.brochure_version_id);
        if url::Url::parse(&source).is_err() {
            warn!("Brochure URL {:?} does not parse", source);
            return Ok(outcome(brochure, DownloadStatus::InvalidUrl, None, None));
        }

        self.limiter.acquire(cancel).await?;
        let result = self
            .retry
            .run(cancel, classify_default, || {
                self.http.get_success(&source, cancel)
            })
            .await;

        match result {
            Ok(response) => {
                if looks_like_pdf(&response.body) {
                    let file_name = brochure.local_file_name();
                    let path = self.downloads_dir.join(&file_name);
                    let mut file = File::create(&path)?;
                    file.write_all(&response.body)?;
                    file.sync_all()?;

                    let digest = hex::encode(Sha256::digest(&response.body));
                    debug!(
                        "Downloaded {} ({}, sha256 {})",
                        file_name,
                        format_file_size(response.body.len() as u64),
                        digest
                    );
                    Ok(outcome(
                        brochure,
                        DownloadStatus::Success,
                        Some(file_name),
                        Some(digest),
                    ))
                } else {
                    warn!(
                        "{}",
                        PipelineError::PdfInvalid {
                            version_id: brochure.brochure_version_id.clone(),
                        }
                    );
                    Ok(outcome(brochure, DownloadStatus::InvalidUrl, None, None))
                }
            }
            Err(err) if err.is_cancelled() => Err(PipelineError::Cancelled),
            Err(err) if err.kind == HttpErrorKind::Status(404) => {
                debug!(
                    "Brochure {} not found (404)",
                    brochure.brochure_version_id
                );
                Ok(outcome(brochure, DownloadStatus::InvalidUrl, None, None))
            }
            Err(err) => {
                warn!(
                    "{}",
                    PipelineError::DownloadFailure {
                        version_id: brochure.brochure_version_id.clone(),
                        reason: err.to_string(),
                    }
                );
                Ok(outcome(brochure, DownloadStatus::Failed, None, None))
            }
        }
    }
}

fn outcome(
    brochure: &BrochureRef,
    status: DownloadStatus,
    file_name: Option<String>,
    sha256: Option<String>,
) -> BrochureDownload {
    debug_assert!(DownloadStatus::Pending.can_transition_to(status));
    BrochureDownload {
        brochure: brochure.clone(),
        status,
        file_name: file_name.unwrap_or_default(),
        sha256,
    }
}

fn tally(stats: &mut FetchStats, download: &BrochureDownload) {
    match download.status {
        DownloadStatus::Success => {
            stats.attempted += 1;
            stats.succeeded += 1;
        }
        DownloadStatus::Failed => {
            stats.attempted += 1;
            stats.failed += 1;
            stats.errors.push(format!(
                "download failed for version {}",
                download.brochure.brochure_version_id
            ));
        }
        DownloadStatus::InvalidUrl => {
            stats.attempted += 1;
            stats.invalid += 1;
        }
        DownloadStatus::NoUrl => stats.no_url += 1,
        DownloadStatus::Skipped => stats.skipped += 1,
        DownloadStatus::Pending => {}
    }
}

fn load_brochures(stage2_path: &Path) -> Result<Vec<BrochureRef>, PipelineError> {
    let mut reader = schema::open_csv_reader(stage2_path)?;
    let mut brochures = Vec::new();
    for record in reader.records() {
        let record = record?;
        match BrochureRef::from_stage2_record(&record) {
            Some(brochure) => brochures.push(brochure),
            None => warn!("Skipping malformed stage-2 row: {:?}", record),
        }
    }
    Ok(brochures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClient;
    use crate::retry::RetryPolicy;
    use iapd_core::schema::{create_csv_with_header, finish_csv, open_csv_reader, STAGE2_COLUMNS};
    use std::time::Duration;

    fn pdf_body(text: &str) -> Vec<u8> {
        let mut body = format!("%PDF-1.4\n{text}\n").into_bytes();
        body.resize(body.len().max(2048), b' ');
        body
    }

    fn write_stage2(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = create_csv_with_header(path, &STAGE2_COLUMNS).unwrap();
        for (crd, version) in entries {
            let brochure = BrochureRef {
                firm_crd_number: crd.to_string(),
                firm_name: format!("Firm {crd}"),
                brochure_version_id: version.to_string(),
                brochure_name: "Part 2A".to_string(),
                date_submitted: "01/10/2024".to_string(),
                date_confirmed: "01/11/2024".to_string(),
            };
            writer.write_record(brochure.to_stage2_record()).unwrap();
        }
        finish_csv(writer).unwrap();
    }

    fn fetcher(server: &mockito::Server, downloads_dir: PathBuf, skip: bool) -> BrochureFetcher {
        BrochureFetcher::new(
            Arc::new(HttpClient::new(&iapd_core::Config::default().http).unwrap()),
            RetryExecutor::new(RetryPolicy {
                max_attempts: 2,
                initial_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
            }),
            EndpointRateLimiter::download(50).unwrap(),
            server.url(),
            downloads_dir,
            skip,
        )
    }

    fn brochure_mock_path(version: &str) -> mockito::Matcher {
        mockito::Matcher::Regex(format!(r"^/IAPD/.*BRCHR_VRSN_ID={version}$"))
    }

    async fn run_fetch(
        server: &mockito::Server,
        entries: &[(&str, &str)],
        skip: bool,
    ) -> (FetchStats, Vec<csv::StringRecord>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let stage2 = dir.path().join("stage2.csv");
        let stage3 = dir.path().join("stage3.csv");
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        write_stage2(&stage2, entries);

        let cancel = CancellationToken::new();
        let stats = fetcher(server, downloads, skip)
            .fetch(&stage2, &stage3, &cancel)
            .await
            .unwrap();
        let mut reader = open_csv_reader(&stage3).unwrap();
        let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
        (stats, rows, dir)
    }

    #[tokio::test]
    async fn test_successful_download_writes_pdf() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", brochure_mock_path("V1"))
            .with_status(200)
            .with_body(pdf_body("brochure text"))
            .create_async()
            .await;

        let (stats, rows, dir) = run_fetch(&server, &[("100", "V1")], false).await;
        let downloads = dir.path().join("downloads");
        assert_eq!(stats.succeeded, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(6), Some("SUCCESS"));
        assert_eq!(rows[0].get(7), Some("100_V1.pdf"));

        let saved = std::fs::read(downloads.join("100_V1.pdf")).unwrap();
        assert!(saved.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn test_404_is_invalid_url() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", brochure_mock_path("V404"))
            .with_status(404)
            .create_async()
            .await;

        let (stats, rows, _) = run_fetch(&server, &[("100", "V404")], false).await;
        assert_eq!(stats.invalid, 1);
        assert_eq!(rows[0].get(6), Some("INVALID_URL"));
        assert_eq!(rows[0].get(7), Some(""));
    }

    #[tokio::test]
    async fn test_500_after_retries_is_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", brochure_mock_path("V500"))
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let (stats, rows, _) = run_fetch(&server, &[("100", "V500")], false).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(rows[0].get(6), Some("FAILED"));
    }

    #[tokio::test]
    async fn test_non_pdf_body_is_invalid_url() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", brochure_mock_path("VBAD"))
            .with_status(200)
            .with_body("NOT A PDF\n")
            .create_async()
            .await;

        let (stats, rows, dir) = run_fetch(&server, &[("100", "VBAD")], false).await;
        let downloads = dir.path().join("downloads");
        assert_eq!(stats.invalid, 1);
        assert_eq!(rows[0].get(6), Some("INVALID_URL"));
        assert!(!downloads.join("100_VBAD.pdf").exists());
    }

    #[tokio::test]
    async fn test_empty_version_id_is_no_url() {
        let server = mockito::Server::new_async().await;
        let (stats, rows, _) = run_fetch(&server, &[("100", "")], false).await;
        assert_eq!(stats.no_url, 1);
        assert_eq!(stats.attempted, 0);
        assert_eq!(rows[0].get(6), Some("NO_URL"));
    }

    #[tokio::test]
    async fn test_skip_downloads_marks_skipped() {
        let server = mockito::Server::new_async().await;
        let (stats, rows, _) = run_fetch(&server, &[("100", "V1"), ("200", "V2")], true).await;
        assert_eq!(stats.skipped, 2);
        assert!(rows.iter().all(|r| r.get(6) == Some("SKIPPED")));
    }

    #[tokio::test]
    async fn test_one_row_per_input_despite_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", brochure_mock_path("VOK"))
            .with_status(200)
            .with_body(pdf_body("ok"))
            .create_async()
            .await;
        server
            .mock("GET", brochure_mock_path("VERR"))
            .with_status(500)
            .create_async()
            .await;

        let (stats, rows, _) =
            run_fetch(&server, &[("100", "VOK"), ("100", "VERR"), ("200", "")], false).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.no_url, 1);
    }
}
