//! End-to-end pipeline scenarios against mocked IAPD endpoints.

use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use iapd_core::utils::format_yyyymmdd;
use iapd_core::{Config, DataLayout};
use iapd_crawler::{Pipeline, PlainTextExtractor, RunSummary};

struct Harness {
    server: mockito::ServerGuard,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self {
            server: mockito::Server::new_async().await,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.working_dir = self.dir.path().to_path_buf();
        config.endpoints.feed_base = self.server.url();
        config.endpoints.api_base = self.server.url();
        config.endpoints.files_base = self.server.url();
        config.rate_limits.api_per_second = 50;
        config.rate_limits.download_per_second = 50;
        config.http.max_retries = 2;
        config.http.retry_base_ms = 10;
        config
    }

    fn layout(&self) -> DataLayout {
        DataLayout::new(self.dir.path())
    }

    fn stamp(&self) -> String {
        format_yyyymmdd(&Local::now().date_naive())
    }

    fn dated_csv(&self) -> PathBuf {
        self.layout().dated_csv(&self.stamp())
    }

    fn master_csv(&self) -> PathBuf {
        self.layout().master_csv()
    }

    fn stage3_csv(&self) -> PathBuf {
        self.layout().stage3_csv(&self.stamp())
    }

    async fn run(&self, config: Config) -> RunSummary {
        let pipeline = Pipeline::with_extractor(config, Arc::new(PlainTextExtractor)).unwrap();
        pipeline.run(&CancellationToken::new()).await.unwrap()
    }

    async fn mock_feed(&mut self, firms: &[(&str, &str)]) {
        let mut xml = String::from("<IAPDFirmSECReport GenOn=\"today\">\n  <Firms>\n");
        for (crd, filing_date) in firms {
            xml.push_str(&format!(
                "    <Firm><Info FirmCrdNb=\"{crd}\" BusNm=\"Firm {crd}\"/>\
<Filing Dt=\"{filing_date}\" FormVrsn=\"10\"/></Firm>\n"
            ));
        }
        xml.push_str("  </Firms>\n</IAPDFirmSECReport>\n");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        let body = encoder.finish().unwrap();

        let today = Local::now().date_naive();
        self.server
            .mock(
                "GET",
                format!(
                    "/reports/CompilationReports/IA_FIRM_SEC_Feed_{}.xml.gz",
                    today.format("%m_%d_%Y")
                )
                .as_str(),
            )
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
    }

    async fn mock_api(&mut self, crd: &str, versions: &[&str]) {
        let details: Vec<String> = versions
            .iter()
            .map(|version| {
                format!(
                    r#"{{"brchrVrsnID":"{version}","brchrNm":"Part 2A {version}","dtSubmtd":"01/10/2024","dtCnfrmd":"01/11/2024"}}"#
                )
            })
            .collect();
        let body = format!(
            r#"{{"hits":{{"hits":[{{"_source":{{"brochures":{{"brochuredetails":[{}]}}}}}}]}}}}"#,
            details.join(",")
        );
        self.server
            .mock(
                "GET",
                mockito::Matcher::Regex(format!(r"^/search/firm/{crd}\?.*$")),
            )
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
    }

    async fn mock_pdf(&mut self, version: &str, body: Vec<u8>) {
        self.server
            .mock(
                "GET",
                mockito::Matcher::Regex(format!(
                    r"^/IAPD/Content/Common/crd_iapd_Brochure\.aspx\?BRCHR_VRSN_ID={version}$"
                )),
            )
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
    }

    async fn mock_pdf_status(&mut self, version: &str, status: usize) {
        self.server
            .mock(
                "GET",
                mockito::Matcher::Regex(format!(
                    r"^/IAPD/Content/Common/crd_iapd_Brochure\.aspx\?BRCHR_VRSN_ID={version}$"
                )),
            )
            .with_status(status)
            .create_async()
            .await;
    }
}

fn pdf_body(text: &str) -> Vec<u8> {
    let mut body = format!("%PDF-1.4\n{text}\n").into_bytes();
    body.resize(body.len().max(2048), b' ');
    body
}

fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .unwrap();
    reader.records().collect::<Result<_, _>>().unwrap()
}

fn row_for_version<'a>(
    rows: &'a [csv::StringRecord],
    version: &str,
) -> &'a csv::StringRecord {
    rows.iter()
        .find(|row| row.get(23) == Some(version))
        .unwrap_or_else(|| panic!("no output row for version {version}"))
}

/// First-run happy path: master absent, three brochures land with
/// classifications, master is created identical to the dated file.
#[tokio::test]
async fn first_run_creates_master_with_classified_rows() {
    let mut harness = Harness::new().await;
    harness
        .mock_feed(&[("100", "01/15/2024"), ("200", "01/10/2024")])
        .await;
    harness.mock_api("100", &["V1", "V2"]).await;
    harness.mock_api("200", &["V3"]).await;
    harness
        .mock_pdf(
            "V1",
            pdf_body("Voting is delegated to Glass Lewis. Contact info@firm.com."),
        )
        .await;
    harness
        .mock_pdf("V2", pdf_body("ESG research is sourced from Sustainalytics."))
        .await;
    harness
        .mock_pdf("V3", pdf_body("This brochure describes advisory fees."))
        .await;

    let summary = harness.run(harness.config()).await;
    assert_eq!(summary.firms_extracted, 2);
    assert_eq!(summary.brochures_emitted, 3);
    assert_eq!(summary.downloads_succeeded, 3);
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.rows_appended, 3);

    let rows = read_rows(&harness.dated_csv());
    assert_eq!(rows.len(), 3);

    let v1 = row_for_version(&rows, "V1");
    assert_eq!(v1.get(2), Some("100"));
    assert_eq!(v1.get(17), Some("01/15/2024"));
    assert!(v1.get(28).unwrap().contains("Glass Lewis"));
    assert!(v1.get(36).unwrap().contains("info@firm.com"));

    let v2 = row_for_version(&rows, "V2");
    assert!(v2.get(30).unwrap().contains("Sustainalytics"));

    let v3 = row_for_version(&rows, "V3");
    assert_eq!(v3.get(28), Some(""));
    assert_eq!(v3.get(36), Some(""));

    // Master created identical to the dated file.
    assert_eq!(
        std::fs::read(harness.dated_csv()).unwrap(),
        std::fs::read(harness.master_csv()).unwrap()
    );

    // Every SUCCESS row points at a real file with the PDF magic.
    let downloads = harness.layout().downloads_dir;
    for row in read_rows(&harness.stage3_csv()) {
        if row.get(6) == Some("SUCCESS") {
            let bytes = std::fs::read(downloads.join(row.get(7).unwrap())).unwrap();
            assert!(bytes.starts_with(b"%PDF-"));
        }
    }
}

/// Incremental no-op: rerunning with unchanged remote state writes an
/// empty dated file and leaves the master bit-identical.
#[tokio::test]
async fn rerun_with_unchanged_remote_is_a_noop() {
    let mut harness = Harness::new().await;
    harness.mock_feed(&[("100", "01/15/2024")]).await;
    harness.mock_api("100", &["V1", "V2"]).await;
    harness.mock_pdf("V1", pdf_body("first")).await;
    harness.mock_pdf("V2", pdf_body("second")).await;

    let first = harness.run(harness.config()).await;
    assert_eq!(first.rows_written, 2);
    let master_after_first = std::fs::read(harness.master_csv()).unwrap();

    let second = harness.run(harness.config()).await;
    assert_eq!(second.brochures_discovered, 2);
    assert_eq!(second.brochures_filtered, 2);
    assert_eq!(second.rows_written, 0);
    assert_eq!(second.rows_appended, 0);

    assert_eq!(read_rows(&harness.dated_csv()).len(), 0);
    assert_eq!(
        std::fs::read(harness.master_csv()).unwrap(),
        master_after_first
    );
}

/// Incremental update: one new version appears upstream; exactly one
/// row lands and the master grows by exactly one without rewriting history.
#[tokio::test]
async fn new_remote_version_appends_exactly_one_row() {
    let mut harness = Harness::new().await;
    harness.mock_feed(&[("100", "01/15/2024")]).await;
    harness.mock_api("100", &["V1", "V2", "V3"]).await;
    harness.mock_pdf("V1", pdf_body("one")).await;
    harness.mock_pdf("V2", pdf_body("two")).await;
    harness.mock_pdf("V3", pdf_body("three")).await;

    harness.run(harness.config()).await;
    let master_after_first = std::fs::read(harness.master_csv()).unwrap();

    // Remote now exposes V4 alongside the unchanged versions.
    harness.mock_api("100", &["V1", "V2", "V3", "V4"]).await;
    harness.mock_pdf("V4", pdf_body("four")).await;

    let second = harness.run(harness.config()).await;
    assert_eq!(second.brochures_filtered, 3);
    assert_eq!(second.rows_written, 1);
    assert_eq!(second.rows_appended, 1);

    let dated_rows = read_rows(&harness.dated_csv());
    assert_eq!(dated_rows.len(), 1);
    assert_eq!(dated_rows[0].get(23), Some("V4"));

    let master_bytes = std::fs::read(harness.master_csv()).unwrap();
    assert!(master_bytes.starts_with(&master_after_first));
    assert_eq!(read_rows(&harness.master_csv()).len(), 4);
}

/// Download failure: a 500ing PDF is recorded FAILED and produces no
/// output row; once the remote recovers, the next run picks it up because it
/// never reached the master.
#[tokio::test]
async fn failed_download_is_retried_on_the_next_run() {
    let mut harness = Harness::new().await;
    harness.mock_feed(&[("100", "01/15/2024")]).await;
    harness.mock_api("100", &["V1", "V2"]).await;
    harness.mock_pdf("V1", pdf_body("fine")).await;
    harness.mock_pdf_status("V2", 500).await;

    let first = harness.run(harness.config()).await;
    assert_eq!(first.downloads_succeeded, 1);
    assert_eq!(first.downloads_failed, 1);
    assert_eq!(first.rows_written, 1);

    let stage3_rows = read_rows(&harness.stage3_csv());
    let v2_row = stage3_rows
        .iter()
        .find(|row| row.get(2) == Some("V2"))
        .unwrap();
    assert_eq!(v2_row.get(6), Some("FAILED"));
    assert!(read_rows(&harness.dated_csv())
        .iter()
        .all(|row| row.get(23) != Some("V2")));

    // Remote fixed: V2 now serves a PDF.
    harness.mock_pdf("V2", pdf_body("recovered")).await;
    let second = harness.run(harness.config()).await;
    assert_eq!(second.brochures_filtered, 1);
    assert_eq!(second.rows_written, 1);
    assert_eq!(second.rows_appended, 1);
    assert_eq!(read_rows(&harness.master_csv()).len(), 2);
}

/// Corrupt PDF: a 200 with a non-PDF body is INVALID_URL and never
/// reaches the output.
#[tokio::test]
async fn corrupt_pdf_body_never_reaches_the_output() {
    let mut harness = Harness::new().await;
    harness.mock_feed(&[("100", "01/15/2024")]).await;
    harness.mock_api("100", &["V1"]).await;
    harness.mock_pdf("V1", b"NOT A PDF\n".to_vec()).await;

    let summary = harness.run(harness.config()).await;
    assert_eq!(summary.downloads_invalid, 1);
    assert_eq!(summary.rows_written, 0);

    let stage3_rows = read_rows(&harness.stage3_csv());
    assert_eq!(stage3_rows[0].get(6), Some("INVALID_URL"));
    assert_eq!(read_rows(&harness.dated_csv()).len(), 0);
}

/// Rate limit compliance: ten firms at 2 API permits/second take at
/// least 4.5 seconds end to end.
#[tokio::test]
async fn api_calls_stay_inside_the_rate_limit() {
    let mut harness = Harness::new().await;
    let firms: Vec<(String, String)> = (0..10)
        .map(|i| (format!("{}", 100 + i), "01/15/2024".to_string()))
        .collect();
    let firm_refs: Vec<(&str, &str)> = firms
        .iter()
        .map(|(crd, date)| (crd.as_str(), date.as_str()))
        .collect();
    harness.mock_feed(&firm_refs).await;
    for (crd, _) in &firms {
        harness.mock_api(crd, &[]).await;
    }

    let mut config = harness.config();
    config.rate_limits.api_per_second = 2;

    let start = Instant::now();
    let summary = harness.run(config).await;
    let elapsed = start.elapsed();

    assert_eq!(summary.firms_cataloged, 10);
    assert!(
        elapsed >= Duration::from_millis(4_400),
        "10 API calls at 2/s finished in {elapsed:?}"
    );
}

/// Dropping the incremental flag forces reprocessing of known versions into
/// the dated file while the master still deduplicates.
#[tokio::test]
async fn no_incremental_reprocesses_but_master_stays_unique() {
    let mut harness = Harness::new().await;
    harness.mock_feed(&[("100", "01/15/2024")]).await;
    harness.mock_api("100", &["V1"]).await;
    harness.mock_pdf("V1", pdf_body("text")).await;

    harness.run(harness.config()).await;

    let mut config = harness.config();
    config.incremental = Some(false);
    let second = harness.run(config).await;
    assert_eq!(second.brochures_filtered, 0);
    assert_eq!(second.rows_written, 1);
    assert_eq!(second.rows_appended, 0);
    assert_eq!(read_rows(&harness.master_csv()).len(), 1);
}
