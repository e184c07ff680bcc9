use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::BrochureClassifier;
use iapd_core::models::{
    BrochureAnalysis, BrochureDownload, DownloadStatus, FirmRecord, OutputRow,
};
use iapd_core::schema::{self, OUTPUT_COLUMNS, VERSION_ID_COLUMN};
use iapd_core::utils::build_brochure_url;
use iapd_core::PipelineError;

/// Statistics for one merge pass.
#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    pub classifications_produced: u32,
    pub classifications_skipped: u32,
    pub rows_written: u32,
    pub rows_appended: u32,
    pub firms_missing: u32,
}

/// **Output Merger**
///
/// Joins firm metadata, brochure metadata, and classification results into
/// the dated 38-column output, then appends the new rows to the master file.
/// The master is keyed by `brochureVersionId`: a pre-append scan of the
/// existing file enforces uniqueness, which also makes a crashed append safe
/// to re-run. Master writes are serialized behind one mutex.
pub struct OutputMerger {
    classifier: BrochureClassifier,
    downloads_dir: PathBuf,
    files_base: String,
    master_lock: Mutex<()>,
}

impl OutputMerger {
    pub fn new(
        classifier: BrochureClassifier,
        downloads_dir: PathBuf,
        files_base: String,
    ) -> Self {
        Self {
            classifier,
            downloads_dir,
            files_base,
            master_lock: Mutex::new(()),
        }
    }

    /// Produce the dated file from stage-1 + stage-3, then update the master.
    pub async fn merge(
        &self,
        stage1_path: &Path,
        stage3_path: &Path,
        dated_path: &Path,
        master_path: &Path,
        date_added: &str,
    ) -> Result<MergeStats, PipelineError> {
        let firms = load_firm_map(stage1_path)?;
        let downloads = load_downloads(stage3_path)?;
        let mut stats = MergeStats::default();
        let mut rows: Vec<OutputRow> = Vec::new();

        for download in downloads {
            if download.status != DownloadStatus::Success || download.file_name.is_empty() {
                continue;
            }
            let brochure = &download.brochure;
            let Some(firm) = firms.get(&brochure.firm_crd_number) else {
                warn!(
                    "Stage-3 row for CRD {} has no stage-1 firm; skipping",
                    brochure.firm_crd_number
                );
                stats.firms_missing += 1;
                continue;
            };

            let path = self.downloads_dir.join(&download.file_name);
            let analysis = match self
                .classifier
                .classify_file(&path, &brochure.brochure_version_id)
            {
                Ok(analysis) => {
                    stats.classifications_produced += 1;
                    analysis
                }
                Err(err) => {
                    debug!("{}", err);
                    stats.classifications_skipped += 1;
                    BrochureAnalysis::empty()
                }
            };

            rows.push(OutputRow {
                date_added: date_added.to_string(),
                firm: firm.clone(),
                brochure_url: build_brochure_url(&self.files_base, &brochure.brochure_version_id),
                brochure: brochure.clone(),
                file_name: download.file_name.clone(),
                analysis,
            });
        }

        let mut writer = schema::create_csv_with_header(dated_path, &OUTPUT_COLUMNS)?;
        for row in &rows {
            writer.write_record(row.to_record())?;
            stats.rows_written += 1;
        }
        schema::finish_csv(writer)?;

        stats.rows_appended = self.append_to_master(dated_path, master_path, &rows).await?;

        info!(
            "Merged {} rows into {} ({} appended to master, {} classified, {} skipped)",
            stats.rows_written,
            dated_path.display(),
            stats.rows_appended,
            stats.classifications_produced,
            stats.classifications_skipped
        );
        Ok(stats)
    }

    /// Append rows whose version id is not yet present in the master. When
    /// no master exists the dated file is copied verbatim.
    async fn append_to_master(
        &self,
        dated_path: &Path,
        master_path: &Path,
        rows: &[OutputRow],
    ) -> Result<u32, PipelineError> {
        let _guard = self.master_lock.lock().await;

        if !master_path.exists() {
            std::fs::copy(dated_path, master_path)?;
            info!(
                "Master {} created from {}",
                master_path.display(),
                dated_path.display()
            );
            return Ok(rows.len() as u32);
        }

        let existing = existing_version_ids(master_path)?;
        let mut appender = schema::open_csv_appender(master_path)?;
        let mut appended = 0u32;
        for row in rows {
            if existing.contains(&row.brochure.brochure_version_id) {
                continue;
            }
            appender.write_record(row.to_record())?;
            appended += 1;
        }
        schema::finish_csv(appender)?;
        Ok(appended)
    }
}

/// One scan of the master for the uniqueness key set. Kept out of process
/// state so a restart cannot desynchronize it.
fn existing_version_ids(master_path: &Path) -> Result<HashSet<String>, PipelineError> {
    let mut reader = schema::open_csv_reader(master_path)?;
    let headers = reader.headers()?.clone();
    let Some(column) = headers.iter().position(|name| name == VERSION_ID_COLUMN) else {
        warn!(
            "Master {} has no {} column; treating as empty",
            master_path.display(),
            VERSION_ID_COLUMN
        );
        return Ok(HashSet::new());
    };

    let mut ids = HashSet::new();
    for record in reader.records() {
        let record = record?;
        if let Some(id) = record.get(column) {
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
    }
    Ok(ids)
}

fn load_firm_map(stage1_path: &Path) -> Result<HashMap<String, FirmRecord>, PipelineError> {
    let mut reader = schema::open_csv_reader(stage1_path)?;
    let mut firms = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if let Some(firm) = FirmRecord::from_stage1_record(&record) {
            firms.insert(firm.firm_crd_number.clone(), firm);
        }
    }
    Ok(firms)
}

fn load_downloads(stage3_path: &Path) -> Result<Vec<BrochureDownload>, PipelineError> {
    let mut reader = schema::open_csv_reader(stage3_path)?;
    let mut downloads = Vec::new();
    for record in reader.records() {
        let record = record?;
        match BrochureDownload::from_stage3_record(&record) {
            Some(download) => downloads.push(download),
            None => warn!("Skipping malformed stage-3 row: {:?}", record),
        }
    }
    Ok(downloads)
}
