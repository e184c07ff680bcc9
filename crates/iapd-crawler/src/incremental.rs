use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use iapd_core::schema::{self, FILING_DATE_COLUMN, VERSION_ID_COLUMN};
use iapd_core::utils::parse_flexible_date;
use iapd_core::PipelineError;

/// **Incremental Filter**
///
/// Fingerprints of every brochure version already present in the master
/// output. The catalog stage consults the set as an O(1) deny-list so known
/// versions are never reprocessed. Built by streaming the master once; a
/// missing master yields an empty set, as does a master without the version
/// id column (with a warning).
pub struct IncrementalFilter {
    fingerprints: HashSet<String>,
    max_filing_date: Option<NaiveDate>,
}

impl IncrementalFilter {
    /// Filter that lets everything through.
    pub fn empty() -> Self {
        Self {
            fingerprints: HashSet::new(),
            max_filing_date: None,
        }
    }

    /// Stream `master_path` and collect the `brochureVersionId` column.
    pub fn load(master_path: &Path) -> Result<Self, PipelineError> {
        if !master_path.exists() {
            info!(
                "Master file {} does not exist; starting with an empty fingerprint set",
                master_path.display()
            );
            return Ok(Self::empty());
        }

        let mut reader = schema::open_csv_reader(master_path)?;
        let headers = reader.headers()?.clone();
        let version_column = headers
            .iter()
            .position(|column| column == VERSION_ID_COLUMN);
        let filing_column = headers
            .iter()
            .position(|column| column == FILING_DATE_COLUMN);

        let Some(version_column) = version_column else {
            warn!(
                "Master file {} has no {} column; incremental filtering is a no-op",
                master_path.display(),
                VERSION_ID_COLUMN
            );
            return Ok(Self::empty());
        };

        let mut fingerprints = HashSet::new();
        let mut max_filing_date: Option<NaiveDate> = None;
        for record in reader.records() {
            let record = record?;
            if let Some(version_id) = record.get(version_column) {
                if !version_id.is_empty() {
                    fingerprints.insert(version_id.to_string());
                }
            }
            if let Some(column) = filing_column {
                if let Some(Ok(date)) = record.get(column).map(parse_flexible_date) {
                    max_filing_date = Some(max_filing_date.map_or(date, |d| d.max(date)));
                }
            }
        }

        info!(
            "Loaded {} brochure fingerprints from {}",
            fingerprints.len(),
            master_path.display()
        );
        Ok(Self {
            fingerprints,
            max_filing_date,
        })
    }

    pub fn contains(&self, version_id: &str) -> bool {
        self.fingerprints.contains(version_id)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn fingerprints(&self) -> &HashSet<String> {
        &self.fingerprints
    }

    /// Newest filing date seen in the master. Advisory for operators only;
    /// it never gates processing.
    pub fn max_filing_date(&self) -> Option<NaiveDate> {
        self.max_filing_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iapd_core::schema::{create_csv_with_header, finish_csv, OUTPUT_COLUMNS};

    fn write_master(path: &Path, rows: &[(&str, &str)]) {
        let mut writer = create_csv_with_header(path, &OUTPUT_COLUMNS).unwrap();
        for (version_id, filing_date) in rows {
            let mut record = vec![String::new(); OUTPUT_COLUMNS.len()];
            record[17] = filing_date.to_string();
            record[23] = version_id.to_string();
            writer.write_record(&record).unwrap();
        }
        finish_csv(writer).unwrap();
    }

    #[test]
    fn test_missing_master_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let filter = IncrementalFilter::load(&dir.path().join("IAPD_Data.csv")).unwrap();
        assert!(filter.is_empty());
        assert!(filter.max_filing_date().is_none());
    }

    #[test]
    fn test_collects_version_ids_and_max_date() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("IAPD_Data.csv");
        write_master(
            &master,
            &[("V1", "01/15/2024"), ("V2", "01/10/2024"), ("", "01/20/2024")],
        );

        let filter = IncrementalFilter::load(&master).unwrap();
        assert_eq!(filter.len(), 2);
        assert!(filter.contains("V1"));
        assert!(filter.contains("V2"));
        assert!(!filter.contains("V3"));
        assert_eq!(
            filter.max_filing_date(),
            Some(NaiveDate::from_ymd_opt(2024, 1, 20).unwrap())
        );
    }

    #[test]
    fn test_missing_column_warns_and_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("other.csv");
        let mut writer = create_csv_with_header(&master, &["a", "b"]).unwrap();
        writer.write_record(["1", "2"]).unwrap();
        finish_csv(writer).unwrap();

        let filter = IncrementalFilter::load(&master).unwrap();
        assert!(filter.is_empty());
    }
}
