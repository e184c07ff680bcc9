//! Column-order contract for every CSV the pipeline emits.
//!
//! Column order is contract: it is encoded once here and drives both the
//! writers and the readers. All files use minimal quoting, doubled embedded
//! quotes, and Unix newlines.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::PipelineError;

/// Member separator for set-valued output fields.
pub const SET_DELIMITER: &str = "|";

/// Stage-1 `IA_FIRM_SEC_DATA_YYYYMMDD.csv`: one row per firm in the feed.
pub const STAGE1_COLUMNS: [&str; 23] = [
    "dateAdded",
    "SECRgmCD",
    "FirmCrdNb",
    "SECMb",
    "Business Name",
    "Legal Name",
    "Street 1",
    "Street 2",
    "City",
    "State",
    "Country",
    "Postal Code",
    "Telephone #",
    "Fax #",
    "Registration Firm Type",
    "Registration State",
    "Registration Date",
    "Filing Date",
    "Filing Version",
    "Total Employees",
    "AUM",
    "Total Accounts",
    "BrochureURL",
];

/// Stage-2 `FilesToDownload_YYYYMMDD.csv`: one row per surviving brochure.
pub const STAGE2_COLUMNS: [&str; 6] = [
    "firmId",
    "firmName",
    "brochureVersionId",
    "brochureName",
    "dateSubmitted",
    "dateConfirmed",
];

/// Stage-3 `FilesToDownload_YYYYMMDD_with_status.csv`: stage-2 plus verdict.
pub const STAGE3_COLUMNS: [&str; 8] = [
    "firmId",
    "firmName",
    "brochureVersionId",
    "brochureName",
    "dateSubmitted",
    "dateConfirmed",
    "downloadStatus",
    "fileName",
];

/// Final 38-column header shared by `IAPD_Data_YYYYMMDD.csv` and the master
/// `IAPD_Data.csv`.
pub const OUTPUT_COLUMNS: [&str; 38] = [
    "dateAdded",
    "SECRgmCD",
    "FirmCrdNb",
    "SECMb",
    "Business Name",
    "Legal Name",
    "Street 1",
    "Street 2",
    "City",
    "State",
    "Country",
    "Postal Code",
    "Telephone #",
    "Fax #",
    "Registration Firm Type",
    "Registration State",
    "Registration Date",
    "Filing Date",
    "Filing Version",
    "Total Employees",
    "AUM",
    "Total Accounts",
    "BrochureURL",
    "brochureVersionId",
    "brochureName",
    "dateSubmitted",
    "dateConfirmed",
    "File Name",
    "Proxy Provider",
    "Class Action Provider",
    "ESG Provider",
    "ESG Investment Language",
    "Email -- Compliance",
    "Email -- Proxy",
    "Email -- Brochure",
    "Email -- Item 17",
    "Email -- All",
    "Does Not Vote String",
];

/// Column name whose values key the master file and the incremental filter.
pub const VERSION_ID_COLUMN: &str = "brochureVersionId";

/// Column consulted by the advisory `max_filing_date` helper.
pub const FILING_DATE_COLUMN: &str = "Filing Date";

fn builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'));
    builder
}

/// Create a CSV file and write `header` as its first record.
pub fn create_csv_with_header(
    path: &Path,
    header: &[&str],
) -> Result<csv::Writer<File>, PipelineError> {
    let mut writer = builder().from_path(path)?;
    writer.write_record(header)?;
    Ok(writer)
}

/// Open an existing CSV for appending rows; no header is written.
pub fn open_csv_appender(path: &Path) -> Result<csv::Writer<File>, PipelineError> {
    let file = OpenOptions::new().append(true).open(path)?;
    Ok(builder().from_writer(file))
}

/// Open a headered CSV for reading.
pub fn open_csv_reader(path: &Path) -> Result<csv::Reader<File>, PipelineError> {
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?)
}

/// Flush a writer and fsync the underlying file. Stage boundaries are
/// synchronous: a stage's output must be durable before the next stage reads
/// it.
pub fn finish_csv(mut writer: csv::Writer<File>) -> Result<(), PipelineError> {
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;
    Ok(())
}
