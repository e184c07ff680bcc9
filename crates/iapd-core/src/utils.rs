use anyhow::Result;
use chrono::NaiveDate;

/// **Date Utilities**
///
/// Date parsing and formatting for the IAPD feed and output contract.
/// Output dates are MM/DD/YYYY, zero-padded; `Registration Date` alone is
/// passed through unchanged.

/// Date formats observed across the feed and the firm-info API.
const DATE_FORMATS: [&str; 4] = [
    "%m/%d/%Y", // 01/15/2024
    "%Y-%m-%d", // 2024-01-15
    "%Y%m%d",   // 20240115
    "%m-%d-%Y", // 01-15-2024
];

/// Parse a date string in any of the accepted formats.
pub fn parse_flexible_date(date_str: &str) -> Result<NaiveDate> {
    for format in &DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(date_str, format) {
            return Ok(date);
        }
    }
    Err(anyhow::anyhow!("Unable to parse date: {}", date_str))
}

/// Format a date as zero-padded MM/DD/YYYY.
pub fn format_mmddyyyy(date: &NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

/// Format a date as YYYYMMDD for file name stamps.
pub fn format_yyyymmdd(date: &NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Normalize a date string to MM/DD/YYYY. Unparseable or empty input yields
/// the empty string; the output contract forbids malformed dates.
pub fn normalize_date(date_str: &str) -> String {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match parse_flexible_date(trimmed) {
        Ok(date) => format_mmddyyyy(&date),
        Err(_) => String::new(),
    }
}

/// **URL Construction Utilities**
///
/// URL shapes of the three IAPD endpoints.

/// Daily feed URL for a given date.
pub fn build_feed_url(feed_base: &str, date: &NaiveDate) -> String {
    format!(
        "{}/reports/CompilationReports/IA_FIRM_SEC_Feed_{}.xml.gz",
        feed_base.trim_end_matches('/'),
        date.format("%m_%d_%Y")
    )
}

/// Firm-info search URL for a CRD number.
pub fn build_firm_search_url(api_base: &str, crd: &str) -> String {
    format!(
        "{}/search/firm/{}?hl=true&nrows=12&query=&start=0&wt=json",
        api_base.trim_end_matches('/'),
        crd
    )
}

/// Brochure PDF URL for a version id.
pub fn build_brochure_url(files_base: &str, version_id: &str) -> String {
    format!(
        "{}/IAPD/Content/Common/crd_iapd_Brochure.aspx?BRCHR_VRSN_ID={}",
        files_base.trim_end_matches('/'),
        version_id
    )
}

/// **Identifier Utilities**

/// A CRD number is a nonempty run of ASCII digits.
pub fn is_valid_crd(crd: &str) -> bool {
    !crd.is_empty() && crd.chars().all(|c| c.is_ascii_digit())
}

/// Brochure version ids share the CRD shape.
pub fn is_valid_version_id(version_id: &str) -> bool {
    is_valid_crd(version_id)
}

/// **PDF Utilities**

/// Magic prefix of every PDF body.
pub const PDF_MAGIC: &[u8; 5] = b"%PDF-";

/// Minimum plausible brochure size; shorter bodies are error pages.
pub const MIN_PDF_BYTES: usize = 1024;

/// First-five-bytes magic check.
pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    bytes.len() >= PDF_MAGIC.len() && &bytes[..PDF_MAGIC.len()] == PDF_MAGIC
}

/// Full acceptance check for a downloaded brochure body.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_PDF_BYTES && has_pdf_magic(bytes)
}

/// **File Size Utilities**

/// Format file size in human-readable form for logs.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: u64 = 1024;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
