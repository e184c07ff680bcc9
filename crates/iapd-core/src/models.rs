use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema;

/// **Advisory Firm Record**
///
/// One SEC-registered investment adviser as projected from a `<Firm>` subtree
/// of the IAPD daily feed. Constructed by the firm extractor, immutable
/// thereafter, and persisted as one stage-1 CSV row.
///
/// Absence of a value is represented uniformly as the empty string because
/// that is what the output contract requires; no field uses a sentinel.
///
/// # Use Cases
/// - Stage-1 persistence of the decoded daily feed
/// - Join key source (`firm_crd_number`) for the final output
///
/// # Examples
/// ```rust
/// use iapd_core::models::FirmRecord;
///
/// let firm = FirmRecord {
///     firm_crd_number: "100".to_string(),
///     business_name: "Example Advisers LLC".to_string(),
///     ..FirmRecord::default()
/// };
/// assert_eq!(firm.to_stage1_record("01/15/2024").len(), 23);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmRecord {
    /// Central Registration Depository number; primary key, never empty
    pub firm_crd_number: String,

    /// SEC region code (`Info/@SECRgnCD`)
    pub sec_region_code: String,

    /// SEC file number (`Info/@SECNb`)
    pub sec_number: String,

    /// SEC member flag (`Info/@SECMb`)
    pub sec_member_flag: String,

    /// Doing-business-as name (`Info/@BusNm`)
    pub business_name: String,

    /// Legal name (`Info/@LegalNm`)
    pub legal_name: String,

    /// Main address street line 1 (`MainAddr/@Strt1`)
    pub street1: String,

    /// Main address street line 2 (`MainAddr/@Strt2`)
    pub street2: String,

    /// Main address city (`MainAddr/@City`)
    pub city: String,

    /// Main address state (`MainAddr/@State`)
    pub state: String,

    /// Main address country (`MainAddr/@Cntry`)
    pub country: String,

    /// Main address postal code (`MainAddr/@PostlCd`)
    pub postal_code: String,

    /// Telephone number (`MainAddr/@PhNb`)
    pub phone: String,

    /// Fax number (`MainAddr/@FaxNb`)
    pub fax: String,

    /// Registration firm type (`Rgstn/@FirmType`)
    pub firm_type: String,

    /// Registration state (`Rgstn/@St`)
    pub registration_state: String,

    /// Registration date, passed through unchanged (`Rgstn/@Dt`)
    pub registration_date: String,

    /// Latest filing date, normalized to MM/DD/YYYY (`Filing/@Dt`)
    pub filing_date: String,

    /// Filing form version (`Filing/@FormVrsn`)
    pub filing_version: String,

    /// Total employees (`Item5A/@TtlEmp`)
    pub total_employees: String,

    /// Regulatory assets under management (`Item5F/@Q5F2C`)
    pub aum: String,

    /// Total accounts (`Item5F/@Q5F2F`)
    pub total_accounts: String,
}

impl FirmRecord {
    /// Project this record into a stage-1 CSV row.
    ///
    /// Column order is the first 23 columns of the output contract;
    /// `BrochureURL` is always empty at this stage.
    pub fn to_stage1_record(&self, date_added: &str) -> Vec<String> {
        vec![
            date_added.to_string(),
            self.sec_region_code.clone(),
            self.firm_crd_number.clone(),
            self.sec_member_flag.clone(),
            self.business_name.clone(),
            self.legal_name.clone(),
            self.street1.clone(),
            self.street2.clone(),
            self.city.clone(),
            self.state.clone(),
            self.country.clone(),
            self.postal_code.clone(),
            self.phone.clone(),
            self.fax.clone(),
            self.firm_type.clone(),
            self.registration_state.clone(),
            self.registration_date.clone(),
            self.filing_date.clone(),
            self.filing_version.clone(),
            self.total_employees.clone(),
            self.aum.clone(),
            self.total_accounts.clone(),
            String::new(), // BrochureURL
        ]
    }

    /// Rebuild a record from a stage-1 CSV row. Returns `None` when the row
    /// is too short or carries an empty CRD number.
    pub fn from_stage1_record(record: &csv::StringRecord) -> Option<Self> {
        if record.len() < schema::STAGE1_COLUMNS.len() {
            return None;
        }
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        let firm = Self {
            sec_number: String::new(),
            sec_region_code: field(1),
            firm_crd_number: field(2),
            sec_member_flag: field(3),
            business_name: field(4),
            legal_name: field(5),
            street1: field(6),
            street2: field(7),
            city: field(8),
            state: field(9),
            country: field(10),
            postal_code: field(11),
            phone: field(12),
            fax: field(13),
            firm_type: field(14),
            registration_state: field(15),
            registration_date: field(16),
            filing_date: field(17),
            filing_version: field(18),
            total_employees: field(19),
            aum: field(20),
            total_accounts: field(21),
        };
        if firm.firm_crd_number.is_empty() {
            return None;
        }
        Some(firm)
    }

    /// Preferred display name: business name, falling back to legal name.
    pub fn display_name(&self) -> &str {
        if self.business_name.is_empty() {
            &self.legal_name
        } else {
            &self.business_name
        }
    }
}

/// **Brochure Download Status**
///
/// Per-item status recorded by the brochure fetcher. Transitions only move
/// forward from `Pending` within a run; `Failed` entries are re-evaluated
/// from scratch on the next run because they never reach the master file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    /// Not yet attempted
    Pending,
    /// HTTP 200, body at least 1 KiB, `%PDF-` magic present
    Success,
    /// Network error, HTTP 5xx, or unlisted 4xx after all retries
    Failed,
    /// Version id was empty, no URL could be composed
    NoUrl,
    /// HTTP 404 or the body failed the PDF magic check
    InvalidUrl,
    /// Caller-directed skip
    Skipped,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "PENDING",
            DownloadStatus::Success => "SUCCESS",
            DownloadStatus::Failed => "FAILED",
            DownloadStatus::NoUrl => "NO_URL",
            DownloadStatus::InvalidUrl => "INVALID_URL",
            DownloadStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DownloadStatus::Pending),
            "SUCCESS" => Some(DownloadStatus::Success),
            "FAILED" => Some(DownloadStatus::Failed),
            "NO_URL" => Some(DownloadStatus::NoUrl),
            "INVALID_URL" => Some(DownloadStatus::InvalidUrl),
            "SKIPPED" => Some(DownloadStatus::Skipped),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is permitted within a run.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        matches!(self, DownloadStatus::Pending) && !matches!(next, DownloadStatus::Pending)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// **Brochure Reference**
///
/// One published Form ADV Part 2 brochure version discovered through the
/// firm-info API. Identity is the composite (`firm_crd_number`,
/// `brochure_version_id`); the version id is globally unique in practice but
/// the composite key is the contract. Created by the catalog stage; only the
/// fetcher fills in download state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrochureRef {
    /// CRD number of the owning firm
    pub firm_crd_number: String,

    /// Firm display name carried through the intermediate files
    pub firm_name: String,

    /// Unique id of this published brochure revision
    pub brochure_version_id: String,

    /// Brochure title as published
    pub brochure_name: String,

    /// Submission date, MM/DD/YYYY
    pub date_submitted: String,

    /// Confirmation date, MM/DD/YYYY
    pub date_confirmed: String,
}

impl BrochureRef {
    pub fn to_stage2_record(&self) -> Vec<String> {
        vec![
            self.firm_crd_number.clone(),
            self.firm_name.clone(),
            self.brochure_version_id.clone(),
            self.brochure_name.clone(),
            self.date_submitted.clone(),
            self.date_confirmed.clone(),
        ]
    }

    pub fn from_stage2_record(record: &csv::StringRecord) -> Option<Self> {
        if record.len() < schema::STAGE2_COLUMNS.len() {
            return None;
        }
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        Some(Self {
            firm_crd_number: field(0),
            firm_name: field(1),
            brochure_version_id: field(2),
            brochure_name: field(3),
            date_submitted: field(4),
            date_confirmed: field(5),
        })
    }

    /// Local file name for the downloaded PDF: `{firm_crd}_{version_id}.pdf`.
    pub fn local_file_name(&self) -> String {
        format!("{}_{}.pdf", self.firm_crd_number, self.brochure_version_id)
    }
}

/// **Brochure Download Outcome**
///
/// A stage-2 reference plus the fetcher's verdict. Exactly one of these is
/// written to stage-3 for every stage-2 input row. The SHA-256 body hash is
/// kept in memory for integrity logging only; the stage-3 column set is
/// contract and does not include it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrochureDownload {
    pub brochure: BrochureRef,
    pub status: DownloadStatus,
    /// Local file name under `Data/Downloads`, empty unless status is SUCCESS
    pub file_name: String,
    /// SHA-256 of the downloaded body, when one was received
    pub sha256: Option<String>,
}

impl BrochureDownload {
    pub fn to_stage3_record(&self) -> Vec<String> {
        let mut record = self.brochure.to_stage2_record();
        record.push(self.status.as_str().to_string());
        record.push(self.file_name.clone());
        record
    }

    pub fn from_stage3_record(record: &csv::StringRecord) -> Option<Self> {
        if record.len() < schema::STAGE3_COLUMNS.len() {
            return None;
        }
        let brochure = BrochureRef::from_stage2_record(record)?;
        let status = DownloadStatus::parse(record.get(6).unwrap_or_default())?;
        Some(Self {
            brochure,
            status,
            file_name: record.get(7).unwrap_or_default().to_string(),
            sha256: None,
        })
    }
}

/// **Brochure Analysis**
///
/// The classifier's verdict over one brochure's extracted text. Every set is
/// deterministic in the input text: members are deduplicated and emitted in
/// order of first match, so identical text always yields identical bytes in
/// the output file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrochureAnalysis {
    /// Proxy-voting service providers detected in the text
    pub proxy_providers: Vec<String>,

    /// Class-action claim service providers detected in the text
    pub class_action_providers: Vec<String>,

    /// ESG data providers detected in the text
    pub esg_providers: Vec<String>,

    /// Sentence surrounding the first ESG-language match, at most 500 chars
    pub esg_language_excerpt: String,

    /// Emails found in sentences that mention compliance
    pub email_compliance: Vec<String>,

    /// Emails found in sentences that mention proxies
    pub email_proxy: Vec<String>,

    /// Emails found in sentences that mention the brochure itself
    pub email_brochure: Vec<String>,

    /// Emails found in sentences that mention Item 17
    pub email_item17: Vec<String>,

    /// Every email in the document, deduplicated, first-match order
    pub email_all: Vec<String>,

    /// Canonical marker when abstention language was detected, else empty
    pub does_not_vote_marker: String,
}

impl BrochureAnalysis {
    /// Analysis attached to rows whose text could not be extracted.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Emit a set-valued field with the `|` member separator.
    pub fn join_set(values: &[String]) -> String {
        values.join(schema::SET_DELIMITER)
    }
}

/// **Output Row**
///
/// Denormalized join of firm ⋈ brochure ⋈ analysis plus the run's
/// `date_added` stamp. Serialized as one 38-column row of the dated and
/// master CSVs; column order is fixed in [`schema::OUTPUT_COLUMNS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRow {
    /// MM/DD/YYYY stamp of the run that produced this row
    pub date_added: String,
    pub firm: FirmRecord,
    /// Source URL the brochure was fetched from
    pub brochure_url: String,
    pub brochure: BrochureRef,
    /// Local PDF file name
    pub file_name: String,
    pub analysis: BrochureAnalysis,
}

impl OutputRow {
    pub fn to_record(&self) -> Vec<String> {
        let mut record = self.firm.to_stage1_record(&self.date_added);
        // BrochureURL is the last stage-1 column, filled at merge time.
        if let Some(url) = record.last_mut() {
            *url = self.brochure_url.clone();
        }
        record.push(self.brochure.brochure_version_id.clone());
        record.push(self.brochure.brochure_name.clone());
        record.push(self.brochure.date_submitted.clone());
        record.push(self.brochure.date_confirmed.clone());
        record.push(self.file_name.clone());
        record.push(BrochureAnalysis::join_set(&self.analysis.proxy_providers));
        record.push(BrochureAnalysis::join_set(
            &self.analysis.class_action_providers,
        ));
        record.push(BrochureAnalysis::join_set(&self.analysis.esg_providers));
        record.push(self.analysis.esg_language_excerpt.clone());
        record.push(BrochureAnalysis::join_set(&self.analysis.email_compliance));
        record.push(BrochureAnalysis::join_set(&self.analysis.email_proxy));
        record.push(BrochureAnalysis::join_set(&self.analysis.email_brochure));
        record.push(BrochureAnalysis::join_set(&self.analysis.email_item17));
        record.push(BrochureAnalysis::join_set(&self.analysis.email_all));
        record.push(self.analysis.does_not_vote_marker.clone());
        record
    }
}

/// **Run Summary**
///
/// Statistics for one pipeline invocation, logged at run end and printed by
/// the CLI.
///
/// # Examples
/// ```rust
/// use iapd_core::models::RunSummary;
///
/// let mut summary = RunSummary::new();
/// summary.firms_extracted = 2;
/// summary.finish(true);
/// assert!(summary.end_time.is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique identifier for this run
    pub operation_id: Uuid,

    /// When the run started
    pub start_time: DateTime<Utc>,

    /// When the run ended
    pub end_time: Option<DateTime<Utc>>,

    /// Firms extracted from the daily feed
    pub firms_extracted: u32,

    /// Firms for which the firm-info API was queried
    pub firms_cataloged: u32,

    /// Firms contributing at least one surviving brochure
    pub firms_with_new_brochures: u32,

    /// Brochure versions discovered before incremental filtering
    pub brochures_discovered: u32,

    /// Brochure versions dropped by the incremental filter
    pub brochures_filtered: u32,

    /// Brochure versions passed to the fetcher
    pub brochures_emitted: u32,

    /// Downloads attempted (version id present, not skipped)
    pub downloads_attempted: u32,
    pub downloads_succeeded: u32,
    pub downloads_failed: u32,
    pub downloads_invalid: u32,
    pub downloads_no_url: u32,
    pub downloads_skipped: u32,

    /// Brochures classified from extracted text
    pub classifications_produced: u32,

    /// Brochures joined with an empty analysis (no usable text)
    pub classifications_skipped: u32,

    /// Rows written to the dated output file
    pub rows_written: u32,

    /// Rows appended to the master file
    pub rows_appended: u32,

    /// Per-item errors encountered along the way
    pub errors: Vec<String>,

    /// Whether the run completed without aborting
    pub success: bool,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            firms_extracted: 0,
            firms_cataloged: 0,
            firms_with_new_brochures: 0,
            brochures_discovered: 0,
            brochures_filtered: 0,
            brochures_emitted: 0,
            downloads_attempted: 0,
            downloads_succeeded: 0,
            downloads_failed: 0,
            downloads_invalid: 0,
            downloads_no_url: 0,
            downloads_skipped: 0,
            classifications_produced: 0,
            classifications_skipped: 0,
            rows_written: 0,
            rows_appended: 0,
            errors: Vec::new(),
            success: false,
        }
    }

    pub fn finish(&mut self, success: bool) {
        self.end_time = Some(Utc::now());
        self.success = success;
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}
