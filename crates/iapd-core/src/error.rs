use std::path::PathBuf;
use thiserror::Error;

/// **Pipeline Error Types**
///
/// Error taxonomy for the IAPD brochure pipeline. Per-item conditions
/// (`ApiFailure`, `DownloadFailure`, `PdfInvalid`, `ClassificationSkipped`)
/// are recorded in the intermediate files and never abort a run; feed-level
/// and configuration conditions do.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no daily feed available within the {days}-day lookback window")]
    FeedUnavailable { days: u32 },

    #[error("fatal XML structure error in {path}: {reason}")]
    XmlParseFatal { path: PathBuf, reason: String },

    #[error("firm-info API call failed for CRD {crd}: {reason}")]
    ApiFailure { crd: String, reason: String },

    #[error("brochure download failed for version {version_id}: {reason}")]
    DownloadFailure { version_id: String, reason: String },

    #[error("downloaded bytes for version {version_id} do not satisfy the PDF magic check")]
    PdfInvalid { version_id: String },

    #[error("classification skipped for version {version_id}: {reason}")]
    ClassificationSkipped { version_id: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    /// Process exit code for this error when it aborts a run.
    ///
    /// 0 success, 1 configuration invalid, 2 feed unavailable, 3 fatal I/O.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Configuration(_) => 1,
            PipelineError::FeedUnavailable { .. } | PipelineError::XmlParseFatal { .. } => 2,
            _ => 3,
        }
    }
}
