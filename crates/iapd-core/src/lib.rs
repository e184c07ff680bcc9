//! IAPD Brochure Pipeline core types
//!
//! This crate holds the shared data model for the IAPD brochure pipeline:
//! typed records for every intermediate and final CSV, the error taxonomy,
//! the column-order contract, configuration, and date/URL utilities.

pub mod config;
pub mod error;
pub mod models;
pub mod schema;
pub mod utils;

pub use config::{Config, DataLayout, Endpoints};
pub use error::PipelineError;
pub use models::{
    BrochureAnalysis, BrochureDownload, BrochureRef, DownloadStatus, FirmRecord, OutputRow,
    RunSummary,
};

/// Re-export commonly used types
pub use anyhow::Result;
pub use chrono::{DateTime, NaiveDate, Utc};
pub use uuid::Uuid;
