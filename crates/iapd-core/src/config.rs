use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::PipelineError;

/// Default permits/second for the firm-info API bucket.
pub const DEFAULT_API_RATE_LIMIT: u32 = 2;
/// Default permits/second for PDF downloads.
pub const DEFAULT_DOWNLOAD_RATE_LIMIT: u32 = 5;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory under which the `Data/` tree lives
    pub working_dir: PathBuf,
    pub rate_limits: RateLimitConfig,
    pub http: HttpConfig,
    pub endpoints: Endpoints,
    /// Cap firms processed in the extraction stage
    pub index_limit: Option<usize>,
    /// Archive the existing data directory before the run
    pub force_restart: bool,
    /// Incremental filtering; `None` means on when a master file exists
    pub incremental: Option<bool>,
    /// Override for the master CSV consulted by the incremental filter
    pub baseline_file: Option<PathBuf>,
    /// Mark every brochure SKIPPED instead of downloading
    pub skip_downloads: bool,
    /// Worker pool width for the catalog stage
    pub workers: usize,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Permits/second for firm-info API calls
    pub api_per_second: u32,
    /// Permits/second for brochure PDF downloads
    pub download_per_second: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Attempts per HTTP operation, including the first
    pub max_retries: u32,
    /// Base backoff delay in milliseconds
    pub retry_base_ms: u64,
}

/// Base URLs of the three upstream endpoints. Fields so tests can point them
/// at a local mock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    /// Serves `reports/CompilationReports/IA_FIRM_SEC_Feed_MM_DD_YYYY.xml.gz`
    pub feed_base: String,
    /// Serves `search/firm/{crd}`
    pub api_base: String,
    /// Serves `IAPD/Content/Common/crd_iapd_Brochure.aspx`
    pub files_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            feed_base: "https://reports.adviserinfo.sec.gov".to_string(),
            api_base: "https://api.adviserinfo.sec.gov".to_string(),
            files_base: "https://files.adviserinfo.sec.gov".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            rate_limits: RateLimitConfig {
                api_per_second: DEFAULT_API_RATE_LIMIT,
                download_per_second: DEFAULT_DOWNLOAD_RATE_LIMIT,
            },
            http: HttpConfig {
                user_agent: "IAPD-Brochure-Pipeline/0.1".to_string(),
                connect_timeout_secs: 10,
                read_timeout_secs: 30,
                max_retries: 3,
                retry_base_ms: 1_000,
            },
            endpoints: Endpoints::default(),
            index_limit: None,
            force_restart: false,
            incremental: None,
            baseline_file: None,
            skip_downloads: false,
            workers: 1,
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, starting from defaults.
    pub fn from_env() -> Self {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Ok(dir) = env::var("IAPD_WORKING_DIR") {
            config.working_dir = PathBuf::from(dir);
        }
        if let Some(rate) = parse_env_u32("IAPD_API_RATE_LIMIT") {
            config.rate_limits.api_per_second = rate;
        }
        if let Some(rate) = parse_env_u32("IAPD_DOWNLOAD_RATE_LIMIT") {
            config.rate_limits.download_per_second = rate;
        }
        if let Ok(agent) = env::var("IAPD_USER_AGENT") {
            config.http.user_agent = agent;
        }

        config
    }

    /// Reject impossible settings before any stage runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.rate_limits.api_per_second == 0 {
            return Err(PipelineError::Configuration(
                "api_rate_limit must be at least 1 permit/second".to_string(),
            ));
        }
        if self.rate_limits.download_per_second == 0 {
            return Err(PipelineError::Configuration(
                "download_rate_limit must be at least 1 permit/second".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(PipelineError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.http.max_retries == 0 {
            return Err(PipelineError::Configuration(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if matches!(self.index_limit, Some(0)) {
            return Err(PipelineError::Configuration(
                "index_limit must be at least 1 when set".to_string(),
            ));
        }
        if let Some(path) = &self.baseline_file {
            if path.as_os_str().is_empty() {
                return Err(PipelineError::Configuration(
                    "baseline_file must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.working_dir)
    }

    /// Master CSV path consulted by the incremental filter: the
    /// `baseline_file` override when present, else `Data/Output/IAPD_Data.csv`.
    pub fn baseline_path(&self) -> PathBuf {
        self.baseline_file
            .clone()
            .unwrap_or_else(|| self.layout().master_csv())
    }
}

/// **Data Directory Layout**
///
/// Fixed filesystem layout under the working directory:
/// `Data/FirmFiles`, `Data/Input`, `Data/Output`, `Data/Downloads`,
/// `Data/Logs`.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub data_dir: PathBuf,
    pub firm_files_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl DataLayout {
    pub fn new(working_dir: &Path) -> Self {
        let data_dir = working_dir.join("Data");
        Self {
            firm_files_dir: data_dir.join("FirmFiles"),
            input_dir: data_dir.join("Input"),
            output_dir: data_dir.join("Output"),
            downloads_dir: data_dir.join("Downloads"),
            logs_dir: data_dir.join("Logs"),
            data_dir,
        }
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> Result<(), PipelineError> {
        for dir in [
            &self.data_dir,
            &self.firm_files_dir,
            &self.input_dir,
            &self.output_dir,
            &self.downloads_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn master_csv(&self) -> PathBuf {
        self.output_dir.join("IAPD_Data.csv")
    }

    pub fn dated_csv(&self, stamp: &str) -> PathBuf {
        self.output_dir.join(format!("IAPD_Data_{stamp}.csv"))
    }

    pub fn stage1_csv(&self, stamp: &str) -> PathBuf {
        self.output_dir.join(format!("IA_FIRM_SEC_DATA_{stamp}.csv"))
    }

    pub fn stage2_csv(&self, stamp: &str) -> PathBuf {
        self.output_dir.join(format!("FilesToDownload_{stamp}.csv"))
    }

    pub fn stage3_csv(&self, stamp: &str) -> PathBuf {
        self.output_dir
            .join(format!("FilesToDownload_{stamp}_with_status.csv"))
    }

    /// Archive the existing data directory by renaming it with a timestamp
    /// suffix. The master CSV moves with it; the run then starts fresh.
    pub fn archive(&self, timestamp: &str) -> Result<Option<PathBuf>, PipelineError> {
        if !self.data_dir.exists() {
            return Ok(None);
        }
        let archived = self
            .data_dir
            .with_file_name(format!("Data_{timestamp}"));
        if archived.exists() {
            return Err(PipelineError::Configuration(format!(
                "archive target {} already exists",
                archived.display()
            )));
        }
        let file_count = walkdir::WalkDir::new(&self.data_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count();
        std::fs::rename(&self.data_dir, &archived)?;
        info!(
            "Archived data directory ({} files) to {}",
            file_count,
            archived.display()
        );
        Ok(Some(archived))
    }
}

fn parse_env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}
