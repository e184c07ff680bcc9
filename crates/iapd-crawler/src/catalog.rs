use futures::StreamExt;
use indicatif::ProgressBar;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{get_json, HttpError, HttpFetch};
use crate::rate_limiter::EndpointRateLimiter;
use crate::retry::{classify_default, RetryExecutor};
use iapd_core::models::BrochureRef;
use iapd_core::schema::{self, STAGE2_COLUMNS};
use iapd_core::utils::{build_firm_search_url, normalize_date};
use iapd_core::PipelineError;

/// One brochure entry as served by the firm-info API.
///
/// The brochures array moves between two shapes in observed payloads:
/// directly under `_source.brochures.brochuredetails`, or inside
/// `_source.iacontent`, a string holding embedded JSON with the same path.
/// [`brochures_from_response`] accepts both.
#[derive(Debug, Clone, Deserialize)]
pub struct BrochureDetail {
    #[serde(
        rename = "brchrVrsnID",
        alias = "brochureVersionId",
        default,
        deserialize_with = "de_string_or_number"
    )]
    pub version_id: String,

    #[serde(rename = "brchrNm", alias = "brochureName", default)]
    pub name: String,

    #[serde(rename = "dtSubmtd", alias = "dateSubmitted", default)]
    pub date_submitted: String,

    #[serde(rename = "dtCnfrmd", alias = "dateConfirmed", default)]
    pub date_confirmed: String,
}

/// Version ids arrive as either JSON numbers or strings.
fn de_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Pull every brochure entry out of a firm-info search response.
pub fn brochures_from_response(response: &Value) -> Vec<BrochureDetail> {
    let mut details = Vec::new();
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for hit in hits {
        if let Some(source) = hit.get("_source") {
            details.extend(details_from_source(source));
        }
    }
    details
}

fn details_from_source(source: &Value) -> Vec<BrochureDetail> {
    if let Some(node) = source.pointer("/brochures/brochuredetails") {
        return match node {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            // A firm with a single brochure serves an object, not an array.
            Value::Object(_) => serde_json::from_value(node.clone())
                .map(|detail| vec![detail])
                .unwrap_or_default(),
            _ => Vec::new(),
        };
    }
    if let Some(content) = source.get("iacontent").and_then(Value::as_str) {
        if let Ok(inner) = serde_json::from_str::<Value>(content) {
            return details_from_source(&inner);
        }
    }
    Vec::new()
}

/// Statistics for one catalog pass. Logged, never persisted.
#[derive(Debug, Clone, Default)]
pub struct CatalogStats {
    pub firms_processed: u32,
    pub firms_with_brochures: u32,
    pub brochures_discovered: u32,
    pub brochures_filtered: u32,
    pub brochures_emitted: u32,
    pub errors: Vec<String>,
}

/// **Brochure Catalog**
///
/// For each stage-1 firm, queries the firm-info JSON API for published
/// brochure versions, drops versions already present in the master output,
/// and writes the survivors as stage-2 rows. A failing firm contributes zero
/// brochures and never aborts the stage.
pub struct BrochureCatalog {
    http: Arc<dyn HttpFetch>,
    retry: RetryExecutor,
    limiter: EndpointRateLimiter,
    api_base: String,
    workers: usize,
}

impl BrochureCatalog {
    pub fn new(
        http: Arc<dyn HttpFetch>,
        retry: RetryExecutor,
        limiter: EndpointRateLimiter,
        api_base: String,
        workers: usize,
    ) -> Self {
        Self {
            http,
            retry,
            limiter,
            api_base,
            workers: workers.max(1),
        }
    }

    /// Enumerate brochures for every firm in `stage1_path`, writing stage-2
    /// rows for versions not in `existing_fingerprints`.
    pub async fn catalog(
        &self,
        stage1_path: &Path,
        stage2_path: &Path,
        existing_fingerprints: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<CatalogStats, PipelineError> {
        let firms = load_firms(stage1_path)?;
        let mut writer = schema::create_csv_with_header(stage2_path, &STAGE2_COLUMNS)?;
        let mut stats = CatalogStats::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let progress = ProgressBar::new(firms.len() as u64);
        let mut cancelled = false;

        let mut tasks = futures::stream::iter(firms.into_iter().map(|(crd, name)| {
            let cancel = cancel.clone();
            async move {
                let result = self.fetch_firm_brochures(&crd, &cancel).await;
                (crd, name, result)
            }
        }))
        .buffer_unordered(self.workers);

        while let Some((crd, name, result)) = tasks.next().await {
            progress.inc(1);
            stats.firms_processed += 1;

            let details = match result {
                Ok(details) => details,
                Err(err) if err.is_cancelled() => {
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    let message = format!("API failure for CRD {crd}: {err}");
                    warn!("{}", message);
                    stats.errors.push(message);
                    continue;
                }
            };

            let mut surviving = 0u32;
            for detail in details {
                stats.brochures_discovered += 1;
                if existing_fingerprints.contains(&detail.version_id)
                    && !detail.version_id.is_empty()
                {
                    stats.brochures_filtered += 1;
                    continue;
                }
                if !seen.insert((crd.clone(), detail.version_id.clone())) {
                    debug!(
                        "Duplicate brochure ({}, {}) within this run",
                        crd, detail.version_id
                    );
                    continue;
                }
                let brochure = BrochureRef {
                    firm_crd_number: crd.clone(),
                    firm_name: name.clone(),
                    brochure_version_id: detail.version_id,
                    brochure_name: detail.name,
                    date_submitted: normalize_date(&detail.date_submitted),
                    date_confirmed: normalize_date(&detail.date_confirmed),
                };
                writer.write_record(brochure.to_stage2_record())?;
                stats.brochures_emitted += 1;
                surviving += 1;
            }
            if surviving > 0 {
                stats.firms_with_brochures += 1;
            }
        }

        drop(tasks);
        progress.finish_and_clear();
        schema::finish_csv(writer)?;

        if cancelled {
            return Err(PipelineError::Cancelled);
        }

        let average = if stats.firms_processed > 0 {
            f64::from(stats.brochures_emitted) / f64::from(stats.firms_processed)
        } else {
            0.0
        };
        info!(
            "Cataloged {} firms: {} with new brochures, {} brochures emitted \
             ({} filtered as already processed, {:.2} avg/firm)",
            stats.firms_processed,
            stats.firms_with_brochures,
            stats.brochures_emitted,
            stats.brochures_filtered,
            average
        );
        Ok(stats)
    }

    async fn fetch_firm_brochures(
        &self,
        crd: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<BrochureDetail>, HttpError> {
        self.limiter
            .acquire(cancel)
            .await
            .map_err(|_| HttpError::cancelled())?;
        let url = build_firm_search_url(&self.api_base, crd);
        let response: Value = self
            .retry
            .run(cancel, classify_default, || {
                get_json(self.http.as_ref(), &url, cancel)
            })
            .await?;
        Ok(brochures_from_response(&response))
    }
}

/// Stage-1 rows projected down to (CRD, display name).
fn load_firms(stage1_path: &Path) -> Result<Vec<(String, String)>, PipelineError> {
    let mut reader = schema::open_csv_reader(stage1_path)?;
    let mut firms = Vec::new();
    for record in reader.records() {
        let record = record?;
        let crd = record.get(2).unwrap_or_default().to_string();
        if crd.is_empty() {
            continue;
        }
        let business = record.get(4).unwrap_or_default();
        let legal = record.get(5).unwrap_or_default();
        let name = if business.is_empty() { legal } else { business };
        firms.push((crd, name.to_string()));
    }
    Ok(firms)
}
