use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use iapd_core::PipelineError;

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// **Endpoint Rate Limiter**
///
/// Token-bucket governor for one upstream endpoint. The pipeline holds two
/// instances with independent rates: `api` for firm-info calls and
/// `download` for brochure PDFs. Permits are spaced evenly at the configured
/// rate so that no sliding one-second window ever observes more than
/// `permits_per_second` requests, and the limiter is safe for concurrent
/// callers.
///
/// # Examples
/// ```rust,no_run
/// use iapd_crawler::rate_limiter::EndpointRateLimiter;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> anyhow::Result<()> {
/// let limiter = EndpointRateLimiter::api(2)?;
/// let cancel = CancellationToken::new();
///
/// // Wait for a permit before making a request
/// limiter.acquire(&cancel).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EndpointRateLimiter {
    name: &'static str,
    limiter: Arc<DirectLimiter>,
    permits_per_second: u32,
}

impl EndpointRateLimiter {
    /// Create a limiter emitting `permits_per_second` evenly spaced permits.
    pub fn new(name: &'static str, permits_per_second: u32) -> Result<Self, PipelineError> {
        if permits_per_second == 0 {
            return Err(PipelineError::Configuration(format!(
                "{name} rate limit must be at least 1 permit/second"
            )));
        }
        let period = Duration::from_secs_f64(1.0 / f64::from(permits_per_second));
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                PipelineError::Configuration(format!("{name} rate limit produced a zero period"))
            })?
            .allow_burst(nonzero!(1u32));

        Ok(Self {
            name,
            limiter: Arc::new(RateLimiter::direct(quota)),
            permits_per_second,
        })
    }

    /// Limiter for the firm-info API bucket.
    pub fn api(permits_per_second: u32) -> Result<Self, PipelineError> {
        Self::new("api_rate_limit", permits_per_second)
    }

    /// Limiter for the PDF download bucket.
    pub fn download(permits_per_second: u32) -> Result<Self, PipelineError> {
        Self::new("download_rate_limit", permits_per_second)
    }

    /// Block until one permit is available. Returns promptly with
    /// [`PipelineError::Cancelled`] when the cancellation signal fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = self.limiter.until_ready() => {
                debug!("{} permit granted", self.name);
                Ok(())
            }
        }
    }

    /// Take a permit only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn permits_per_second(&self) -> u32 {
        self.permits_per_second
    }
}
