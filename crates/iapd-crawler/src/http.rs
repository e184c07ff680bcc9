use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::redirect::Policy;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use iapd_core::config::HttpConfig;
use iapd_core::PipelineError;

/// A completed HTTP exchange. Any status is `Ok`; transport faults are `Err`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure classification surface for the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    /// Connect or read deadline exceeded
    Timeout,
    /// Connection could not be established or was reset
    Connect,
    /// Non-success HTTP status
    Status(u16),
    /// Body could not be read or decoded
    Body,
    /// The process-wide cancellation signal fired
    Cancelled,
    /// Anything reqwest reports that fits none of the above
    Other,
}

impl std::fmt::Display for HttpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpErrorKind::Timeout => f.write_str("timeout"),
            HttpErrorKind::Connect => f.write_str("connect"),
            HttpErrorKind::Status(code) => write!(f, "HTTP {code}"),
            HttpErrorKind::Body => f.write_str("body"),
            HttpErrorKind::Cancelled => f.write_str("cancelled"),
            HttpErrorKind::Other => f.write_str("other"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HttpError {
    pub kind: HttpErrorKind,
    pub message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(HttpErrorKind::Cancelled, "operation cancelled")
    }

    pub fn status(code: u16) -> Self {
        Self::new(HttpErrorKind::Status(code), format!("HTTP status {code}"))
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == HttpErrorKind::Cancelled
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            HttpErrorKind::Timeout
        } else if err.is_connect() {
            HttpErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            HttpErrorKind::Body
        } else {
            HttpErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

impl From<HttpError> for PipelineError {
    fn from(err: HttpError) -> Self {
        if err.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        }
    }
}

/// **HTTP Transport Seam**
///
/// The one interface the pipeline uses to reach the network. Production uses
/// [`HttpClient`]; tests either point the endpoint bases at a mock server or
/// substitute the trait object entirely.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// GET the URL, following redirects. Every HTTP status is `Ok`; only
    /// transport faults and cancellation are `Err`.
    async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<HttpResponse, HttpError>;

    /// GET and require a 2xx status.
    async fn get_success(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpError> {
        let response = self.get(url, cancel).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(HttpError::status(response.status))
        }
    }
}

/// GET a URL and deserialize the 2xx body as JSON.
pub async fn get_json<T: DeserializeOwned>(
    http: &dyn HttpFetch,
    url: &str,
    cancel: &CancellationToken,
) -> Result<T, HttpError> {
    let response = http.get_success(url, cancel).await?;
    serde_json::from_slice(&response.body)
        .map_err(|e| HttpError::new(HttpErrorKind::Body, format!("JSON decode failed: {e}")))
}

/// Production [`HttpFetch`] implementation on reqwest with a conventional
/// User-Agent, connect/read timeouts, and redirect following.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&config.user_agent).map_err(|_| {
            PipelineError::Configuration(format!(
                "user agent {:?} is not a valid header value",
                config.user_agent
            ))
        })?;
        headers.insert(USER_AGENT, agent);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .redirect(Policy::limited(10))
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for HttpClient {
    async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<HttpResponse, HttpError> {
        let request = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(HttpError::from_reqwest)?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(HttpError::from_reqwest)?
                .to_vec();
            debug!("GET {} -> {} ({} bytes)", url, status, body.len());
            Ok(HttpResponse { status, body })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(HttpError::cancelled()),
            result = request => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iapd_core::Config;

    fn client() -> HttpClient {
        HttpClient::new(&Config::default().http).unwrap()
    }

    #[tokio::test]
    async fn test_get_returns_any_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("not here")
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let response = client()
            .get(&format!("{}/missing", server.url()), &cancel)
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"not here");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_success_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/broken")
            .with_status(503)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let err = client()
            .get_success(&format!("{}/broken", server.url()), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, HttpErrorKind::Status(503));
    }

    #[tokio::test]
    async fn test_get_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/data")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value": 7}"#)
            .create_async()
            .await;

        #[derive(serde::Deserialize)]
        struct Payload {
            value: u32,
        }

        let cancel = CancellationToken::new();
        let http = client();
        let payload: Payload = get_json(&http, &format!("{}/data", server.url()), &cancel)
            .await
            .unwrap();
        assert_eq!(payload.value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client()
            .get("http://127.0.0.1:1/never", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_user_agent_header_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ua")
            .match_header("user-agent", "IAPD-Brochure-Pipeline/0.1")
            .with_status(200)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        client()
            .get(&format!("{}/ua", server.url()), &cancel)
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
