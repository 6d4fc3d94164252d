//! Shared outbound HTTP client.
//!
//! One pooled `reqwest::Client` for the whole daemon with a 30 s default
//! timeout. Callers pass their cancellation scope; a request aborted by the
//! scope surfaces as `HttpError::Cancelled` rather than a transport error.

use std::sync::OnceLock;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::defaults::HTTP_TIMEOUT_SECS;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http request cancelled")]
    Cancelled,

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
}

/// Context-scoped HTTP client wrapper.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

fn shared_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("avian-os/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default()
    })
}

impl HttpClient {
    /// Client backed by the process-wide connection pool.
    pub fn new() -> Self {
        Self {
            inner: shared_client().clone(),
        }
    }

    /// GET a JSON document. The per-request timeout defaults to the client's
    /// 30 s unless `timeout` overrides it.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T, HttpError> {
        let started = std::time::Instant::now();
        let mut request = self.inner.get(url).query(query);
        if let Some(t) = timeout {
            request = request.timeout(t);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            result = request.send() => result?,
        };

        let status = response.status();
        tracing::debug!(
            url = %url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "http get"
        );
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            body = response.json::<T>() => Ok(body?),
        }
    }

    /// POST a JSON body, discarding the response body.
    pub async fn post_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<(), HttpError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            result = self.inner.post(url).json(body).send() => result?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
