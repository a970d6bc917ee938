use bytes::Bytes;
use reqwest::{header::HeaderMap, StatusCode, Url};
use std::time::Duration;
use tokio::time;

/// A response to a feed pull.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("request failed: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Issues HTTP GET requests for feed pulls.
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<Response, FetchError>;
}

/// The outcome of a fetch that did not produce a body.
#[derive(Debug, thiserror::Error)]
pub enum PullFetchError {
    #[error("{url} returned {status}")]
    Status { url: Url, status: StatusCode },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

// === impl reqwest::Client ===

#[async_trait::async_trait]
impl HttpClient for reqwest::Client {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<Response, FetchError> {
        let classify = |error: reqwest::Error| {
            if error.is_timeout() {
                FetchError::Timeout(error.into())
            } else {
                FetchError::Other(error.into())
            }
        };
        let rsp = reqwest::Client::get(self, url.clone())
            .headers(headers.clone())
            .send()
            .await
            .map_err(classify)?;
        let status = rsp.status();
        let body = rsp.bytes().await.map_err(classify)?;
        Ok(Response { status, body })
    }
}

/// Fetches `url`, retrying timeouts and server errors up to `attempts` times
/// with a fixed `backoff` between attempts.
pub async fn fetch(
    client: &dyn HttpClient,
    url: &Url,
    headers: &HeaderMap,
    attempts: usize,
    backoff: Duration,
) -> Result<Bytes, PullFetchError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match client.get(url, headers).await {
            Ok(rsp) if rsp.status.is_success() => return Ok(rsp.body),
            Ok(Response { status, .. }) => {
                let error = PullFetchError::Status {
                    url: url.clone(),
                    status,
                };
                if !status.is_server_error() {
                    return Err(error);
                }
                error
            }
            Err(error @ FetchError::Timeout(_)) => error.into(),
            Err(error) => return Err(error.into()),
        };

        if attempt >= attempts {
            return Err(error);
        }
        tracing::debug!(%url, attempt, %error, "Retrying pull");
        time::sleep(backoff).await;
    }
}
