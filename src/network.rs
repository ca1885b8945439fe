//! HTTP fetch capability.
//!
//! The worker depends on the `Fetcher` trait; `HttpClient` is the reqwest
//! implementation. Redirects are never followed automatically so the worker
//! can route them back through the frontier.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

/// A fetched response with the decoded body, truncated at the configured cap.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub truncated: bool,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Redirect target, if the server provided one.
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_content_bytes: usize,
}

impl HttpClient {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_content_bytes: usize,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            // The worker decides what a redirect means; never follow here.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            max_content_bytes,
        })
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let mut response = self
            .client
            .get(url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        // Stream the body up to the cap; oversized payloads are truncated
        // and flagged rather than rejected.
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_content_bytes {
                let room = self.max_content_bytes - body.len();
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body,
            truncated,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("dns lookup failed: {0}")]
    Dns(String),

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("reading body failed: {0}")]
    Body(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("http client misconfigured: {0}")]
    ClientBuild(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }
        if error.is_body() || error.is_decode() {
            return FetchError::Body(error.to_string());
        }

        if error.is_connect() {
            // reqwest reports DNS and TLS trouble as flavors of connect
            // failure; the error chain text is the only discriminator left.
            let detail = error.to_string().to_lowercase();
            if detail.contains("dns") || detail.contains("resolve") || detail.contains("lookup") {
                return FetchError::Dns(error.to_string());
            }
            if detail.contains("tls") || detail.contains("certificate") {
                return FetchError::Tls(error.to_string());
            }
            return FetchError::Connect(error.to_string());
        }

        FetchError::Request(error.to_string())
    }
}
