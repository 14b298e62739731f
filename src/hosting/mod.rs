mod discovery;
mod pagination;
pub use discovery::{discover, resolve_listing, ListingTarget};
pub use pagination::{parse_next_link, Listing, MAX_PAGES};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use serde_json::Value;

use crate::error::{MetricsError, Result};
use crate::util;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub link: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single authenticated GET. Non-2xx statuses are returned, not raised;
/// only requests that never produced a response fail here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(token: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| MetricsError::Configuration("access token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("repometrics/{}", util::tool_version()))
            .timeout(timeout)
            .build()
            .map_err(|err| MetricsError::Configuration(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| MetricsError::Transport {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let status = response.status().as_u16();
        let link = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|err| MetricsError::Transport {
            url: url.to_string(),
            reason: format!("failed to read body: {err}"),
        })?;
        Ok(HttpResponse { status, link, body })
    }
}

pub trait TransportFactory: Send + Sync {
    fn connect(&self, token: &str) -> Result<Arc<dyn Transport>>;
}

pub struct ReqwestFactory {
    timeout: Duration,
}

impl ReqwestFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TransportFactory for ReqwestFactory {
    fn connect(&self, token: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::new(token, self.timeout)?))
    }
}

#[derive(Clone)]
pub struct HostingClient {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl HostingClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn repo_url(&self, full_name: &str, tail: &str) -> String {
        format!("{}/repos/{}/{}", self.base_url, full_name, tail)
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.transport.get(url).await
    }

    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.transport.get(url).await?;
        if !response.is_success() {
            return Err(MetricsError::upstream(response.status, url, &response.body));
        }
        parse_body(url, &response.body)
    }

    pub async fn fetch_all(&self, url: &str) -> Result<Listing> {
        pagination::fetch_all(self.transport.as_ref(), url).await
    }
}

pub(crate) fn parse_body(url: &str, body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| MetricsError::malformed(url, format!("invalid JSON: {err}")))
}
