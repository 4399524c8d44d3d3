//! Generic JSON-over-HTTP platform adapter
//!
//! Talks to a publishing gateway that fronts one social network:
//!
//! - `POST {endpoint}/posts` with `{title, body, media}` returns `{id, url?}`
//! - `GET {endpoint}/posts/{id}/metrics` returns a map of counter name to value
//!
//! HTTP status codes are mapped onto the adapter failure kinds so the
//! dispatcher can decide what is worth retrying.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Platform;
use crate::config::PlatformConfig;
use crate::error::{ConfigError, PlatformError, PlatformResult, Result};
use crate::types::{Content, Metrics, PublishReceipt};

#[derive(Serialize)]
struct PublishBody<'a> {
    title: &'a str,
    body: &'a str,
    media: &'a [String],
}

#[derive(Deserialize)]
struct PublishResponse {
    id: String,
    url: Option<String>,
}

pub struct HttpPlatform {
    name: String,
    endpoint: String,
    token: Option<SecretString>,
    client: Client,
}

impl HttpPlatform {
    pub fn new(
        name: &str,
        endpoint: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("platforms.{}", name),
                reason: format!("cannot build HTTP client: {}", e),
            })?;

        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn from_config(name: &str, config: &PlatformConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField(format!("platforms.{}.endpoint", name)))?;
        let token = config
            .token
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_string()));

        Self::new(name, endpoint, token, Duration::from_secs(config.timeout_secs))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    /// Map a transport failure; a timeout may have reached the server
    fn transport_error(&self, e: reqwest::Error) -> PlatformError {
        if e.is_timeout() {
            PlatformError::Ambiguous(format!("{} request timed out: {}", self.name, e))
        } else if e.is_connect() {
            PlatformError::Network(format!("{} unreachable: {}", self.name, e))
        } else if e.is_request() || e.is_body() {
            // The request may have been partially transmitted
            PlatformError::Ambiguous(format!("{} connection lost: {}", self.name, e))
        } else {
            PlatformError::Network(format!("{}: {}", self.name, e))
        }
    }
}

/// Map a non-success HTTP status onto a failure kind
pub fn classify_status(
    platform: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> PlatformError {
    let detail = if body.is_empty() {
        format!("{} returned {}", platform, status)
    } else {
        format!("{} returned {}: {}", platform, status, body)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::AuthExpired(detail),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            message: detail,
            retry_after: parse_retry_after(headers),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => PlatformError::Ambiguous(detail),
        s if s.is_client_error() => PlatformError::Rejected(detail),
        _ => PlatformError::Network(detail),
    }
}

/// `Retry-After` in delay-seconds form; HTTP-date values are ignored
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Platform for HttpPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, content: &Content) -> PlatformResult<PublishReceipt> {
        let url = format!("{}/posts", self.endpoint);
        debug!(platform = %self.name, url = %url, "Publishing");

        let request = self.client.post(&url).json(&PublishBody {
            title: &content.title,
            body: &content.body,
            media: &content.media_refs,
        });

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.name, status, &headers, &body));
        }

        // The post exists remotely but we cannot tell its id
        let parsed: PublishResponse = response.json().await.map_err(|e| {
            PlatformError::Ambiguous(format!("{} sent an unreadable receipt: {}", self.name, e))
        })?;

        Ok(PublishReceipt {
            remote_id: parsed.id,
            url: parsed.url,
        })
    }

    async fn fetch_metrics(&self, remote_id: &str) -> PlatformResult<Metrics> {
        let url = format!("{}/posts/{}/metrics", self.endpoint, remote_id);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.name, status, &headers, &body));
        }

        let counters: BTreeMap<String, u64> = response.json().await.map_err(|e| {
            PlatformError::Network(format!("{} sent unreadable metrics: {}", self.name, e))
        })?;

        Ok(Metrics {
            remote_id: remote_id.to_string(),
            counters,
        })
    }
}
