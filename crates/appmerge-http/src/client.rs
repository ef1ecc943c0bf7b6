//! Transport implementation

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{
    config::HttpConfig,
    error::{HttpError, Result},
    middleware::RetryMiddleware,
    request::ApiRequest,
};

/// Mockable request primitive
///
/// Resolves to the parsed JSON body (`Value::Null` for an empty body) or an
/// [`HttpError`] carrying the status code and the server's error payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<Value>;
}

/// Production transport backed by reqwest
pub struct HttpClient {
    inner: reqwest::Client,
    config: HttpConfig,
    base_url: Option<Url>,
    retry: RetryMiddleware,
}

impl HttpClient {
    /// Create a new HTTP client with configuration
    pub fn new(config: HttpConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(parse_base_url)
            .transpose()?;

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .pool_idle_timeout(config.pool_idle_timeout);

        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| HttpError::InvalidProxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let inner = builder
            .build()
            .map_err(|e| HttpError::BuildError(e.to_string()))?;

        let retry = RetryMiddleware::new(config.retry_policy());

        Ok(Self {
            inner,
            config,
            base_url,
            retry,
        })
    }

    /// Create HTTP client with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(HttpConfig::default())
    }

    /// Get configuration
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Resolve a request path against the base URL
    pub fn resolve(&self, path: &str) -> Result<Url> {
        match &self.base_url {
            Some(base) => base
                .join(path.trim_start_matches('/'))
                .map_err(|e| HttpError::InvalidUrl(e.to_string())),
            None => path
                .parse::<Url>()
                .map_err(|e| HttpError::InvalidUrl(e.to_string())),
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<Value> {
        let url = self.resolve(&request.path)?;
        debug!("HTTP {} {}", request.method, url);

        let mut builder = self.inner.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(self.config.timeout)
            } else {
                HttpError::RequestFailed(e)
            }
        })?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let payload = serde_json::from_slice::<Value>(&body).ok();
            let message = payload
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| {
                    let text = String::from_utf8_lossy(&body).trim().to_string();
                    if text.is_empty() {
                        status
                            .canonical_reason()
                            .unwrap_or("Unknown error")
                            .to_string()
                    } else {
                        text
                    }
                });
            return Err(HttpError::HttpStatus {
                status,
                message,
                payload,
            });
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(&self, request: ApiRequest) -> Result<Value> {
        self.retry.execute(|| self.send_once(&request)).await
    }
}

/// Create a shared transport (Arc-wrapped for cloning)
pub fn shared_client(config: HttpConfig) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(HttpClient::new(config)?))
}

fn parse_base_url(raw: &str) -> Result<Url> {
    // A base without a trailing slash would drop its last segment on join
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    normalized
        .parse::<Url>()
        .map_err(|e| HttpError::InvalidUrl(e.to_string()))
}

fn error_message(payload: &Value) -> Option<String> {
    ["message", "error", "description"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}
