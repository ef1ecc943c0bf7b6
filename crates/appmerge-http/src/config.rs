//! Transport configuration
//!
//! [`HttpConfig`] is built by the orchestration core from its own settings
//! file, so it carries no serde surface of its own.

use std::time::Duration;

use crate::middleware::RetryConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_CONNECTION_TTL: Duration = Duration::from_secs(90);
const RETRIES: u32 = 3;
const FIRST_BACKOFF: Duration = Duration::from_millis(500);

/// Knobs for the reqwest-backed merge transport
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Root that request paths such as `v1/apps/{id}/merge/lock` resolve against
    pub base_url: Option<String>,
    /// Upper bound on a whole request, body included
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Extra attempts after the first one fails with a retryable error
    pub retry_count: u32,
    /// Backoff before the first retry; doubles on each later one
    pub retry_delay: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: REQUEST_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            retry_count: RETRIES,
            retry_delay: FIRST_BACKOFF,
            proxy: None,
            user_agent: concat!("AppMerge/", env!("CARGO_PKG_VERSION")).to_string(),
            pool_idle_timeout: IDLE_CONNECTION_TTL,
        }
    }
}

impl HttpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profile for status polling. A failed poll is not retried in place
    /// because the next tick asks again anyway.
    pub fn polling() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            retry_count: 0,
            ..Self::default()
        }
    }

    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_retry_count(self, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..self
        }
    }

    pub fn with_retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    /// Route every request through `proxy`; validated when the client is built
    pub fn with_proxy(self, proxy: impl Into<String>) -> Self {
        Self {
            proxy: Some(proxy.into()),
            ..self
        }
    }

    pub fn with_user_agent(self, user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..self
        }
    }

    /// Backoff policy the client hands to its retry middleware
    pub fn retry_policy(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_count,
            initial_delay: self.retry_delay,
            ..RetryConfig::default()
        }
    }
}
