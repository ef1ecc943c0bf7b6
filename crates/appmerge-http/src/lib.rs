//! Retrying JSON transport for AppMerge
//!
//! Provides the request primitive the merge orchestration core talks through.
//!
//! ## Features
//!
//! - **Trait-based design**: Mockable via `Transport`
//! - **Configurable**: Base URL, timeouts, retries, proxy, user-agent
//! - **Retry middleware**: Exponential backoff for network failures and 5xx responses
//! - **Typed failures**: Non-2xx responses carry their status and the server's error payload

pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod request;

pub use client::{shared_client, HttpClient, Transport};
pub use config::HttpConfig;
pub use error::{HttpError, Result};
pub use middleware::{RetryConfig, RetryMiddleware};
pub use request::ApiRequest;

/// Re-export commonly used types
pub use reqwest::{Method, StatusCode};
