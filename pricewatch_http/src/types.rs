//! Request and response types shared by [`Fetch`](crate::Fetch) implementations.

use std::time::Duration;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// A single GET request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    /// Extra headers, applied after (and overriding) any rotated defaults.
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Status code and decoded body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn class(&self) -> StatusClass {
        StatusClass::from_status(self.status)
    }
}

/// The only status distinctions the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// Any 2xx.
    Success,
    /// 403, usually an anti-bot rejection.
    Forbidden,
    /// 429 Too Many Requests.
    RateLimited,
    /// Everything else (404, 5xx, redirects that were not followed...).
    Other(u16),
}

impl StatusClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            403 => Self::Forbidden,
            429 => Self::RateLimited,
            other => Self::Other(other),
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Forbidden | Self::RateLimited)
    }
}
