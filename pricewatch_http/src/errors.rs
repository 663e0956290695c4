//! Error types for the fetch collaborator.

/// Errors that can occur before a status code is available.
///
/// Non-success statuses are not errors at this layer: a 403 or 429 comes
/// back as an [`HttpResponse`](crate::HttpResponse) so the caller can
/// classify it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request did not complete within its timeout.
    #[error("Request timed out")]
    Timeout,
    /// Connection, TLS or body-read failure.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}
