//! Fetch trait and the reqwest-backed client.

use std::future::Future;

use url::Url;

use crate::{user_agent::rotate_headers, Error, FetchRequest, HttpResponse};

/// Anything that can turn a [`FetchRequest`] into a status and body.
///
/// Implemented by [`HttpClient`] for real traffic and by in-memory fakes in
/// tests.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send;
}

/// HTTP client with browser-like headers.
///
/// One connection pool is shared by every request. Unless disabled, each
/// request gets a freshly rotated user agent and accept-language.
pub struct HttpClient {
    http: reqwest::Client,
    rotate: bool,
}

impl HttpClient {
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| {
                tracing::error!("Failed to build HTTP client: {}", e);
                Error::Transport(e.to_string())
            })?;
        Ok(Self { http, rotate: true })
    }

    /// Sends only the headers carried by each request.
    pub fn without_header_rotation(mut self) -> Self {
        self.rotate = false;
        self
    }
}

impl Fetch for HttpClient {
    async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, Error> {
        let url = Url::parse(&request.url).map_err(|e| {
            tracing::error!("Invalid URL {}: {}", request.url, e);
            Error::InvalidUrl(format!("{}: {}", request.url, e))
        })?;

        let mut builder = self.http.get(url).timeout(request.timeout);
        if self.rotate {
            for (name, value) in rotate_headers() {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        tracing::trace!("GET {} -> {} ({} bytes)", request.url, status, body.len());

        Ok(HttpResponse { status, body })
    }
}
