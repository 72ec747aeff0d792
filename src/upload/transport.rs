use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::TransportError;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Events,
    Crashes,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Events => "/events",
            Endpoint::Crashes => "/crashes",
        }
    }
}

/// Delivers one JSON array body to the collector and returns the HTTP status.
/// Only ever called from the uploader's worker thread.
pub trait Transport: Send + Sync {
    fn send(&self, endpoint: Endpoint, body: &[u8], timeout: Duration) -> Result<u16, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, endpoint: Endpoint, body: &[u8], timeout: Duration) -> Result<u16, TransportError> {
        (**self).send(endpoint, body, timeout)
    }
}

/// `reqwest::blocking` transport. The client is built on first use, which
/// happens on the worker thread, outside any async runtime. A build failure
/// is kept and reported on every send.
pub struct HttpTransport {
    base_url: String,
    api_key: String,
    client: OnceLock<Result<reqwest::blocking::Client, String>>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: OnceLock::new(),
        }
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, TransportError> {
        self.client
            .get_or_init(|| {
                reqwest::blocking::Client::builder()
                    .build()
                    .map_err(|err| format!("failed to build HTTP client: {err}"))
            })
            .as_ref()
            .map_err(|err| TransportError::Unreachable(err.clone()))
    }
}

impl Transport for HttpTransport {
    fn send(&self, endpoint: Endpoint, body: &[u8], timeout: Duration) -> Result<u16, TransportError> {
        let url = self.url(endpoint);
        let response = self
            .client()?
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout(timeout.as_millis() as u64)
                } else {
                    TransportError::Unreachable(err.to_string())
                }
            })?;

        let status = response.status().as_u16();
        log_debug!("POST {url} -> {status} ({} bytes)", body.len());
        Ok(status)
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A collector that is never reachable.
    pub struct Refusing;

    impl Transport for Refusing {
        fn send(&self, _endpoint: Endpoint, _body: &[u8], _timeout: Duration) -> Result<u16, TransportError> {
            Err(TransportError::Unreachable("connection refused".into()))
        }
    }
}
