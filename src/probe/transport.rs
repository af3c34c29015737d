//! Probe transport abstraction
//!
//! A probe is a single bounded-timeout round trip against a service
//! endpoint. The trait keeps the prober testable without a network; the
//! production implementation rides on `reqwest`.

use crate::error::ProbeError;
use reqwest::Client;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// What a completed probe round trip reports back
#[derive(Debug, Clone, Copy)]
pub struct ProbeResponse {
    pub status_code: u16,
}

impl ProbeResponse {
    /// Whether the status code falls inside the success range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Trait for probe transport implementations
pub trait ProbeTransport: Send + Sync {
    fn probe<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ProbeResponse, ProbeError>> + Send + 'a>>;
}

/// HTTP GET transport over a shared connection pool
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns `ProbeError::ConnectionFailed` if the HTTP client cannot be
    /// constructed.
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::ConnectionFailed(format!("failed to build client: {}", e)))?;
        Ok(Self { client, timeout })
    }
}

impl ProbeTransport for HttpTransport {
    fn probe<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ProbeResponse, ProbeError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.client.get(url).send().await.map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    ProbeError::ConnectionFailed(e.to_string())
                }
            })?;
            Ok(ProbeResponse {
                status_code: response.status().as_u16(),
            })
        })
    }
}
