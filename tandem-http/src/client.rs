//! reqwest-backed transport

use crate::error::{Result, transport_error};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use tracing::debug;

const DEFAULT_USER_AGENT: &str = concat!("tandem/", env!("CARGO_PKG_VERSION"));

/// HTTP remote configuration
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Database URL, credentials allowed in the user-info part
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Value of the `User-Agent` header
    pub user_agent: String,
}

impl CouchConfig {
    /// Create a new configuration with the given database URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Set the timeout for requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// [`HttpTransport`] over a shared reqwest client
///
/// Sends exactly what it is given; interception, retries and status handling
/// happen further up.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: Arc<CouchConfig>,
}

impl ReqwestTransport {
    pub fn new(config: CouchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &CouchConfig {
        &self.config
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &HttpRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
