use super::{HeaderMap, HeaderName, HeaderValue, HttpTransport, RequestContext, RequestInterceptor};
use crate::replication::types::TransportError;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use http::header::AUTHORIZATION;

/// Adds fixed headers to every request
#[derive(Debug, Clone, Default)]
pub struct HeaderInterceptor {
    headers: HeaderMap,
}

impl HeaderInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any earlier value of `name`
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[async_trait]
impl RequestInterceptor for HeaderInterceptor {
    async fn intercept_request(
        &self,
        context: &mut RequestContext,
        _transport: &dyn HttpTransport,
    ) -> Result<(), TransportError> {
        for (name, value) in &self.headers {
            context.request.headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

/// HTTP Basic authentication
#[derive(Clone)]
pub struct BasicAuthInterceptor {
    authorization: String,
}

impl BasicAuthInterceptor {
    pub fn new(username: &str, password: &str) -> Self {
        let credentials = format!("{}:{}", username, password);
        Self {
            authorization: format!("Basic {}", general_purpose::STANDARD.encode(credentials)),
        }
    }
}

impl std::fmt::Debug for BasicAuthInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthInterceptor").finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestInterceptor for BasicAuthInterceptor {
    async fn intercept_request(
        &self,
        context: &mut RequestContext,
        _transport: &dyn HttpTransport,
    ) -> Result<(), TransportError> {
        let mut value = HeaderValue::from_str(&self.authorization)
            .map_err(|e| TransportError::InvalidRequest(format!("authorization: {}", e)))?;
        value.set_sensitive(true);
        context.request.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}
