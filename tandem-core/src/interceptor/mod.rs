//! Request/response interceptor pipeline for remote calls
//!
//! Request interceptors run in order before a request is sent, response
//! interceptors in order after the response arrives. A response interceptor
//! may ask for the original request to be replayed; the pipeline honours
//! that at most once per call.

pub mod cookie;
pub mod headers;

pub use cookie::CookieInterceptor;
pub use headers::{BasicAuthInterceptor, HeaderInterceptor};
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};

use crate::replication::types::TransportError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Outgoing request as seen by interceptors and transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, TransportError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| TransportError::InvalidRequest(format!("request body: {}", e)))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(bytes);
        Ok(self)
    }

    pub fn with_form(mut self, encoded: impl Into<String>) -> Self {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self.body = Some(encoded.into().into_bytes());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    /// Turn a non-2xx response into [`TransportError::Status`]
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                status: self.status.as_u16(),
                body: self.text(),
            })
        }
    }
}

/// Sends a single request with no interception
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// State handed to request interceptors
#[derive(Debug)]
pub struct RequestContext {
    pub request: HttpRequest,
    /// 0 for the first send, 1 for a replay
    pub attempt: u32,
}

/// State handed to response interceptors
#[derive(Debug)]
pub struct ResponseContext {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub attempt: u32,
    replay: bool,
}

impl ResponseContext {
    /// Ask the pipeline to send the original request again
    pub fn request_replay(&mut self) {
        self.replay = true;
    }

    pub fn replay_requested(&self) -> bool {
        self.replay
    }
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Inspect or modify an outgoing request. `transport` sends side requests
    /// (such as a login) outside the pipeline.
    async fn intercept_request(
        &self,
        context: &mut RequestContext,
        transport: &dyn HttpTransport,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn intercept_response(
        &self,
        context: &mut ResponseContext,
        transport: &dyn HttpTransport,
    ) -> Result<(), TransportError>;
}

/// Immutable, shareable interceptor lists
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    request: Arc<[Arc<dyn RequestInterceptor>]>,
    response: Arc<[Arc<dyn ResponseInterceptor>]>,
}

impl fmt::Debug for InterceptorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorPipeline")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .finish()
    }
}

impl InterceptorPipeline {
    pub fn new(
        request: Vec<Arc<dyn RequestInterceptor>>,
        response: Vec<Arc<dyn ResponseInterceptor>>,
    ) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }

    pub fn request_interceptors(&self) -> &[Arc<dyn RequestInterceptor>] {
        &self.request
    }

    pub fn response_interceptors(&self) -> &[Arc<dyn ResponseInterceptor>] {
        &self.response
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.response.is_empty()
    }

    /// Run `request` through every interceptor and the transport
    pub async fn execute(
        &self,
        transport: &dyn HttpTransport,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        let mut attempt = 0;
        loop {
            let mut context = RequestContext {
                request: request.clone(),
                attempt,
            };
            for interceptor in self.request.iter() {
                interceptor.intercept_request(&mut context, transport).await?;
            }

            let response = transport.send(&context.request).await?;

            let mut context = ResponseContext {
                request: context.request,
                response,
                attempt,
                replay: false,
            };
            for interceptor in self.response.iter() {
                interceptor
                    .intercept_response(&mut context, transport)
                    .await?;
            }

            if context.replay && attempt == 0 {
                debug!("Replaying {} {}", request.method, request.url);
                attempt += 1;
                continue;
            }
            return Ok(context.response);
        }
    }
}
