//! Common test utilities

use async_trait::async_trait;
use mockito::{Server, ServerGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tandem_core::interceptor::HeaderValue;
use tandem_core::{InterceptorPipeline, RequestContext, RequestInterceptor, TransportError};
use tandem_http::{CouchDatabase, CouchEndpoint};

/// Database name used by every mock server
#[allow(dead_code)]
pub const DB: &str = "animals";

/// Create a mock CouchDB server for testing
#[allow(dead_code)] // Used by other test modules
pub async fn create_mock_server() -> ServerGuard {
    Server::new_async().await
}

/// Endpoint for the test database, optionally with `user:password@`
#[allow(dead_code)]
pub fn endpoint(server: &ServerGuard, credentials: Option<&str>) -> CouchEndpoint {
    let base = server.url();
    let url = match credentials {
        Some(credentials) => base.replacen("://", &format!("://{}@", credentials), 1),
        None => base,
    };
    CouchEndpoint::parse(&format!("{}/{}", url, DB))
        .unwrap()
        .with_timeout(Duration::from_secs(5))
}

/// Setup a test database pointing to a mock server
#[allow(dead_code)] // Used by other test modules
pub async fn setup_test_database() -> (CouchDatabase, ServerGuard) {
    let server = create_mock_server().await;
    let database = endpoint(&server, None)
        .database(&InterceptorPipeline::default())
        .unwrap();
    (database, server)
}

/// Request interceptor counting every request it sees
#[derive(Default)]
pub struct CountingInterceptor {
    count: AtomicUsize,
}

#[allow(dead_code)]
impl CountingInterceptor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestInterceptor for CountingInterceptor {
    async fn intercept_request(
        &self,
        context: &mut RequestContext,
        _transport: &dyn tandem_core::HttpTransport,
    ) -> Result<(), TransportError> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        context
            .request
            .headers
            .insert("x-request-count", HeaderValue::from(count));
        Ok(())
    }
}
