use super::{
    HeaderValue, HttpRequest, HttpTransport, RequestContext, RequestInterceptor, ResponseContext,
    ResponseInterceptor, StatusCode,
};
use crate::replication::types::TransportError;
use async_trait::async_trait;
use http::header::{COOKIE, SET_COOKIE};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};
use url::{Url, form_urlencoded};

const SESSION_PATH: &str = "/_session";
const SESSION_COOKIE: &str = "AuthSession=";

/// CouchDB cookie authentication
///
/// Logs in by POSTing form-encoded credentials to `/_session` and attaches the
/// returned `AuthSession` cookie to every request. A 401, or a 403 reporting
/// `credentials_expired`, drops the cookie and asks for a replay, which logs
/// in again.
///
/// A login the server rejects with 401 or 403 is remembered: requests are
/// then sent without a cookie and no further logins are attempted.
pub struct CookieInterceptor {
    session_body: String,
    cookie: RwLock<Option<HeaderValue>>,
    rejected: AtomicBool,
    logins: AtomicU64,
}

impl CookieInterceptor {
    pub fn new(username: &str, password: &str) -> Self {
        let session_body = form_urlencoded::Serializer::new(String::new())
            .append_pair("name", username)
            .append_pair("password", password)
            .finish();

        Self {
            session_body,
            cookie: RwLock::new(None),
            rejected: AtomicBool::new(false),
            logins: AtomicU64::new(0),
        }
    }

    /// Form body sent to `/_session`
    pub fn session_body(&self) -> &str {
        &self.session_body
    }

    pub fn cookie(&self) -> Option<String> {
        self.cookie
            .read()
            .as_ref()
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// Successful or failed login attempts so far
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    /// True once the server has refused these credentials
    pub fn credentials_rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }

    fn is_session_request(url: &Url) -> bool {
        url.path() == SESSION_PATH
    }

    fn session_url(url: &Url) -> Result<Url, TransportError> {
        url.join(SESSION_PATH)
            .map_err(|e| TransportError::InvalidRequest(format!("session url: {}", e)))
    }

    async fn login(
        &self,
        transport: &dyn HttpTransport,
        url: &Url,
    ) -> Result<Option<HeaderValue>, TransportError> {
        self.logins.fetch_add(1, Ordering::Relaxed);
        let request =
            HttpRequest::post(Self::session_url(url)?).with_form(self.session_body.clone());
        let response = transport.send(&request).await?;

        if !response.is_success() {
            if matches!(
                response.status,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) {
                self.rejected.store(true, Ordering::Release);
                warn!(
                    "Credentials rejected by {} with status {}, not retrying login",
                    request.url, response.status
                );
            } else {
                warn!(
                    "Cookie login at {} failed with status {}",
                    request.url, response.status
                );
            }
            return Ok(None);
        }

        let cookie = response
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(parse_session_cookie);
        match &cookie {
            Some(_) => info!("Obtained session cookie from {}", request.url),
            None => warn!("No session cookie in response from {}", request.url),
        }
        Ok(cookie)
    }
}

/// Extract `AuthSession=<value>` from a `Set-Cookie` header
fn parse_session_cookie(header: &str) -> Option<HeaderValue> {
    let pair = header.split(';').next()?.trim();
    if !pair.starts_with(SESSION_COOKIE) {
        return None;
    }
    let mut value = HeaderValue::from_str(pair).ok()?;
    value.set_sensitive(true);
    Some(value)
}

#[async_trait]
impl RequestInterceptor for CookieInterceptor {
    async fn intercept_request(
        &self,
        context: &mut RequestContext,
        transport: &dyn HttpTransport,
    ) -> Result<(), TransportError> {
        if Self::is_session_request(&context.request.url) {
            return Ok(());
        }

        let mut cookie = self.cookie.read().clone();
        if cookie.is_none() && !self.credentials_rejected() {
            cookie = self.login(transport, &context.request.url).await?;
            *self.cookie.write() = cookie.clone();
        }

        if let Some(cookie) = cookie {
            context.request.headers.insert(COOKIE, cookie);
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseInterceptor for CookieInterceptor {
    async fn intercept_response(
        &self,
        context: &mut ResponseContext,
        _transport: &dyn HttpTransport,
    ) -> Result<(), TransportError> {
        if Self::is_session_request(&context.request.url) {
            return Ok(());
        }

        let status = context.response.status;
        let expired = status == StatusCode::UNAUTHORIZED
            || (status == StatusCode::FORBIDDEN
                && context.response.text().contains("credentials_expired"));
        if expired && !self.credentials_rejected() {
            debug!("Session cookie rejected with status {}, renewing", status);
            *self.cookie.write() = None;
            context.request_replay();
        }
        Ok(())
    }
}
