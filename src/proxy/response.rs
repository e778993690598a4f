//! Responses a request can end in, and what gets recorded about them

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

use super::{reverse_proxy, tunnel};
use crate::config::ServerSettings;
use crate::egress::RoundTrippers;
use crate::error::Error;
use crate::pipeline::HandleRequestResult;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub const ERROR_HEADER: HeaderName = HeaderName::from_static("x-prifma-error");
const NOSNIFF: HeaderName = HeaderName::from_static("x-content-type-options");

pub const CLIENT_CLOSED_REQUEST_TEXT: &str = "Client Closed Request";

/// The non-standard 499 status used when the client gave up first.
pub fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Reason phrase for `status`, including 499.
pub fn status_text(status: StatusCode) -> &'static str {
    if status.as_u16() == 499 {
        return CLIENT_CLOSED_REQUEST_TEXT;
    }
    status.canonical_reason().unwrap_or("Unknown Status")
}

/// What a `HandleRequest` hook decided to answer with.
#[derive(Debug, Clone)]
pub enum ProxyResponse {
    /// Open a byte tunnel to the CONNECT target.
    Tunnel,
    /// Forward the request and relay the upstream response.
    ReverseProxy,
    /// Answer locally with a status and short text body.
    Error(ErrorResponse),
}

impl ProxyResponse {
    /// A failure response; the message defaults to the status text.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        ProxyResponse::Error(ErrorResponse::new(status, message))
    }

    /// 423 for blocked requests.
    pub fn locked() -> Self {
        ProxyResponse::Error(ErrorResponse::new(StatusCode::LOCKED, "").not_an_error())
    }

    /// 407 asking the client for proxy credentials.
    pub fn require_auth(realm: &str) -> Self {
        let mut response = ErrorResponse::new(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "407 Proxy Authentication Required",
        )
        .not_an_error();
        response.error_header = false;
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm)) {
            response.headers.insert(PROXY_AUTHENTICATE, value);
        }
        ProxyResponse::Error(response)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProxyResponse::Error(e) if e.is_error)
    }

    /// Produce the HTTP response for the client.
    ///
    /// `body` is only consumed by the reverse proxy.
    pub async fn write(
        self,
        result: &mut HandleRequestResult,
        body: Incoming,
        ctx: &ResponseContext,
    ) -> (Response<ProxyBody>, ResponseSummary) {
        match self {
            ProxyResponse::Tunnel => tunnel::respond(result, ctx).await,
            ProxyResponse::ReverseProxy => reverse_proxy::respond(result, body, ctx).await,
            ProxyResponse::Error(response) => response.into_response(),
        }
    }
}

/// A locally generated answer.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    status: StatusCode,
    message: String,
    headers: HeaderMap,
    error_header: bool,
    is_error: bool,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            status_text(status).to_string()
        } else {
            message
        };
        Self {
            status,
            message,
            headers: HeaderMap::new(),
            error_header: true,
            is_error: true,
        }
    }

    /// Map a request-time failure onto a status.
    pub fn from_error(err: &Error) -> Self {
        let status = match err {
            Error::OutgoingIpNotDefined => StatusCode::BAD_REQUEST,
            Error::Dial { .. } | Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }

    /// Intended outcomes (block, auth challenge) are not logged as failures.
    fn not_an_error(mut self) -> Self {
        self.is_error = false;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_response(self) -> (Response<ProxyBody>, ResponseSummary) {
        let summary = ResponseSummary {
            status: self.status,
            local_addr: None,
            remote_addr: None,
            error: self
                .is_error
                .then(|| format!("{} {}", self.status.as_u16(), self.message)),
        };

        let mut response = Response::new(full_body(format!("{}\n", self.message)));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(NOSNIFF, HeaderValue::from_static("nosniff"));
        if self.error_header {
            headers.insert(ERROR_HEADER, HeaderValue::from_static(status_text(self.status)));
        }
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        (response, summary)
    }
}

/// What `AfterWriteResponse` hooks learn about the written response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: StatusCode,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Set when the response counts as a failure.
    pub error: Option<String>,
}

impl ResponseSummary {
    pub fn ok(status: StatusCode) -> Self {
        Self {
            status,
            local_addr: None,
            remote_addr: None,
            error: None,
        }
    }

    pub fn client_closed() -> Self {
        let status = client_closed_request();
        Self {
            status,
            local_addr: None,
            remote_addr: None,
            error: Some(format!("{} {}", status.as_u16(), CLIENT_CLOSED_REQUEST_TEXT)),
        }
    }
}

/// Server-wide state responses are written with.
#[derive(Clone)]
pub struct ResponseContext {
    pub settings: Arc<ServerSettings>,
    pub round_trippers: Arc<RoundTrippers>,
}

impl ResponseContext {
    pub fn new(settings: Arc<ServerSettings>, round_trippers: Arc<RoundTrippers>) -> Self {
        Self {
            settings,
            round_trippers,
        }
    }
}

impl std::fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseContext")
            .field("settings", &self.settings)
            .field("round_trippers", &self.round_trippers)
            .finish()
    }
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

pub fn full_body(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into()).map_err(|e| match e {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prifma_test_support::test_report;

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_error_response_defaults_to_status_text() {
        let t = test_report!("Error responses without a message use the status text");
        let ProxyResponse::Error(err) = ProxyResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "") else {
            panic!("expected an error response");
        };
        let (response, summary) = err.into_response();
        t.assert_eq("status", &response.status(), &StatusCode::INTERNAL_SERVER_ERROR);
        t.assert_eq(
            "error header",
            &response.headers()[ERROR_HEADER],
            &HeaderValue::from_static("Internal Server Error"),
        );
        t.assert_eq(
            "summary error",
            &summary.error,
            &Some("500 Internal Server Error".to_string()),
        );
        t.assert_eq("body", &body_text(response).await, &"Internal Server Error\n".to_string());
    }

    #[test]
    fn test_locked_is_not_logged_as_error() {
        let t = test_report!("423 Locked carries the error header but is not a failure");
        let response = ProxyResponse::locked();
        t.assert_true("not error", !response.is_error());
        let ProxyResponse::Error(err) = response else {
            panic!("expected an error response");
        };
        let (response, summary) = err.into_response();
        t.assert_eq("status", &response.status(), &StatusCode::LOCKED);
        t.assert_eq("header", &response.headers()[ERROR_HEADER], &HeaderValue::from_static("Locked"));
        t.assert_eq("no error", &summary.error, &None);
    }

    #[tokio::test]
    async fn test_error_header_carries_status_text_only() {
        let t = test_report!("Detailed messages stay in the body, the header gets the status text");
        let err = ErrorResponse::from_error(&Error::dial("10.0.0.1:80", "connection refused"));
        let (response, summary) = err.into_response();
        t.assert_eq("status", &response.status(), &StatusCode::BAD_GATEWAY);
        t.assert_eq("header", &response.headers()[ERROR_HEADER], &HeaderValue::from_static("Bad Gateway"));
        t.assert_contains("summary", summary.error.as_deref().unwrap_or_default(), "connection refused");
        t.assert_eq(
            "body",
            &body_text(response).await,
            &"dial 10.0.0.1:80: connection refused\n".to_string(),
        );
    }

    #[test]
    fn test_require_auth_challenge() {
        let t = test_report!("407 carries a Basic Proxy-Authenticate challenge");
        let ProxyResponse::Error(err) = ProxyResponse::require_auth("prifma") else {
            panic!("expected an error response");
        };
        let (response, _) = err.into_response();
        t.assert_eq("status", &response.status(), &StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        t.assert_eq(
            "challenge",
            &response.headers()[PROXY_AUTHENTICATE],
            &HeaderValue::from_static("Basic realm=\"prifma\""),
        );
        t.assert_true("no error header", response.headers().get(ERROR_HEADER).is_none());
    }

    #[test]
    fn test_from_error_status_mapping() {
        let t = test_report!("Request-time errors map to 400, 502 or 500");
        t.assert_eq(
            "no outgoing ip",
            &ErrorResponse::from_error(&Error::OutgoingIpNotDefined).status(),
            &StatusCode::BAD_REQUEST,
        );
        t.assert_eq(
            "dial",
            &ErrorResponse::from_error(&Error::dial("a.test:80", "refused")).status(),
            &StatusCode::BAD_GATEWAY,
        );
        t.assert_eq(
            "other",
            &ErrorResponse::from_error(&Error::config("x")).status(),
            &StatusCode::INTERNAL_SERVER_ERROR,
        );
        t.assert_eq("499 text", &status_text(client_closed_request()), &"Client Closed Request");
    }
}
