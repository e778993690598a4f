//! Plain HTTP forwarding through the cached round trippers.

use std::error::Error as StdError;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode, Uri, Version};

use super::response::{ErrorResponse, ProxyBody, ResponseContext, ResponseSummary};
use crate::egress::{connection_info, upstream};
use crate::error::{Error, Result};
use crate::modules::use_ip_header::PROXY_USE_IP;
use crate::pipeline::HandleRequestResult;

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers meant for prifma itself start with this.
const INTERNAL_HEADER_PREFIX: &str = "prifma-";

/// Remove hop-by-hop headers, including those named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Remove everything the client addressed to the proxy.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.remove(PROXY_USE_IP);
    let internal: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(INTERNAL_HEADER_PREFIX))
        .cloned()
        .collect();
    for name in internal {
        headers.remove(name);
    }
}

/// The request target in absolute form, built from `Host` for origin-form
/// requests.
pub fn absolute_uri(uri: &Uri, headers: &HeaderMap) -> Result<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::proxy("request without a host"))?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(host)
        .path_and_query(path)
        .build()
        .map_err(|e| Error::proxy(format!("invalid request target: {}", e)))
}

/// The request to hand to the round tripper.
pub fn upstream_request(result: &HandleRequestResult, body: Incoming) -> Result<Request<Incoming>> {
    let inbound = &result.request;
    let uri = absolute_uri(inbound.uri(), inbound.headers())?;

    let mut headers = inbound.headers().clone();
    strip_proxy_headers(&mut headers);
    if let Some(proxy) = result.proxy_url() {
        if let Some(auth) = upstream::proxy_authorization(&proxy) {
            headers.insert(PROXY_AUTHORIZATION, auth);
        }
        for name in result.proxy_connect_headers.keys() {
            headers.remove(name);
            for value in result.proxy_connect_headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }

    let mut request = Request::new(body);
    *request.method_mut() = inbound.method().clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Forward the request and relay whatever comes back.
pub async fn respond(
    result: &mut HandleRequestResult,
    body: Incoming,
    ctx: &ResponseContext,
) -> (Response<ProxyBody>, ResponseSummary) {
    let round_tripper = match ctx.round_trippers.get(result).await {
        Ok(round_tripper) => round_tripper,
        Err(e) => return ErrorResponse::from_error(&e).into_response(),
    };
    let request = match upstream_request(result, body) {
        Ok(request) => request,
        Err(e) => return ErrorResponse::new(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let sent = round_tripper.request(request);
    let outcome = match ctx.settings.write_timeout {
        Some(limit) => match tokio::time::timeout(limit, sent).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return ErrorResponse::new(StatusCode::GATEWAY_TIMEOUT, "").into_response();
            }
        },
        None => sent.await,
    };

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            let message = error_chain(&e);
            tracing::debug!(client = %result.request.client_addr(), error = %message, "forwarding failed");
            let status = if e.is_connect() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return ErrorResponse::new(status, message).into_response();
        }
    };

    let info = connection_info(&response);
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let summary = ResponseSummary {
        status: parts.status,
        local_addr: info.map(|info| info.local),
        remote_addr: info.map(|info| info.remote),
        error: None,
    };
    (Response::from_parts(parts, body.boxed()), summary)
}

/// `outer: inner: ...` for an error and its sources. A source whose text
/// is already part of the message is not repeated.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
