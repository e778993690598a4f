//! Per-request state threaded through the module hooks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use hyper::header::{HeaderMap, HOST, PROXY_AUTHORIZATION};
use hyper::http::request::Parts;
use hyper::{Method, Request, Uri, Version};
use url::Url;

use crate::egress::Dialer;
use crate::proxy::response::ProxyResponse;

/// Picks the upstream proxy for a request, if any.
pub type ProxySelector = Arc<dyn Fn(&RequestContext) -> Option<Url> + Send + Sync>;

/// The inbound request head plus the client address.
#[derive(Debug)]
pub struct RequestContext {
    parts: Parts,
    client_addr: SocketAddr,
}

impl RequestContext {
    pub fn new(parts: Parts, client_addr: SocketAddr) -> Self {
        Self { parts, client_addr }
    }

    /// Split a request into its context and body.
    pub fn from_request<B>(request: Request<B>, client_addr: SocketAddr) -> (Self, B) {
        let (parts, body) = request.into_parts();
        (Self::new(parts, client_addr), body)
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn version(&self) -> Version {
        self.parts.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn is_connect(&self) -> bool {
        self.parts.method == Method::CONNECT
    }

    pub(crate) fn parts_mut(&mut self) -> &mut Parts {
        &mut self.parts
    }

    /// A copy of the request head, without extensions.
    pub fn snapshot(&self) -> Self {
        let (mut parts, ()) = Request::new(()).into_parts();
        parts.method = self.parts.method.clone();
        parts.uri = self.parts.uri.clone();
        parts.version = self.parts.version;
        parts.headers = self.parts.headers.clone();
        Self::new(parts, self.client_addr)
    }

    /// `host[:port]` the client asked for: the URI authority, else the Host
    /// header.
    pub fn authority(&self) -> Option<String> {
        if let Some(authority) = self.parts.uri.authority() {
            return Some(authority.as_str().to_string());
        }
        self.parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Destination host without port or IPv6 brackets.
    pub fn hostname(&self) -> Option<String> {
        self.authority().map(|authority| split_host_port(&authority).0)
    }

    /// Credentials from a `Proxy-Authorization: Basic ...` header.
    pub fn proxy_basic_auth(&self) -> Option<(String, String)> {
        let value = self.parts.headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    pub fn proxy_user(&self) -> Option<String> {
        self.proxy_basic_auth().map(|(user, _)| user)
    }
}

/// Split `host[:port]` into the bare host and the port, if present.
pub fn split_host_port(authority: &str) -> (String, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (authority.to_string(), None),
        },
        _ => (authority.to_string(), None),
    }
}

/// Accumulated outcome of the `HandleRequest` hooks for one request.
pub struct HandleRequestResult {
    pub request: RequestContext,
    pub dialer: Dialer,
    pub proxy: Option<ProxySelector>,
    pub proxy_connect_headers: HeaderMap,
    pub response: Option<ProxyResponse>,
}

impl HandleRequestResult {
    pub fn new(request: RequestContext, dialer: Dialer) -> Self {
        Self {
            request,
            dialer,
            proxy: None,
            proxy_connect_headers: HeaderMap::new(),
            response: None,
        }
    }

    /// Evaluate the proxy selector against the request.
    pub fn proxy_url(&self) -> Option<Url> {
        self.proxy.as_ref().and_then(|select| select(&self.request))
    }
}

impl fmt::Debug for HandleRequestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRequestResult")
            .field("request", &self.request)
            .field("dialer", &self.dialer)
            .field("proxy", &self.proxy_url())
            .field("proxy_connect_headers", &self.proxy_connect_headers)
            .field("response", &self.response)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_request(method: &str, uri: &str, client: &str) -> RequestContext {
    test_request_with(method, uri, client, &[])
}

#[cfg(test)]
pub(crate) fn test_request_with(
    method: &str,
    uri: &str,
    client: &str,
    headers: &[(&str, &str)],
) -> RequestContext {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let (ctx, ()) = RequestContext::from_request(builder.body(()).unwrap(), client.parse().unwrap());
    ctx
}
