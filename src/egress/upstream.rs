//! Tunnelling through an upstream HTTP proxy with `CONNECT`.

use base64::Engine;
use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, PROXY_AUTHORIZATION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::error::{Error, Result};

const MAX_RESPONSE_HEAD: usize = 64 * 1024;
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Check that `url` names an upstream proxy prifma can talk to.
pub fn validate_proxy_url(url: &Url) -> Result<()> {
    if url.scheme() != "http" {
        return Err(Error::config(format!(
            "unsupported proxy scheme '{}' in {}",
            url.scheme(),
            url
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::config(format!("proxy url without host: {}", url)));
    }
    Ok(())
}

/// Host and port to dial for the upstream proxy.
pub fn proxy_host_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::proxy(format!("proxy url without host: {}", url)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::proxy(format!("proxy url without port: {}", url)))?;
    Ok((host, port))
}

/// `Basic` credentials from the userinfo part of the proxy URL.
pub fn proxy_authorization(url: &Url) -> Option<HeaderValue> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }
    let userinfo = match url.password() {
        Some(password) => format!("{}:{}", url.username(), password),
        None => url.username().to_string(),
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(userinfo);
    HeaderValue::from_str(&format!("Basic {}", encoded)).ok()
}

/// Headers for a `CONNECT` to `authority` through `proxy`. Configured
/// `extra` headers replace the defaults of the same name.
pub fn connect_headers(authority: &str, proxy: &Url, extra: &HeaderMap) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HOST,
        HeaderValue::from_str(authority).map_err(|e| Error::proxy(e.to_string()))?,
    );
    headers.insert(PROXY_CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(auth) = proxy_authorization(proxy) {
        headers.insert(PROXY_AUTHORIZATION, auth);
    }
    for name in extra.keys() {
        headers.remove(name);
        for value in extra.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    Ok(headers)
}

/// Serialized `CONNECT` request head.
pub fn connect_request(authority: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!("CONNECT {} HTTP/1.1\r\n", authority).into_bytes();
    for (name, value) in headers {
        head.extend_from_slice(canonical_name(name.as_str()).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Send a `CONNECT` over `stream` and wait for a `200`.
///
/// Returns any bytes the proxy sent after the response head; they belong to
/// the tunnelled stream.
pub async fn negotiate<S>(stream: &mut S, authority: &str, headers: &HeaderMap) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&connect_request(authority, headers)).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::proxy("upstream proxy response head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::proxy(
                "upstream proxy closed the connection before responding to CONNECT",
            ));
        }
    };

    let head = buf.split_to(head_end);
    let status_line = head[..]
        .split(|b: &u8| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    check_status(&status_line)?;
    Ok(buf.freeze())
}

fn check_status(status_line: &str) -> Result<()> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::proxy(format!(
            "malformed CONNECT response from upstream proxy: {}",
            status_line
        )));
    }
    if code != "200" {
        return Err(Error::proxy(format!(
            "upstream proxy refused CONNECT: {}",
            status_line
        )));
    }
    Ok(())
}

/// Offset just past the blank line ending the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// `proxy-authorization` -> `Proxy-Authorization`
fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
