//! Shared HTTP clients for forwarded requests, cached by egress settings.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use lru::LruCache;
use tokio::net::TcpStream;
use url::Url;

use super::dialer::Dialer;
use super::upstream::proxy_host_port;
use crate::error::{Error, Result};
use crate::pipeline::{split_host_port, HandleRequestResult};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Identity of a client: everything that changes how it connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoundTripperKey {
    proxy_url: String,
    proxy_headers: String,
    local_ip: String,
}

impl RoundTripperKey {
    pub fn new(proxy: Option<&Url>, proxy_headers: &HeaderMap, local_ip: Option<IpAddr>) -> Self {
        let mut lines: Vec<String> = proxy_headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes())))
            .collect();
        lines.sort();
        Self {
            proxy_url: proxy.map(Url::to_string).unwrap_or_default(),
            proxy_headers: lines.join("\r\n"),
            local_ip: local_ip.map(|ip| ip.to_string()).unwrap_or_default(),
        }
    }
}

/// Addresses of the upstream connection that served a response, found in
/// the response extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Connector pinning the local address and optionally routing through an
/// upstream proxy.
#[derive(Debug, Clone)]
pub struct EgressConnector {
    dialer: Dialer,
    local_ip: Option<IpAddr>,
    proxy: Option<Url>,
}

impl EgressConnector {
    pub fn new(dialer: Dialer, local_ip: Option<IpAddr>, proxy: Option<Url>) -> Self {
        Self {
            dialer,
            local_ip,
            proxy,
        }
    }

    async fn connect(self, uri: Uri) -> Result<EgressConnection> {
        let (host, port, proxied) = match &self.proxy {
            Some(url) => {
                let (host, port) = proxy_host_port(url)?;
                (host, port, true)
            }
            None => {
                let authority = uri
                    .authority()
                    .ok_or_else(|| Error::proxy(format!("no authority in {}", uri)))?;
                let (host, port) = split_host_port(authority.as_str());
                let default_port = match uri.scheme_str() {
                    Some("https") => 443,
                    _ => 80,
                };
                (host, port.unwrap_or(default_port), false)
            }
        };

        let stream = self.dialer.connect_from(&host, port, self.local_ip).await?;
        let info = ConnectionInfo {
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
        };
        Ok(EgressConnection {
            io: TokioIo::new(stream),
            proxied,
            info,
        })
    }
}

impl tower::Service<Uri> for EgressConnector {
    type Response = EgressConnection;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<EgressConnection>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// A dialed upstream connection.
pub struct EgressConnection {
    io: TokioIo<TcpStream>,
    proxied: bool,
    info: ConnectionInfo,
}

impl Read for EgressConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for EgressConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Connection for EgressConnection {
    fn connected(&self) -> Connected {
        // proxied connections get absolute-form request targets
        Connected::new().proxy(self.proxied).extra(self.info)
    }
}

/// Client settings shared by every cached round tripper.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// One pooled HTTP/1 client.
pub struct RoundTripper {
    key: RoundTripperKey,
    client: Client<EgressConnector, Incoming>,
}

impl RoundTripper {
    pub fn new(key: RoundTripperKey, connector: EgressConnector, settings: TransportSettings) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(settings.idle_timeout)
            .pool_timer(TokioTimer::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .build(connector);
        Self { key, client }
    }

    pub fn key(&self) -> &RoundTripperKey {
        &self.key
    }

    /// Send `request`, which must carry an absolute URI.
    pub fn request(&self, request: Request<Incoming>) -> ResponseFuture {
        self.client.request(request)
    }
}

impl std::fmt::Debug for RoundTripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTripper").field("key", &self.key).finish()
    }
}

/// LRU cache of [`RoundTripper`]s so connection pools are reused between
/// requests with the same egress settings.
pub struct RoundTrippers {
    cache: Mutex<LruCache<RoundTripperKey, Arc<RoundTripper>>>,
    settings: TransportSettings,
}

impl std::fmt::Debug for RoundTrippers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTrippers")
            .field("len", &self.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Default for RoundTrippers {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, TransportSettings::default())
    }
}

impl RoundTrippers {
    pub fn new(capacity: usize, settings: TransportSettings) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The client for the dialer, upstream proxy and CONNECT headers the
    /// hooks settled on.
    ///
    /// The outgoing address family follows the host actually dialed: the
    /// upstream proxy when one is set, the destination otherwise.
    pub async fn get(&self, result: &HandleRequestResult) -> Result<Arc<RoundTripper>> {
        let proxy = result.proxy_url();
        let dialed = match &proxy {
            Some(url) => proxy_host_port(url)?.0,
            None => result.request.hostname().unwrap_or_default(),
        };
        let local_ip = result.dialer.local_ip(&dialed).await?;
        let key = RoundTripperKey::new(proxy.as_ref(), &result.proxy_connect_headers, local_ip);
        Ok(self.get_or_create(key, || {
            EgressConnector::new(result.dialer.clone(), local_ip, proxy.clone())
        }))
    }

    /// Cached client for `key`, building one with `connector` on a miss.
    pub fn get_or_create(
        &self,
        key: RoundTripperKey,
        connector: impl FnOnce() -> EgressConnector,
    ) -> Arc<RoundTripper> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = cache.get(&key) {
            return Arc::clone(found);
        }
        tracing::debug!(key = ?key, "creating round tripper");
        let round_tripper = Arc::new(RoundTripper::new(key.clone(), connector(), self.settings));
        cache.put(key, Arc::clone(&round_tripper));
        round_tripper
    }
}

/// Upstream addresses recorded on a forwarded response.
pub fn connection_info<B>(response: &Response<B>) -> Option<ConnectionInfo> {
    response.extensions().get::<ConnectionInfo>().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::request::test_request;
    use hyper::header::HeaderValue;
    use prifma_test_support::test_report;

    fn connector() -> EgressConnector {
        EgressConnector::new(Dialer::default(), None, None)
    }

    #[tokio::test]
    async fn test_same_key_shares_client() {
        let t = test_report!("Equal egress settings reuse one round tripper");
        let cache = RoundTrippers::default();
        let key = || RoundTripperKey::new(None, &HeaderMap::new(), Some("127.0.0.2".parse().unwrap()));
        let a = cache.get_or_create(key(), connector);
        let b = cache.get_or_create(key(), connector);
        t.assert_true("same instance", Arc::ptr_eq(&a, &b));
        t.assert_eq("entries", &cache.len(), &1);
    }

    #[tokio::test]
    async fn test_key_covers_proxy_headers_and_ip() {
        let t = test_report!("Proxy URL, CONNECT headers and local ip each split the cache");
        let cache = RoundTrippers::default();
        let proxy = Url::parse("http://p.test:3128").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-tag", HeaderValue::from_static("1"));

        cache.get_or_create(RoundTripperKey::new(None, &HeaderMap::new(), None), connector);
        cache.get_or_create(RoundTripperKey::new(Some(&proxy), &HeaderMap::new(), None), connector);
        cache.get_or_create(RoundTripperKey::new(Some(&proxy), &headers, None), connector);
        cache.get_or_create(
            RoundTripperKey::new(Some(&proxy), &headers, Some("127.0.0.1".parse().unwrap())),
            connector,
        );
        t.assert_eq("entries", &cache.len(), &4);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let t = test_report!("The cache is bounded and evicts the least recently used");
        let cache = RoundTrippers::new(2, TransportSettings::default());
        let key = |ip: &str| RoundTripperKey::new(None, &HeaderMap::new(), Some(ip.parse().unwrap()));
        let first = cache.get_or_create(key("127.0.0.1"), connector);
        cache.get_or_create(key("127.0.0.2"), connector);
        cache.get_or_create(key("127.0.0.3"), connector);
        t.assert_eq("bounded", &cache.len(), &2);
        let again = cache.get_or_create(key("127.0.0.1"), connector);
        t.assert_true("rebuilt after eviction", !Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_hit_refreshes_recency() {
        let t = test_report!("A cache hit protects the entry from the next eviction");
        let cache = RoundTrippers::new(2, TransportSettings::default());
        let key = |ip: &str| RoundTripperKey::new(None, &HeaderMap::new(), Some(ip.parse().unwrap()));
        let first = cache.get_or_create(key("127.0.0.1"), connector);
        let second = cache.get_or_create(key("127.0.0.2"), connector);
        cache.get_or_create(key("127.0.0.1"), connector);
        cache.get_or_create(key("127.0.0.3"), connector);

        let touched = cache.get_or_create(key("127.0.0.1"), connector);
        t.assert_true("touched entry survived", Arc::ptr_eq(&first, &touched));
        let untouched = cache.get_or_create(key("127.0.0.2"), connector);
        t.assert_true("untouched entry evicted", !Arc::ptr_eq(&second, &untouched));
    }

    #[tokio::test]
    async fn test_family_follows_upstream_proxy_host() {
        let t = test_report!("With an upstream proxy the outgoing family follows the proxy address");
        let cache = RoundTrippers::default();
        let mut result = HandleRequestResult::new(
            test_request("GET", "http://[2001:db8::7]/", "127.0.0.1:9"),
            Dialer::default(),
        );
        result.dialer.set_ipv4(Some("127.0.0.2".parse().unwrap()));
        result.dialer.set_ipv6(Some("::1".parse().unwrap()));
        let proxy = Url::parse("http://127.0.0.1:3128").unwrap();
        let url = proxy.clone();
        let select: crate::pipeline::ProxySelector =
            Arc::new(move |_: &crate::pipeline::RequestContext| Some(url.clone()));
        result.proxy = Some(select);

        let rt = cache.get(&result).await.unwrap();
        t.assert_eq(
            "key",
            rt.key(),
            &RoundTripperKey::new(Some(&proxy), &HeaderMap::new(), Some("127.0.0.2".parse().unwrap())),
        );
    }

    #[tokio::test]
    async fn test_get_uses_dialer_ip() {
        let t = test_report!("get keys the client by the resolved outgoing ip");
        let cache = RoundTrippers::default();
        let mut result = HandleRequestResult::new(
            test_request("GET", "http://127.0.0.1:1/", "127.0.0.1:9"),
            Dialer::default(),
        );
        result.dialer.set_ip("127.0.0.3".parse().unwrap());
        let rt = cache.get(&result).await.unwrap();
        t.assert_eq(
            "key",
            rt.key(),
            &RoundTripperKey::new(None, &HeaderMap::new(), Some("127.0.0.3".parse().unwrap())),
        );
    }
}
