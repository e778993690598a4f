//! Test infrastructure for end-to-end proxy tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prifma::{Config, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub use prifma_test_support::{test_report, TestReport};

// ---------------------------------------------------------------------------
// TestProxy: a prifma instance on an ephemeral loopback port
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Start a proxy with `modules` as the configuration body.
    pub async fn start(modules: &str) -> Self {
        let text = format!(
            "server {{\n    listen_ip 127.0.0.1;\n    listen_port 0;\n    write_timeout 5s;\n}}\n{}",
            modules
        );
        let config = Config::parse(&text).unwrap();
        Self::start_with_config(config).await
    }

    pub async fn start_with_config(config: Config) -> Self {
        let mut server = ProxyServer::new(config).unwrap();
        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });
        Self { addr, shutdown_tx }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A reqwest client sending everything through `proxy_addr`.
pub fn test_client(proxy_addr: SocketAddr) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    reqwest::Client::builder()
        .proxy(proxy)
        .http1_only()
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// TestUpstream: a plain HTTP origin that echoes what it received
// ---------------------------------------------------------------------------

pub struct TestUpstream {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    /// Start an origin answering 200 with `peer=<ip>`, the request line and
    /// the received headers, one per line.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, peer)) = result else { continue };
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| echo(req, peer));
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn echo(
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let mut lines = vec![
        format!("peer={}", peer.ip()),
        format!("{} {}", req.method(), req.uri()),
    ];
    for (name, value) in req.headers() {
        lines.push(format!("{}: {}", name, value.to_str().unwrap_or("?")));
    }
    let body = req.into_body().collect().await?.to_bytes();
    lines.push(format!("body={}", String::from_utf8_lossy(&body)));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(lines.join("\n"))))
        .unwrap())
}

/// The `peer=` line of an echo body.
pub fn echoed_peer(body: &str) -> String {
    body.lines()
        .find_map(|line| line.strip_prefix("peer="))
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// TestEchoServer: raw TCP echo, the target of CONNECT tests
// ---------------------------------------------------------------------------

pub struct TestEchoServer {
    pub addr: SocketAddr,
    /// Peer address of every accepted connection.
    pub peers: Arc<Mutex<Vec<SocketAddr>>>,
}

impl TestEchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peers = Arc::new(Mutex::new(Vec::new()));
        let seen = peers.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, peer)) = listener.accept().await {
                seen.lock().unwrap().push(peer);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        Self { addr, peers }
    }
}

// ---------------------------------------------------------------------------
// TestUpstreamProxy: records request heads, accepts CONNECT and echoes
// ---------------------------------------------------------------------------

pub struct TestUpstreamProxy {
    pub addr: SocketAddr,
    /// Raw request heads received, in arrival order.
    pub heads: Arc<Mutex<Vec<String>>>,
}

impl TestUpstreamProxy {
    /// CONNECT gets `200 Connection established` and then an echo tunnel.
    /// Anything else gets a 200 whose body is the received head.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let heads = Arc::new(Mutex::new(Vec::new()));
        let seen = heads.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(serve_upstream_proxy(stream, seen));
            }
        });

        Self { addr, heads }
    }

    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }
}

async fn serve_upstream_proxy(mut stream: TcpStream, seen: Arc<Mutex<Vec<String>>>) {
    let head = match read_head(&mut stream).await {
        Some(head) => head,
        None => return,
    };
    seen.lock().unwrap().push(head.clone());

    if head.starts_with("CONNECT ") {
        if stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    } else {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            head.len(),
            head
        );
        let _ = stream.write_all(response.as_bytes()).await;
    }
}

/// Read bytes up to and including the blank line that ends a head.
pub async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Open a CONNECT tunnel through the proxy and return the stream together
/// with the proxy's response head.
pub async fn connect_through(
    proxy: SocketAddr,
    target: &str,
    extra_headers: &[(&str, &str)],
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await.unwrap();
    (stream, head)
}

/// Send `payload` into a tunnel and read the same number of bytes back.
pub async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}
