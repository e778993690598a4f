//! Main proxy server

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::handler::ProxyHandler;
use super::response::ResponseContext;
use crate::config::{Config, ListenSchema, ServerSettings};
use crate::egress::round_trippers::DEFAULT_CAPACITY;
use crate::egress::{RoundTrippers, TransportSettings};
use crate::error::{Error, Result};
use crate::tls;

/// The main proxy server
pub struct ProxyServer {
    settings: Arc<ServerSettings>,
    handler: ProxyHandler,
    tls: Option<TlsAcceptor>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration
    pub fn new(config: Config) -> Result<Self> {
        let settings = Arc::new(config.server);

        let tls = match settings.listen_schema {
            ListenSchema::Http => None,
            ListenSchema::Https => {
                let (Some(cert), Some(key)) = (&settings.cert_file, &settings.key_file) else {
                    return Err(Error::config(
                        "listen_schema https requires cert_file and key_file",
                    ));
                };
                Some(tls::acceptor(cert, key)?)
            }
        };

        let round_trippers = Arc::new(RoundTrippers::new(
            DEFAULT_CAPACITY,
            TransportSettings {
                idle_timeout: settings.idle_timeout,
            },
        ));
        let ctx = ResponseContext::new(Arc::clone(&settings), round_trippers);

        Ok(Self {
            handler: ProxyHandler::new(config.manager, ctx),
            settings,
            tls,
            listener: None,
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, tls = self.tls.is_some(), "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Bind the configured address and return the actual local address.
    ///
    /// Useful with port 0. Call `serve()` afterwards to accept connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = self.settings.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections on the bound listener until `shutdown` fires.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::proxy("must call bind() before serve()"))?;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    self.spawn_connection(stream, client_addr);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        let handler = self.handler.clone();
        let settings = Arc::clone(&self.settings);
        let tls = self.tls.clone();

        tokio::spawn(async move {
            match tls {
                None => serve_connection(stream, client_addr, handler, &settings).await,
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, client_addr, handler, &settings).await,
                    Err(e) => {
                        tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
                    }
                },
            }
        });
    }
}

async fn serve_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    handler: ProxyHandler,
    settings: &ServerSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handler.clone().handle(req, client_addr));

    let mut builder = http1::Builder::new();
    builder
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new());
    if let Some(timeout) = settings.read_header_timeout {
        builder.header_read_timeout(timeout);
    }

    if let Err(e) = builder.serve_connection(io, service).with_upgrades().await {
        if !e.to_string().contains("connection closed") {
            tracing::debug!(client = %client_addr, error = %e, "Connection error");
        }
    }
}
