//! CONNECT tunnels: dial the target (directly or through an upstream
//! proxy), answer 200, then relay raw bytes both ways.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::response::{empty_body, ErrorResponse, ProxyBody, ResponseContext, ResponseSummary};
use crate::egress::{format_authority, upstream};
use crate::error::{Error, Result};
use crate::pipeline::{split_host_port, HandleRequestResult};

const DEFAULT_CONNECT_PORT: u16 = 443;
const PUMP_BUFFER_SIZE: usize = 32 * 1024;

/// Per-operation timeouts of the two copy loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// A connected destination, plus any bytes the upstream proxy already sent
/// past its CONNECT response.
#[derive(Debug)]
pub struct Destination {
    pub stream: TcpStream,
    pub leftover: Bytes,
}

/// `host:port` of the CONNECT target; the port defaults to 443.
pub fn target_authority(result: &HandleRequestResult) -> Result<String> {
    let authority = result
        .request
        .authority()
        .ok_or_else(|| Error::proxy("CONNECT request without a target"))?;
    let (host, port) = split_host_port(&authority);
    Ok(format_authority(&host, port.unwrap_or(DEFAULT_CONNECT_PORT)))
}

/// Reach the CONNECT target, through the upstream proxy when one is set.
pub async fn connect(
    result: &HandleRequestResult,
    response_timeout: Option<Duration>,
) -> Result<Destination> {
    let authority = target_authority(result)?;

    let Some(proxy) = result.proxy_url() else {
        let stream = result.dialer.dial(&authority).await?;
        return Ok(Destination {
            stream,
            leftover: Bytes::new(),
        });
    };

    let (host, port) = upstream::proxy_host_port(&proxy)?;
    let local = result.dialer.local_ip(&host).await?;
    let mut stream = result.dialer.connect_from(&host, port, local).await?;
    let headers = upstream::connect_headers(&authority, &proxy, &result.proxy_connect_headers)?;

    let negotiate = upstream::negotiate(&mut stream, &authority, &headers);
    let leftover = match response_timeout {
        Some(limit) => tokio::time::timeout(limit, negotiate)
            .await
            .map_err(|_| Error::proxy("timeout waiting for upstream proxy CONNECT response"))??,
        None => negotiate.await?,
    };
    tracing::debug!(dest = %authority, proxy = %host, "tunnel negotiated through upstream proxy");
    Ok(Destination { stream, leftover })
}

/// Answer a CONNECT: dial first, then hand the upgraded client connection
/// to a relay task.
pub async fn respond(
    result: &mut HandleRequestResult,
    ctx: &ResponseContext,
) -> (Response<ProxyBody>, ResponseSummary) {
    let destination = match connect(result, ctx.settings.write_timeout).await {
        Ok(destination) => destination,
        Err(e) => {
            tracing::debug!(client = %result.request.client_addr(), error = %e, "tunnel dial failed");
            let failed = match e {
                Error::OutgoingIpNotDefined => ErrorResponse::from_error(&e),
                _ => ErrorResponse::new(StatusCode::BAD_GATEWAY, e.to_string()),
            };
            return failed.into_response();
        }
    };

    let Some(on_upgrade) = result.request.parts_mut().extensions.remove::<OnUpgrade>() else {
        return ErrorResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection cannot be upgraded",
        )
        .into_response();
    };

    let summary = ResponseSummary {
        status: StatusCode::OK,
        local_addr: destination.stream.local_addr().ok(),
        remote_addr: destination.stream.peer_addr().ok(),
        error: None,
    };
    let timeouts = PumpTimeouts {
        read: ctx.settings.tunnel_read_timeout(),
        write: ctx.settings.write_timeout,
    };
    let client = result.request.client_addr();
    tokio::spawn(relay(on_upgrade, destination, timeouts, client));

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    (response, summary)
}

async fn relay(
    on_upgrade: OnUpgrade,
    destination: Destination,
    timeouts: PumpTimeouts,
    client: SocketAddr,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::debug!(client = %client, error = %e, "failed to upgrade connection");
            return;
        }
    };
    let mut client_io = TokioIo::new(upgraded);

    if !destination.leftover.is_empty() {
        let write = client_io.write_all(&destination.leftover);
        if let Err(e) = with_timeout(timeouts.write, write).await {
            tracing::debug!(client = %client, error = %e, "tunnel write failed");
            return;
        }
    }

    match pump_both(client_io, destination.stream, timeouts).await {
        Ok(()) => tracing::trace!(client = %client, "tunnel closed"),
        Err(e) => tracing::debug!(client = %client, error = %e, "tunnel ended"),
    }
}

/// Relay between `a` and `b` until either direction stops. Both ends are
/// dropped when this returns.
pub async fn pump_both<A, B>(a: A, b: B, timeouts: PumpTimeouts) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        r = pump(&mut a_read, &mut b_write, timeouts) => r,
        r = pump(&mut b_read, &mut a_write, timeouts) => r,
    }
}

/// Copy until EOF, an error or a timed out read or write.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, timeouts: PumpTimeouts) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = with_timeout(timeouts.read, reader.read(&mut buf)).await?;
        if n == 0 {
            return Ok(());
        }
        with_timeout(timeouts.write, async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        })
        .await?;
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tunnel operation timed out"))?,
        None => fut.await,
    }
}
