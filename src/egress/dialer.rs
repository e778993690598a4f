//! Outgoing TCP connections from a chosen local address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::error::{Error, Result};
use crate::pipeline::split_host_port;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request dialer holding the selected outgoing IPv4 and IPv6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialer {
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    connect_timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Dialer {
    /// A dialer with no outgoing address; `Duration::ZERO` disables the
    /// connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            ipv4: None,
            ipv6: None,
            connect_timeout,
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }

    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6
    }

    pub fn set_ipv4(&mut self, ip: Option<Ipv4Addr>) {
        self.ipv4 = ip;
    }

    pub fn set_ipv6(&mut self, ip: Option<Ipv6Addr>) {
        self.ipv6 = ip;
    }

    /// Use exactly `ip`, dropping any selection for the other family.
    pub fn set_ip(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                self.ipv4 = Some(v4);
                self.ipv6 = None;
            }
            IpAddr::V6(v6) => {
                self.ipv4 = None;
                self.ipv6 = Some(v6);
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// The local address to use towards `host`.
    ///
    /// With a single family selected that address is used as is. With both,
    /// the destination is resolved and IPv4 is preferred when it has an
    /// IPv4 address. `None` means the system picks the source address.
    pub async fn local_ip(&self, host: &str) -> Result<Option<IpAddr>> {
        let (ipv4, ipv6) = match (self.ipv4, self.ipv6) {
            (None, None) => return Ok(None),
            (Some(v4), None) => return Ok(Some(IpAddr::V4(v4))),
            (None, Some(v6)) => return Ok(Some(IpAddr::V6(v6))),
            (Some(v4), Some(v6)) => (v4, v6),
        };

        let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => lookup_host((host, 0))
                .await
                .map_err(|e| Error::dial(host, e))?
                .map(|addr| addr.ip())
                .collect(),
        };

        select_family(&addrs, ipv4, ipv6).map(Some)
    }

    /// Connect to `host:port`, picking the local address with [`Self::local_ip`].
    pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let (host, port) = split_host_port(addr);
        let port = port.ok_or_else(|| Error::dial(addr, "missing port"))?;
        let local = self.local_ip(&host).await?;
        self.connect_from(&host, port, local).await
    }

    /// Connect to `host:port` from `local` (any address when `None`).
    pub async fn connect_from(
        &self,
        host: &str,
        port: u16,
        local: Option<IpAddr>,
    ) -> Result<TcpStream> {
        let addr = format_authority(host, port);
        let target = lookup_host((host, port))
            .await
            .map_err(|e| Error::dial(&addr, e))?
            .find(|target| local.map_or(true, |ip| ip.is_ipv4() == target.is_ipv4()))
            .ok_or_else(|| Error::dial(&addr, "no address matches the outgoing ip family"))?;

        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| Error::dial(&addr, e))?;

        if let Some(ip) = local {
            socket
                .bind(SocketAddr::new(ip, 0))
                .map_err(|e| Error::dial(&addr, format!("bind {}: {}", ip, e)))?;
        }

        let connect = socket.connect(target);
        let stream = if self.connect_timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(self.connect_timeout, connect)
                .await
                .map_err(|_| Error::dial(&addr, "connect timeout"))?
        }
        .map_err(|e| Error::dial(&addr, e))?;

        let _ = stream.set_nodelay(true);
        tracing::trace!(addr = %addr, local = ?local, "dialed");
        Ok(stream)
    }
}

/// Source address matching the resolved destination, IPv4 first.
fn select_family(dest: &[IpAddr], ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<IpAddr> {
    if dest.iter().any(IpAddr::is_ipv4) {
        Ok(IpAddr::V4(ipv4))
    } else if dest.iter().any(IpAddr::is_ipv6) {
        Ok(IpAddr::V6(ipv6))
    } else {
        Err(Error::OutgoingIpNotDefined)
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
