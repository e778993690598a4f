//! `use_ip_header on|off;`: let clients pick the outgoing address with the
//! `Proxy-Use-Ip` request header.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::header::HeaderName;
use hyper::StatusCode;

use crate::conf::Command;
use crate::error::Result;
use crate::pipeline::{parse_switch, HandleRequest, HandleRequestResult, Hooks, Module};
use crate::proxy::ProxyResponse;

pub const DIRECTIVE: &str = "use_ip_header";

/// Request header naming the outgoing IP. Never forwarded upstream.
pub const PROXY_USE_IP: HeaderName = HeaderName::from_static("proxy-use-ip");

#[derive(Debug, Default)]
pub struct UseIpHeader {
    enabled: AtomicBool,
}

impl UseIpHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Module for UseIpHeader {
    fn directive(&self) -> &'static str {
        DIRECTIVE
    }

    fn clone_module(&self) -> Arc<dyn Module> {
        Arc::new(Self {
            enabled: AtomicBool::new(self.is_enabled()),
        })
    }

    fn call(&self, command: &Command) -> Result<()> {
        self.enabled.store(parse_switch(command)?, Ordering::Relaxed);
        Ok(())
    }

    fn hooks(&self) -> Hooks<'_> {
        Hooks {
            handle_request: Some(self),
            ..Hooks::default()
        }
    }
}

impl HandleRequest for UseIpHeader {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(value) = result.request.headers().get(&PROXY_USE_IP) else {
            return Ok(());
        };
        let value = String::from_utf8_lossy(value.as_bytes()).trim().to_string();
        if value.is_empty() {
            return Ok(());
        }

        match value.parse::<IpAddr>() {
            Ok(ip) => {
                tracing::debug!(ip = %ip, "outgoing ip taken from request header");
                result.dialer.set_ip(ip.to_canonical());
            }
            Err(_) => {
                result.response = Some(ProxyResponse::error(
                    StatusCode::BAD_REQUEST,
                    format!("wrong outgoing ip: '{}'", value),
                ));
            }
        }
        Ok(())
    }
}
