//! `tunnel on|off;`: answer CONNECT requests with a byte tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::conf::Command;
use crate::error::Result;
use crate::pipeline::{parse_switch, HandleRequest, HandleRequestResult, Hooks, Module};
use crate::proxy::ProxyResponse;

pub const DIRECTIVE: &str = "tunnel";

#[derive(Debug)]
pub struct Tunnel {
    enabled: AtomicBool,
}

impl Tunnel {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Tunnel {
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

impl HandleRequest for Tunnel {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
        if self.is_enabled() && result.request.is_connect() {
            result.response = Some(ProxyResponse::Tunnel);
        }
        Ok(())
    }
}
