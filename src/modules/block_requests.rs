//! `block_requests on|off;`: answer every request with 423 Locked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::conf::Command;
use crate::error::Result;
use crate::pipeline::{parse_switch, HandleRequest, HandleRequestResult, Hooks, Module};
use crate::proxy::ProxyResponse;

pub const DIRECTIVE: &str = "block_requests";

#[derive(Debug, Default)]
pub struct BlockRequests {
    enabled: AtomicBool,
}

impl BlockRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Module for BlockRequests {
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

impl HandleRequest for BlockRequests {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
        if self.is_enabled() {
            result.response = Some(ProxyResponse::locked());
        }
        Ok(())
    }
}
