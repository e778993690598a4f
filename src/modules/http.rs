//! `http on|off;`: forward every non-CONNECT request upstream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::conf::Command;
use crate::error::Result;
use crate::pipeline::{parse_switch, HandleRequest, HandleRequestResult, Hooks, Module};
use crate::proxy::ProxyResponse;

pub const DIRECTIVE: &str = "http";

#[derive(Debug)]
pub struct Http {
    enabled: AtomicBool,
}

impl Http {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for Http {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Http {
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

impl HandleRequest for Http {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
        if self.is_enabled() && !result.request.is_connect() {
            result.response = Some(ProxyResponse::ReverseProxy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::Dialer;
    use crate::modules::tests::cmd;
    use crate::pipeline::request::test_request;
    use prifma_test_support::test_report;

    fn answers(module: &Http, method: &str, uri: &str) -> bool {
        let mut result = HandleRequestResult::new(test_request(method, uri, "127.0.0.1:1"), Dialer::default());
        module.handle_request(&mut result).unwrap();
        matches!(result.response, Some(ProxyResponse::ReverseProxy))
    }

    #[test]
    fn test_everything_but_connect() {
        let t = test_report!("http answers every method except CONNECT");
        let module = Http::new();
        t.assert_true("get", answers(&module, "GET", "http://example.com/"));
        t.assert_true("post", answers(&module, "POST", "http://example.com/form"));
        t.assert_true("connect", !answers(&module, "CONNECT", "example.com:443"));
    }

    #[test]
    fn test_off() {
        let t = test_report!("http off leaves plain requests unanswered");
        let module = Http::new();
        module.call(&cmd(DIRECTIVE, &["off"])).unwrap();
        t.assert_true("get", !answers(&module, "GET", "http://example.com/"));
    }
}
