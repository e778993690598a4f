//! `access_log <file> | off;`: one JSON line per answered request.

use std::sync::Arc;

use serde::Serialize;

use super::log_file::{now_rfc3339, LogTarget};
use crate::conf::Command;
use crate::error::Result;
use crate::pipeline::{AfterWriteResponse, Hooks, Module, RequestContext};
use crate::proxy::ResponseSummary;

pub const DIRECTIVE: &str = "access_log";

/// A single access log line.
#[derive(Debug, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub client: String,
    pub status: u16,
    pub method: String,
    pub uri: String,
    pub user: Option<String>,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessLogEntry {
    pub fn new(request: &RequestContext, response: &ResponseSummary) -> Self {
        Self {
            timestamp: now_rfc3339(),
            client: request.client_addr().to_string(),
            status: response.status.as_u16(),
            method: request.method().to_string(),
            uri: request.uri().to_string(),
            user: request.proxy_user(),
            local_addr: response.local_addr.map(|a| a.to_string()),
            remote_addr: response.remote_addr.map(|a| a.to_string()),
            error: response.error.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AccessLog {
    target: LogTarget,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for AccessLog {
    fn directive(&self) -> &'static str {
        DIRECTIVE
    }

    fn clone_module(&self) -> Arc<dyn Module> {
        Arc::new(Self {
            target: self.target.copy(),
        })
    }

    fn call(&self, command: &Command) -> Result<()> {
        self.target.configure(command, "access log")
    }

    fn hooks(&self) -> Hooks<'_> {
        Hooks {
            after_write_response: Some(self),
            ..Hooks::default()
        }
    }
}

impl AfterWriteResponse for AccessLog {
    fn after_write_response(&self, request: &RequestContext, response: &ResponseSummary) -> Result<()> {
        if let Some(file) = self.target.current() {
            file.write_json(&AccessLogEntry::new(request, response));
        }
        Ok(())
    }
}
