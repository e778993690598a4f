//! `dump_log <file> | off;`: write the head of every request before it is
//! handled. Bodies are not buffered and are never dumped.

use std::fmt::Write;
use std::sync::Arc;

use super::log_file::{now_rfc3339, LogTarget};
use crate::conf::Command;
use crate::error::Result;
use crate::pipeline::{BeforeHandleRequest, Hooks, Module, RequestContext};

pub const DIRECTIVE: &str = "dump_log";

/// `<timestamp> <client>` followed by the request line and headers.
pub fn dump_request(request: &RequestContext) -> String {
    let mut out = format!("{} {}\n", now_rfc3339(), request.client_addr());
    let _ = write!(
        out,
        "{} {} {:?}",
        request.method(),
        request.uri(),
        request.version()
    );
    for (name, value) in request.headers() {
        let _ = write!(out, "\n{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out
}

#[derive(Debug, Default)]
pub struct DumpLog {
    target: LogTarget,
}

impl DumpLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for DumpLog {
    fn directive(&self) -> &'static str {
        DIRECTIVE
    }

    fn clone_module(&self) -> Arc<dyn Module> {
        Arc::new(Self {
            target: self.target.copy(),
        })
    }

    fn call(&self, command: &Command) -> Result<()> {
        self.target.configure(command, "dump log")
    }

    fn hooks(&self) -> Hooks<'_> {
        Hooks {
            before_handle_request: Some(self),
            ..Hooks::default()
        }
    }
}

impl BeforeHandleRequest for DumpLog {
    fn before_handle_request(&self, request: &RequestContext) -> Result<()> {
        if let Some(file) = self.target.current() {
            file.write_line(&dump_request(request));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::cmd;
    use crate::pipeline::request::test_request_with;
    use prifma_test_support::test_report;

    #[test]
    fn test_dump_request_head() {
        let t = test_report!("The dump holds the request line and headers");
        let request = test_request_with(
            "GET",
            "http://example.com/path?q=1",
            "10.0.0.5:1234",
            &[("user-agent", "curl/8"), ("accept", "*/*")],
        );
        let dump = dump_request(&request);
        let lines: Vec<&str> = dump.lines().collect();

        t.assert_contains("first line", lines[0], " 10.0.0.5:1234");
        t.assert_eq("request line", &lines[1], &"GET http://example.com/path?q=1 HTTP/1.1");
        t.assert_eq("header 1", &lines[2], &"user-agent: curl/8");
        t.assert_eq("header 2", &lines[3], &"accept: */*");
    }

    #[test]
    fn test_writes_before_handling() {
        let t = test_report!("dump_log appends one dump per request");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.log");
        let module = DumpLog::new();
        module.call(&cmd(DIRECTIVE, &[path.to_str().unwrap()])).unwrap();

        let request = test_request_with("CONNECT", "example.com:443", "127.0.0.1:4000", &[]);
        module.before_handle_request(&request).unwrap();
        module.before_handle_request(&request).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        t.assert_eq("dumps", &content.matches("CONNECT example.com:443 HTTP/1.1").count(), &2);

        module.call(&cmd(DIRECTIVE, &["off"])).unwrap();
        module.before_handle_request(&request).unwrap();
        let after = std::fs::read_to_string(&path).unwrap();
        t.assert_eq("off stops writing", &after.len(), &content.len());
    }
}
