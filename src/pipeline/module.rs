//! The module interface and its optional request-lifecycle hooks.

use std::sync::Arc;

use super::request::{HandleRequestResult, RequestContext};
use crate::conf::{Block, Command};
use crate::error::{Error, Result};
use crate::proxy::response::ResponseSummary;

/// A pluggable unit of proxy behavior configured by one directive.
///
/// Modules are shared between request tasks, so configuration goes through
/// `&self` and each module keeps its settings behind interior mutability.
pub trait Module: Send + Sync {
    /// The directive this module answers to.
    fn directive(&self) -> &'static str;

    /// An independent copy: reconfiguring the copy never shows through on
    /// the original, and the other way round.
    fn clone_module(&self) -> Arc<dyn Module>;

    /// Apply `directive args;`.
    fn call(&self, command: &Command) -> Result<()>;

    /// Apply `directive args { ... }` and return the scope for the body.
    fn call_block(&self, command: &Command) -> Result<Box<dyn Block>> {
        Err(Error::block_not_allowed(command))
    }

    /// The lifecycle hooks this module takes part in.
    fn hooks(&self) -> Hooks<'_> {
        Hooks::default()
    }
}

/// Runs before any response is chosen; cannot alter the request.
pub trait BeforeHandleRequest: Send + Sync {
    fn before_handle_request(&self, request: &RequestContext) -> Result<()>;
}

/// May adjust the dialer or upstream proxy, or settle the response.
pub trait HandleRequest: Send + Sync {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()>;
}

/// Runs once the response has been produced.
pub trait AfterWriteResponse: Send + Sync {
    fn after_write_response(
        &self,
        request: &RequestContext,
        response: &ResponseSummary,
    ) -> Result<()>;
}

/// Hook handles a module exposes; absent hooks are skipped.
#[derive(Clone, Copy, Default)]
pub struct Hooks<'a> {
    pub before_handle_request: Option<&'a dyn BeforeHandleRequest>,
    pub handle_request: Option<&'a dyn HandleRequest>,
    pub after_write_response: Option<&'a dyn AfterWriteResponse>,
}

/// Parse the `on` / `off` argument of a switch directive.
pub fn parse_switch(command: &Command) -> Result<bool> {
    match command.single_arg() {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(_) => Err(Error::directive(command, "expected 'on' or 'off'")),
        None => Err(Error::args_number(command)),
    }
}
