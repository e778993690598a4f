//! HTTP request handler for the proxy

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

use super::response::{ProxyBody, ProxyResponse, ResponseContext, ResponseSummary};
use crate::egress::Dialer;
use crate::pipeline::{HandleRequestResult, ModuleSet, ModulesManager, RequestContext};

/// Runs one request through the module hooks and writes the response.
#[derive(Clone)]
pub struct ProxyHandler {
    manager: Arc<ModulesManager>,
    ctx: ResponseContext,
}

impl ProxyHandler {
    pub fn new(manager: Arc<ModulesManager>, ctx: ResponseContext) -> Self {
        Self { manager, ctx }
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let (request, body) = RequestContext::from_request(req, client_addr);
        let modules = self.manager.modules_for_request(&request);

        modules.before_handle_request(&request);

        let in_flight = InFlight::new(Arc::clone(&modules), request.snapshot());
        let connect_timeout = self.ctx.settings.connect_timeout.unwrap_or_default();
        let mut result = HandleRequestResult::new(request, Dialer::new(connect_timeout));
        modules.handle_request(&mut result);

        let response = result
            .response
            .take()
            .unwrap_or_else(|| ProxyResponse::error(StatusCode::INTERNAL_SERVER_ERROR, ""));
        let (response, summary) = response.write(&mut result, body, &self.ctx).await;

        if let Some(error) = &summary.error {
            tracing::warn!(
                client = %client_addr,
                method = %result.request.method(),
                uri = %result.request.uri(),
                error = %error,
                "request failed"
            );
        }
        in_flight.finish(&summary);
        Ok(response)
    }
}

/// Runs the `AfterWriteResponse` hooks exactly once; if the request is
/// abandoned before a response exists they see a 499.
struct InFlight {
    modules: Arc<ModuleSet>,
    request: RequestContext,
    finished: bool,
}

impl InFlight {
    fn new(modules: Arc<ModuleSet>, request: RequestContext) -> Self {
        Self {
            modules,
            request,
            finished: false,
        }
    }

    fn finish(mut self, summary: &ResponseSummary) {
        self.finished = true;
        self.modules.after_write_response(&self.request, summary);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::debug!(client = %self.request.client_addr(), "client closed request");
        self.modules
            .after_write_response(&self.request, &ResponseSummary::client_closed());
    }
}
