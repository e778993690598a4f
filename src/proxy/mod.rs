//! HTTP proxy server implementation

mod handler;
pub mod response;
pub mod reverse_proxy;
mod server;
pub mod tunnel;

pub use handler::ProxyHandler;
pub use response::{ErrorResponse, ProxyBody, ProxyResponse, ResponseContext, ResponseSummary};
pub use server::ProxyServer;
