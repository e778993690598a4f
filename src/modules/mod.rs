//! Built-in directive modules.
//!
//! Each module owns one directive and takes part in the request pipeline
//! through the hooks it exposes. Registration order is pipeline order.

pub mod access_log;
pub mod basic_auth;
pub mod block_requests;
pub mod dump_log;
pub mod http;
pub mod log_file;
pub mod outgoing_ip;
pub mod proxy_requests;
pub mod tunnel;
pub mod use_ip_header;

use std::sync::Arc;

use crate::pipeline::Module;

pub use access_log::AccessLog;
pub use basic_auth::BasicAuth;
pub use block_requests::BlockRequests;
pub use dump_log::DumpLog;
pub use http::Http;
pub use outgoing_ip::OutgoingIp;
pub use proxy_requests::ProxyRequests;
pub use tunnel::Tunnel;
pub use use_ip_header::UseIpHeader;

/// A fresh set of every built-in module, in pipeline order.
pub fn default_modules() -> Vec<Arc<dyn Module>> {
    vec![
        Arc::new(DumpLog::new()),
        Arc::new(BlockRequests::new()),
        Arc::new(BasicAuth::new()),
        Arc::new(OutgoingIp::new()),
        Arc::new(UseIpHeader::new()),
        Arc::new(ProxyRequests::new()),
        Arc::new(AccessLog::new()),
        Arc::new(Tunnel::new()),
        Arc::new(Http::new()),
    ]
}
