//! Prifma - a configurable HTTP/HTTPS forward proxy
//!
//! Requests pass through a pipeline of directive modules. Modules can be
//! reconfigured for subsets of requests with `condition` blocks, pick the
//! outgoing address, route through an upstream proxy, authenticate clients
//! or log requests.
//!
//! # Features
//!
//! - **Tunnels and forwarding**: CONNECT tunnels plus forwarding of plain
//!   HTTP requests over pooled upstream connections
//! - **Conditional configuration**: module settings scoped by client
//!   address, destination, header or user
//! - **Outgoing address selection**: per-family address pools and a
//!   client-supplied `Proxy-Use-Ip` header
//! - **Upstream proxies**: CONNECT negotiation with Basic credentials and
//!   custom headers
//!
//! # Example
//!
//! ```no_run
//! use prifma::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::parse("server { listen_port 3128; }\nblock_requests off;\n")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod conf;
pub mod config;
pub mod egress;
pub mod error;
pub mod modules;
pub mod pipeline;
pub mod proxy;
pub mod tls;

pub use config::{Config, ServerSettings};
pub use error::{Error, Result};
pub use pipeline::{Module, ModulesManager};
pub use proxy::ProxyServer;
