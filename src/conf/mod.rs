//! Configuration language: tokenizer, parser and the block interface
//! configuration consumers implement.
//!
//! ```text
//! server {
//!     listen_port 3128;
//! }
//! access_log /var/log/prifma/access.log;
//! condition src_ip cidr 10.0.0.0/8 {
//!     block_requests on;
//! }
//! include conf.d/*.conf;
//! ```

mod command;
mod parser;
mod token;
mod unescape;

pub use command::{Block, Command};
pub use parser::{Decoder, INCLUDE_DIRECTIVE};
pub use token::{Token, Tokenizer};
pub use unescape::unescape;
