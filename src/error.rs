//! Error types for prifma

use std::io;

use crate::conf::Command;

/// Main error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error (line {line}): {message}: {data}")]
    Parse {
        line: usize,
        data: String,
        message: String,
    },

    #[error("config file not found: '{0}'")]
    ConfigNotFound(String),

    #[error("wrong directive (line {line}): {command}: {message}")]
    Directive {
        line: usize,
        command: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid condition: {0}")]
    Condition(String),

    #[error("outgoing ip address wasn't defined")]
    OutgoingIpNotDefined,

    #[error("dial {addr}: {message}")]
    Dial { addr: String, message: String },

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    pub fn parse(line: usize, data: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            data: data.into(),
            message: message.into(),
        }
    }

    /// A directive that was parsed fine but rejected by the block it was sent to.
    pub fn directive(command: &Command, message: impl Into<String>) -> Self {
        Error::Directive {
            line: command.line(),
            command: command.to_string(),
            message: message.into(),
        }
    }

    pub fn unknown_directive(command: &Command) -> Self {
        Self::directive(command, "unknown directive")
    }

    pub fn args_number(command: &Command) -> Self {
        Self::directive(command, "wrong number of arguments")
    }

    pub fn block_not_allowed(command: &Command) -> Self {
        Self::directive(command, "directive must not have a block")
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn condition(msg: impl Into<String>) -> Self {
        Error::Condition(msg.into())
    }

    pub fn dial(addr: impl Into<String>, message: impl ToString) -> Self {
        Error::Dial {
            addr: addr.into(),
            message: message.to_string(),
        }
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
