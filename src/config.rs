//! Configuration parsing and management

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::conf::{Block, Command, Decoder};
use crate::egress::DEFAULT_CONNECT_TIMEOUT;
use crate::error::{Error, Result};
use crate::modules;
use crate::pipeline::{ModulesBlock, ModulesManager};

pub const DEFAULT_CONFIG_PATH: &str = "./prifma.conf";
pub const SERVER_DIRECTIVE: &str = "server";

const DEFAULT_LISTEN_PORT: u16 = 3128;

/// Listener protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenSchema {
    #[default]
    Http,
    Https,
}

/// Settings of the `server { }` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub listen_schema: ListenSchema,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub read_timeout: Option<Duration>,
    pub read_header_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            listen_schema: ListenSchema::Http,
            cert_file: None,
            key_file: None,
            error_log: None,
            read_timeout: None,
            read_header_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl ServerSettings {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Read timeout for tunnel copy loops: the request read timeout (or the
    /// header timeout) plus the idle timeout.
    pub fn tunnel_read_timeout(&self) -> Option<Duration> {
        let read = self.read_timeout.or(self.read_header_timeout).unwrap_or_default();
        let total = read + self.idle_timeout.unwrap_or_default();
        (!total.is_zero()).then_some(total)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_schema == ListenSchema::Https
            && (self.cert_file.is_none() || self.key_file.is_none())
        {
            return Err(Error::config(
                "listen_schema https requires cert_file and key_file",
            ));
        }
        Ok(())
    }
}

/// Parse a duration like `300ms`, `10s`, `1m30s` or `1.5h`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || Error::config(format!("invalid duration '{}'", text));
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(invalid());
    }

    let mut rest = text;
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        nanos += value * unit;
        rest = &rest[unit_len..];
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Scope of `server { ... }`.
struct ServerBlock {
    settings: Arc<Mutex<ServerSettings>>,
}

impl ServerBlock {
    fn timeout(command: &Command, arg: &str) -> Result<Option<Duration>> {
        let duration =
            parse_duration(arg).map_err(|e| Error::directive(command, e.to_string()))?;
        Ok((!duration.is_zero()).then_some(duration))
    }
}

impl Block for ServerBlock {
    fn call(&mut self, command: &Command) -> Result<()> {
        let arg = command
            .single_arg()
            .ok_or_else(|| Error::args_number(command))?;
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);

        match command.name() {
            "listen_ip" => {
                settings.listen_ip = arg.parse().map_err(|_| {
                    Error::directive(command, format!("wrong ip address: '{}'", arg))
                })?;
            }
            "listen_port" => {
                settings.listen_port = arg.parse().map_err(|_| {
                    Error::directive(command, format!("wrong port: '{}'", arg))
                })?;
            }
            "listen_schema" => {
                settings.listen_schema = match arg {
                    "http" => ListenSchema::Http,
                    "https" => ListenSchema::Https,
                    _ => return Err(Error::directive(command, "expected 'http' or 'https'")),
                };
            }
            "cert_file" => settings.cert_file = Some(PathBuf::from(arg)),
            "key_file" => settings.key_file = Some(PathBuf::from(arg)),
            "error_log" => settings.error_log = Some(PathBuf::from(arg)),
            "read_timeout" => settings.read_timeout = Self::timeout(command, arg)?,
            "read_header_timeout" => settings.read_header_timeout = Self::timeout(command, arg)?,
            "write_timeout" => settings.write_timeout = Self::timeout(command, arg)?,
            "idle_timeout" => settings.idle_timeout = Self::timeout(command, arg)?,
            "connect_timeout" => settings.connect_timeout = Self::timeout(command, arg)?,
            _ => return Err(Error::unknown_directive(command)),
        }
        Ok(())
    }

    fn call_block(&mut self, command: &Command) -> Result<Box<dyn Block>> {
        Err(Error::block_not_allowed(command))
    }
}

/// Top-level scope: `server { }` plus every module directive.
pub struct ConfigBlock {
    settings: Arc<Mutex<ServerSettings>>,
    modules: ModulesBlock,
}

impl ConfigBlock {
    pub fn new(manager: Arc<ModulesManager>) -> Self {
        Self {
            settings: Arc::new(Mutex::new(ServerSettings::default())),
            modules: ModulesBlock::new(manager),
        }
    }

    pub fn settings(&self) -> ServerSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Block for ConfigBlock {
    fn call(&mut self, command: &Command) -> Result<()> {
        if command.name() == SERVER_DIRECTIVE {
            return Err(Error::directive(command, "directive requires a block"));
        }
        self.modules.call(command)
    }

    fn call_block(&mut self, command: &Command) -> Result<Box<dyn Block>> {
        if command.name() != SERVER_DIRECTIVE {
            return self.modules.call_block(command);
        }
        if !command.args().is_empty() {
            return Err(Error::args_number(command));
        }
        Ok(Box::new(ServerBlock {
            settings: Arc::clone(&self.settings),
        }))
    }
}

/// A loaded configuration: listener settings plus the module tree.
pub struct Config {
    pub server: ServerSettings,
    pub manager: Arc<ModulesManager>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::load(|decoder, root| decoder.decode_file(root, path))
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self> {
        Self::load(|decoder, root| decoder.decode_str(root, content))
    }

    fn load(decode: impl FnOnce(&Decoder, &mut dyn Block) -> Result<()>) -> Result<Self> {
        let manager = Arc::new(ModulesManager::new(modules::default_modules())?);
        let mut root = ConfigBlock::new(Arc::clone(&manager));
        decode(&Decoder::new(), &mut root)?;

        let server = root.settings();
        server.validate()?;
        Ok(Self { server, manager })
    }
}
