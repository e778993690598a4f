//! `basic_auth <htpasswd> | off;`: require `Proxy-Authorization: Basic`
//! credentials listed in an htpasswd file.
//!
//! Supported secrets are `{SHA}` (base64 of the SHA-1 digest) and plain
//! text. Crypt-style hashes (`$apr1$`, `$2y$`, ...) are rejected when the
//! file is loaded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use ring::digest;

use crate::conf::Command;
use crate::error::{Error, Result};
use crate::pipeline::{HandleRequest, HandleRequestResult, Hooks, Module};
use crate::proxy::ProxyResponse;

pub const DIRECTIVE: &str = "basic_auth";
pub const REALM: &str = "prifma";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Secret {
    Plain(String),
    Sha1(Vec<u8>),
}

impl Secret {
    fn parse(secret: &str) -> std::result::Result<Self, String> {
        if let Some(encoded) = secret.strip_prefix("{SHA}") {
            let digest = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| "malformed {SHA} secret".to_string())?;
            return Ok(Secret::Sha1(digest));
        }
        if secret.starts_with('$') || secret.starts_with('{') {
            return Err("unsupported password hash".to_string());
        }
        Ok(Secret::Plain(secret.to_string()))
    }

    fn matches(&self, password: &str) -> bool {
        match self {
            Secret::Plain(expected) => expected == password,
            Secret::Sha1(expected) => {
                let actual = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
                actual.as_ref() == expected.as_slice()
            }
        }
    }
}

/// Users and secrets from an htpasswd file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Htpasswd {
    users: HashMap<String, Secret>,
}

impl Htpasswd {
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut users = HashMap::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, secret) = line
                .split_once(':')
                .ok_or_else(|| format!("line {}: expected 'user:secret'", i + 1))?;
            let secret = Secret::parse(secret.trim()).map_err(|e| format!("line {}: {}", i + 1, e))?;
            users.insert(user.trim().to_string(), secret);
        }
        Ok(Self { users })
    }

    pub fn load(path: &Path) -> std::result::Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| format!("can't open htpasswd file: '{}'", path.display()))?;
        Self::parse(&content).map_err(|e| {
            format!("wrong format of htpasswd file: '{}': {}", path.display(), e)
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|secret| secret.matches(password))
    }
}

#[derive(Debug, Default)]
pub struct BasicAuth {
    users: RwLock<Option<Arc<Htpasswd>>>,
}

impl BasicAuth {
    pub fn new() -> Self {
        Self::default()
    }

    fn users(&self) -> Option<Arc<Htpasswd>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Module for BasicAuth {
    fn directive(&self) -> &'static str {
        DIRECTIVE
    }

    fn clone_module(&self) -> Arc<dyn Module> {
        Arc::new(Self {
            users: RwLock::new(self.users()),
        })
    }

    fn call(&self, command: &Command) -> Result<()> {
        let arg = command
            .single_arg()
            .ok_or_else(|| Error::args_number(command))?;
        let users = match arg {
            "off" => None,
            path => {
                let htpasswd =
                    Htpasswd::load(Path::new(path)).map_err(|e| Error::directive(command, e))?;
                tracing::debug!(path, users = htpasswd.len(), "loaded htpasswd file");
                Some(Arc::new(htpasswd))
            }
        };
        *self.users.write().unwrap_or_else(PoisonError::into_inner) = users;
        Ok(())
    }

    fn hooks(&self) -> Hooks<'_> {
        Hooks {
            handle_request: Some(self),
            ..Hooks::default()
        }
    }
}

impl HandleRequest for BasicAuth {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
        let Some(users) = self.users() else {
            return Ok(());
        };
        let authorized = result
            .request
            .proxy_basic_auth()
            .is_some_and(|(user, pass)| users.verify(&user, &pass));
        if !authorized {
            result.response = Some(ProxyResponse::require_auth(REALM));
        }
        Ok(())
    }
}
