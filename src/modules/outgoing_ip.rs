//! `outgoing_ip <ip>... | off;` and the block form `outgoing_ip { <ip>; }`.
//!
//! Addresses are kept in one pool per family. Each request dials from a
//! random member of every non-empty pool; a family with an empty pool is
//! left unset, so destinations of that family cannot be reached.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, PoisonError, RwLock};

use rand::seq::SliceRandom;

use crate::conf::{Block, Command};
use crate::error::{Error, Result};
use crate::pipeline::{HandleRequest, HandleRequestResult, Hooks, Module};

pub const DIRECTIVE: &str = "outgoing_ip";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pools {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl Pools {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    fn clear(&mut self) {
        self.ipv4.clear();
        self.ipv6.clear();
    }

    fn add(&mut self, command: &Command, ip: &str) -> Result<()> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::directive(command, format!("wrong outgoing ip - '{}'", ip)))?;
        match ip.to_canonical() {
            IpAddr::V4(v4) if !self.ipv4.contains(&v4) => self.ipv4.push(v4),
            IpAddr::V6(v6) if !self.ipv6.contains(&v6) => self.ipv6.push(v6),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct OutgoingIp {
    pools: Arc<RwLock<Pools>>,
}

impl OutgoingIp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pools(&self) -> Pools {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Module for OutgoingIp {
    fn directive(&self) -> &'static str {
        DIRECTIVE
    }

    fn clone_module(&self) -> Arc<dyn Module> {
        Arc::new(Self {
            pools: Arc::new(RwLock::new(self.pools())),
        })
    }

    fn call(&self, command: &Command) -> Result<()> {
        let args = command.args();
        if args.is_empty() {
            return Err(Error::args_number(command));
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if command.single_arg() == Some("off") {
            pools.clear();
            return Ok(());
        }

        let mut next = Pools::default();
        for ip in args {
            next.add(command, ip)?;
        }
        *pools = next;
        Ok(())
    }

    fn call_block(&self, command: &Command) -> Result<Box<dyn Block>> {
        if !command.args().is_empty() {
            return Err(Error::args_number(command));
        }
        Ok(Box::new(OutgoingIpBlock {
            pools: Arc::clone(&self.pools),
        }))
    }

    fn hooks(&self) -> Hooks<'_> {
        Hooks {
            handle_request: Some(self),
            ..Hooks::default()
        }
    }
}

impl HandleRequest for OutgoingIp {
    fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        if pools.is_empty() {
            return Ok(());
        }

        let mut rng = rand::thread_rng();
        result.dialer.set_ipv4(pools.ipv4.choose(&mut rng).copied());
        result.dialer.set_ipv6(pools.ipv6.choose(&mut rng).copied());
        Ok(())
    }
}

/// Body of `outgoing_ip { ... }`: every directive name is an address.
struct OutgoingIpBlock {
    pools: Arc<RwLock<Pools>>,
}

impl Block for OutgoingIpBlock {
    fn call(&mut self, command: &Command) -> Result<()> {
        if !command.args().is_empty() {
            return Err(Error::args_number(command));
        }
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(command, command.name())
    }

    fn call_block(&mut self, command: &Command) -> Result<Box<dyn Block>> {
        Err(Error::block_not_allowed(command))
    }
}
