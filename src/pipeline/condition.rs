//! Request predicates used by `condition <key> <comparator> <value> { }`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use hyper::header::HeaderName;
use regex::Regex;

use super::request::RequestContext;
use crate::conf::Command;
use crate::error::{Error, Result};

/// Directive that opens a conditional scope.
pub const CONDITION_DIRECTIVE: &str = "condition";

/// The request attribute a condition looks at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConditionKey {
    SrcIp,
    DstDomain,
    DstUrl,
    User,
    Header(HeaderName),
}

impl ConditionKey {
    pub fn parse(key: &str) -> Result<Self> {
        match key {
            "src_ip" => Ok(ConditionKey::SrcIp),
            "dst_domain" => Ok(ConditionKey::DstDomain),
            "dst_url" => Ok(ConditionKey::DstUrl),
            "user" => Ok(ConditionKey::User),
            other => {
                let name = other
                    .strip_prefix("header_")
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| Error::condition(format!("unknown key '{}'", other)))?;
                HeaderName::from_bytes(name.replace('_', "-").as_bytes())
                    .map(ConditionKey::Header)
                    .map_err(|_| Error::condition(format!("invalid header name in key '{}'", other)))
            }
        }
    }

    /// Extract the attribute value; missing attributes read as empty.
    pub fn value_of(&self, request: &RequestContext) -> String {
        match self {
            ConditionKey::SrcIp => request.client_addr().ip().to_canonical().to_string(),
            ConditionKey::DstDomain => request
                .hostname()
                .map(|host| to_unicode(&host))
                .unwrap_or_default(),
            ConditionKey::DstUrl => {
                let uri = request.uri().to_string();
                match request.uri().host() {
                    Some(host) => {
                        let unicode = to_unicode(host);
                        if unicode == host {
                            uri
                        } else {
                            uri.replacen(host, &unicode, 1)
                        }
                    }
                    None => uri,
                }
            }
            ConditionKey::User => request.proxy_user().unwrap_or_default(),
            ConditionKey::Header(name) => request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

fn to_unicode(host: &str) -> String {
    let (unicode, result) = idna::domain_to_unicode(host);
    match result {
        Ok(()) => unicode,
        Err(_) => host.to_string(),
    }
}

/// An IP network in `addr/prefix` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`; a bare address is a single-host network.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::condition(format!("invalid cidr '{}'", value));
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (value, None),
        };
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

/// Comparison of an extracted attribute against the configured value.
#[derive(Debug, Clone)]
pub enum ConditionTester {
    Equals(String),
    Regex(Regex),
    Cidr(Cidr),
    Not(Box<ConditionTester>),
}

impl ConditionTester {
    pub fn new(comparator: &str, value: &str) -> Result<Self> {
        if let Some(inner) = comparator.strip_prefix('!') {
            if inner.starts_with('!') {
                return Err(Error::condition(format!("unknown comparator '{}'", comparator)));
            }
            return Ok(ConditionTester::Not(Box::new(Self::new(inner, value)?)));
        }
        match comparator {
            "=" => Ok(ConditionTester::Equals(value.to_string())),
            "~" => Regex::new(value)
                .map(ConditionTester::Regex)
                .map_err(|e| Error::condition(format!("invalid regexp '{}': {}", value, e))),
            "cidr" => Cidr::parse(value).map(ConditionTester::Cidr),
            other => Err(Error::condition(format!("unknown comparator '{}'", other))),
        }
    }

    pub fn test(&self, actual: &str) -> bool {
        match self {
            ConditionTester::Equals(expected) => actual == expected,
            ConditionTester::Regex(re) => re.is_match(actual),
            ConditionTester::Cidr(cidr) => actual
                .parse::<IpAddr>()
                .map(|ip| cidr.contains(ip))
                .unwrap_or(false),
            ConditionTester::Not(inner) => !inner.test(actual),
        }
    }
}

/// A `key comparator value` predicate over requests.
///
/// Equality and hashing only look at the three source strings, so two
/// conditions written the same way select the same module set.
#[derive(Clone)]
pub struct Condition {
    key_name: String,
    comparator: String,
    value: String,
    key: ConditionKey,
    tester: Arc<ConditionTester>,
}

impl Condition {
    pub fn new(key: &str, comparator: &str, value: &str) -> Result<Self> {
        Ok(Self {
            key_name: key.to_string(),
            comparator: comparator.to_string(),
            value: value.to_string(),
            key: ConditionKey::parse(key)?,
            tester: Arc::new(ConditionTester::new(comparator, value)?),
        })
    }

    /// Build from `condition <key> <comparator> <value>`.
    pub fn from_command(command: &Command) -> Result<Self> {
        match command.args() {
            [key, comparator, value] => Self::new(key, comparator, value)
                .map_err(|e| Error::directive(command, e.to_string())),
            _ => Err(Error::args_number(command)),
        }
    }

    pub fn key(&self) -> &ConditionKey {
        &self.key
    }

    pub fn test(&self, request: &RequestContext) -> bool {
        self.tester.test(&self.key.value_of(request))
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.key_name == other.key_name
            && self.comparator == other.comparator
            && self.value == other.value
    }
}

impl Eq for Condition {}

impl Hash for Condition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_name.hash(state);
        self.comparator.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({} {} {:?})", self.key_name, self.comparator, self.value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key_name, self.comparator, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::request::{test_request, test_request_with};
    use prifma_test_support::test_report;

    #[test]
    fn test_src_ip_cidr() {
        let t = test_report!("src_ip cidr matches the client address without port");
        let cond = Condition::new("src_ip", "cidr", "10.0.0.0/8").unwrap();
        t.assert_true("inside", cond.test(&test_request("GET", "http://a/", "10.1.2.3:4567")));
        t.assert_true("outside", !cond.test(&test_request("GET", "http://a/", "8.8.8.8:4567")));
        t.assert_true(
            "v4-mapped",
            cond.test(&test_request("GET", "http://a/", "[::ffff:10.9.9.9]:1")),
        );
    }

    #[test]
    fn test_negated_comparators() {
        let t = test_report!("A leading ! negates any comparator");
        let not_cidr = Condition::new("src_ip", "!cidr", "10.0.0.0/8").unwrap();
        t.assert_true("outside", not_cidr.test(&test_request("GET", "http://a/", "8.8.8.8:1")));
        let not_eq = Condition::new("dst_domain", "!=", "a.test").unwrap();
        t.assert_true("same", !not_eq.test(&test_request("GET", "http://a.test/", "1.1.1.1:1")));
        t.assert_true("other", not_eq.test(&test_request("GET", "http://b.test/", "1.1.1.1:1")));
    }

    #[test]
    fn test_dst_domain_regex_and_idna() {
        let t = test_report!("dst_domain is unicode and regexps search within it");
        let cond = Condition::new("dst_domain", "~", r"(^|\.)пример\.рф$").unwrap();
        let req = test_request("CONNECT", "xn--e1afmkfd.xn--p1ai:443", "1.1.1.1:1");
        t.assert_eq(
            "value",
            &ConditionKey::DstDomain.value_of(&req),
            &"пример.рф".to_string(),
        );
        t.assert_true("match", cond.test(&req));
    }

    #[test]
    fn test_dst_url() {
        let t = test_report!("dst_url matches the full request URI");
        let cond = Condition::new("dst_url", "~", "^http://a.test/api/").unwrap();
        t.assert_true("api", cond.test(&test_request("GET", "http://a.test/api/v1", "1.1.1.1:1")));
        t.assert_true("root", !cond.test(&test_request("GET", "http://a.test/", "1.1.1.1:1")));
    }

    #[test]
    fn test_header_and_user_keys() {
        let t = test_report!("header_ keys read headers and user reads proxy auth");
        let header = Condition::new("header_X_Team", "=", "blue").unwrap();
        let req = test_request_with(
            "GET",
            "http://a.test/",
            "1.1.1.1:1",
            &[("x-team", "blue"), ("proxy-authorization", "Basic dXNlcjpwYXNz")],
        );
        t.assert_true("header", header.test(&req));
        let user = Condition::new("user", "=", "user").unwrap();
        t.assert_true("user", user.test(&req));
        let anonymous = test_request("GET", "http://a.test/", "1.1.1.1:1");
        t.assert_true("missing header", !header.test(&anonymous));
        t.assert_true("no user", !user.test(&anonymous));
    }

    #[test]
    fn test_equality_uses_source_text() {
        let t = test_report!("Conditions compare by key, comparator and value");
        let a = Condition::new("src_ip", "cidr", "10.0.0.0/8").unwrap();
        let b = Condition::new("src_ip", "cidr", "10.0.0.0/8").unwrap();
        let c = Condition::new("src_ip", "!cidr", "10.0.0.0/8").unwrap();
        t.assert_true("same", a == b);
        t.assert_true("different comparator", a != c);
    }

    #[test]
    fn test_invalid_conditions() {
        let t = test_report!("Bad keys, comparators, regexps and networks are rejected");
        t.assert_err("key", &Condition::new("dst_port", "=", "80"), "unknown key");
        t.assert_err("empty header", &Condition::new("header_", "=", "x"), "unknown key");
        t.assert_err("comparator", &Condition::new("user", ">", "x"), "unknown comparator");
        t.assert_err("double bang", &Condition::new("user", "!!=", "x"), "unknown comparator");
        t.assert_err("regexp", &Condition::new("user", "~", "("), "invalid regexp");
        t.assert_err("cidr", &Condition::new("src_ip", "cidr", "10.0.0.0/33"), "invalid cidr");
    }

    #[test]
    fn test_cidr_edges() {
        let t = test_report!("CIDR handles /0, bare hosts, IPv6 and family mismatch");
        let all = Cidr::parse("0.0.0.0/0").unwrap();
        t.assert_true("any v4", all.contains("203.0.113.9".parse().unwrap()));
        let host = Cidr::parse("192.0.2.1").unwrap();
        t.assert_true("host", host.contains("192.0.2.1".parse().unwrap()));
        t.assert_true("not host", !host.contains("192.0.2.2".parse().unwrap()));
        let v6 = Cidr::parse("2001:db8::/32").unwrap();
        t.assert_true("v6", v6.contains("2001:db8:1::1".parse().unwrap()));
        t.assert_true("family", !v6.contains("10.0.0.1".parse().unwrap()));
    }
}
