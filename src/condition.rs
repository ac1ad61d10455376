// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Conditions: `(lvalue, operator, rvalue)` tests evaluated against a
//! virtual request. Physical-file lvalues go through the stat cache and may
//! suspend the request; everything else evaluates synchronously. Results
//! are cached in the request for the duration of one execution pass.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use regex::Regex;

use crate::error::{Error, Result};
use crate::stat_cache::StatLookup;
use crate::vrequest::VRequest;
use crate::worker::Worker;

/// Comparison operators available in conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOperator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `=^` string prefix
    Prefix,
    /// `!^`
    NoPrefix,
    /// `=$` string suffix
    Suffix,
    /// `!$`
    NoSuffix,
    /// `=~` regular expression match
    Match,
    /// `!~`
    NoMatch,
    /// CIDR membership for address lvalues
    Ip,
    /// Negated CIDR membership
    NotIp,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

/// Symbolic reference to a request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondLValue {
    /// Local socket address.
    RequestLocalIp,
    /// Peer socket address.
    RequestRemoteIp,
    /// Decoded request path.
    RequestPath,
    /// Hostname.
    RequestHost,
    /// `http` or `https`.
    RequestScheme,
    /// Query string.
    RequestQueryString,
    /// Method token.
    RequestMethod,
    /// Parsed content length.
    RequestContentLength,
    /// Resolved filesystem path.
    PhysicalPath,
    /// Whether the physical path exists.
    PhysicalExists,
    /// Size of the physical path.
    PhysicalSize,
    /// Whether the physical path is a directory.
    PhysicalIsDir,
    /// Whether the physical path is a regular file.
    PhysicalIsFile,
    /// Current response status.
    ResponseStatus,
    /// A request header; the key is stored lowercase.
    RequestHeader(String),
    /// A response header; the key is stored lowercase.
    ResponseHeader(String),
}

impl CondLValue {
    /// A request-header lvalue with the key lowercased.
    pub fn request_header(key: &str) -> Self {
        CondLValue::RequestHeader(key.to_ascii_lowercase())
    }

    /// A response-header lvalue with the key lowercased.
    pub fn response_header(key: &str) -> Self {
        CondLValue::ResponseHeader(key.to_ascii_lowercase())
    }
}

/// Right-hand side of a condition.
pub enum CondRValue {
    /// Boolean constant.
    Bool(bool),
    /// Integer constant.
    Number(i64),
    /// String constant.
    String(String),
    /// Compiled regular expression.
    Regexp(Regex),
    /// IPv4 network.
    Ipv4 {
        /// Network address.
        addr: Ipv4Addr,
        /// Prefix length, 0..=32.
        prefix: u32,
    },
    /// IPv6 network.
    Ipv6 {
        /// Network address.
        addr: Ipv6Addr,
        /// Prefix length, 0..=128.
        prefix: u32,
    },
}

impl fmt::Debug for CondRValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CondRValue::Bool(b) => write!(f, "Bool({})", b),
            CondRValue::Number(n) => write!(f, "Number({})", n),
            CondRValue::String(ref s) => write!(f, "String({:?})", s),
            CondRValue::Regexp(ref r) => write!(f, "Regexp({:?})", r.as_str()),
            CondRValue::Ipv4 { addr, prefix } => write!(f, "Ipv4({}/{})", addr, prefix),
            CondRValue::Ipv6 { ref addr, prefix } => write!(f, "Ipv6({}/{})", addr, prefix),
        }
    }
}

impl CondRValue {
    /// Parses `10.0.0.0/8` or `2001:db8::/32` style network notation; a
    /// missing prefix means an exact host match.
    pub fn parse_net(s: &str) -> Option<CondRValue> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p.parse::<u32>().ok()?)),
            None => (s, None),
        };
        match addr.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                (prefix <= 32).then_some(CondRValue::Ipv4 { addr: v4, prefix })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                (prefix <= 128).then_some(CondRValue::Ipv6 { addr: v6, prefix })
            }
        }
    }
}

static NEXT_COND_ID: AtomicUsize = AtomicUsize::new(0);

/// A compiled condition.
#[derive(Debug)]
pub struct Condition {
    /// Operator.
    pub op: CompOperator,
    /// Left-hand side.
    pub lvalue: CondLValue,
    /// Right-hand side.
    pub rvalue: CondRValue,
    id: usize,
}

impl Condition {
    /// Creates a condition; the id keys the per-request result cache.
    pub fn new(op: CompOperator, lvalue: CondLValue, rvalue: CondRValue) -> Arc<Condition> {
        Arc::new(Condition {
            op,
            lvalue,
            rvalue,
            id: NEXT_COND_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// A string comparison; `Match`/`NoMatch` compile the pattern.
    pub fn new_string(op: CompOperator, lvalue: CondLValue, value: &str) -> Result<Arc<Condition>> {
        let rvalue = match op {
            CompOperator::Match | CompOperator::NoMatch => CondRValue::Regexp(
                Regex::new(value).map_err(|_| Error::Protocol("invalid condition regex"))?,
            ),
            _ => CondRValue::String(value.to_owned()),
        };
        Ok(Condition::new(op, lvalue, rvalue))
    }

    /// An integer comparison.
    pub fn new_int(op: CompOperator, lvalue: CondLValue, value: i64) -> Arc<Condition> {
        Condition::new(op, lvalue, CondRValue::Number(value))
    }

    /// A boolean test.
    pub fn new_bool(lvalue: CondLValue, value: bool) -> Arc<Condition> {
        Condition::new(CompOperator::Eq, lvalue, CondRValue::Bool(value))
    }

    /// The cache id of this condition.
    pub fn id(&self) -> usize {
        self.id
    }
}

/// Outcome of a condition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// The condition evaluated.
    Value(bool),
    /// A stat lookup is pending; re-run after the wakeup.
    WaitForEvent,
}

fn string_compare(op: CompOperator, l: &str, rvalue: &CondRValue) -> Result<bool> {
    match (op, rvalue) {
        (CompOperator::Eq, CondRValue::String(r)) => Ok(l == r),
        (CompOperator::Ne, CondRValue::String(r)) => Ok(l != r),
        (CompOperator::Prefix, CondRValue::String(r)) => Ok(l.starts_with(r.as_str())),
        (CompOperator::NoPrefix, CondRValue::String(r)) => Ok(!l.starts_with(r.as_str())),
        (CompOperator::Suffix, CondRValue::String(r)) => Ok(l.ends_with(r.as_str())),
        (CompOperator::NoSuffix, CondRValue::String(r)) => Ok(!l.ends_with(r.as_str())),
        (CompOperator::Match, CondRValue::Regexp(r)) => Ok(r.is_match(l)),
        (CompOperator::NoMatch, CondRValue::Regexp(r)) => Ok(!r.is_match(l)),
        _ => Err(Error::Protocol("operator not valid for string lvalue")),
    }
}

fn int_compare(op: CompOperator, l: i64, rvalue: &CondRValue) -> Result<bool> {
    let CondRValue::Number(r) = *rvalue else {
        return Err(Error::Protocol("numeric lvalue needs numeric rvalue"));
    };
    Ok(match op {
        CompOperator::Eq => l == r,
        CompOperator::Ne => l != r,
        CompOperator::Gt => l > r,
        CompOperator::Ge => l >= r,
        CompOperator::Lt => l < r,
        CompOperator::Le => l <= r,
        _ => return Err(Error::Protocol("operator not valid for numeric lvalue")),
    })
}

fn ipv4_in_net(ip: Ipv4Addr, net: Ipv4Addr, prefix: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = 32 - prefix;
    (u32::from(ip) >> shift) == (u32::from(net) >> shift)
}

fn ipv6_in_net(ip: Ipv6Addr, net: Ipv6Addr, prefix: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let ip = u128::from_be_bytes(ip.octets());
    let net = u128::from_be_bytes(net.octets());
    let shift = 128 - prefix;
    (ip >> shift) == (net >> shift)
}

fn ip_compare(op: CompOperator, ip: IpAddr, rvalue: &CondRValue) -> Result<bool> {
    let inside = match (ip, rvalue) {
        (IpAddr::V4(ip), CondRValue::Ipv4 { addr, prefix }) => ipv4_in_net(ip, *addr, *prefix),
        (IpAddr::V6(ip), CondRValue::Ipv6 { addr, prefix }) => ipv6_in_net(ip, *addr, *prefix),
        (IpAddr::V4(ip), CondRValue::Ipv6 { addr, prefix }) => {
            ipv6_in_net(ip.to_ipv6_mapped(), *addr, *prefix)
        }
        (IpAddr::V6(_), CondRValue::Ipv4 { .. }) => false,
        _ => return Err(Error::Protocol("address lvalue needs a network rvalue")),
    };
    Ok(match op {
        CompOperator::Ip | CompOperator::Eq => inside,
        CompOperator::NotIp | CompOperator::Ne => !inside,
        _ => return Err(Error::Protocol("operator not valid for address lvalue")),
    })
}

/// Evaluates `cond` against `vr`, using the per-request cache.
pub fn check(cond: &Condition, vr: &mut VRequest, wrk: &mut Worker) -> Result<CheckResult> {
    if let Some(&cached) = vr.cond_cache.get(&cond.id) {
        return Ok(CheckResult::Value(cached));
    }

    let value = match cond.lvalue {
        CondLValue::RequestPath => string_compare(cond.op, &vr.request.uri.path, &cond.rvalue)?,
        CondLValue::RequestHost => string_compare(cond.op, &vr.request.uri.host, &cond.rvalue)?,
        CondLValue::RequestScheme => {
            string_compare(cond.op, &vr.request.uri.scheme, &cond.rvalue)?
        }
        CondLValue::RequestQueryString => {
            string_compare(cond.op, &vr.request.uri.query, &cond.rvalue)?
        }
        CondLValue::RequestMethod => string_compare(cond.op, &vr.request.method_str, &cond.rvalue)?,
        CondLValue::RequestContentLength => {
            int_compare(cond.op, vr.request.content_length, &cond.rvalue)?
        }
        CondLValue::ResponseStatus => int_compare(cond.op, vr.response.status as i64, &cond.rvalue)?,
        CondLValue::PhysicalPath => string_compare(cond.op, &vr.physical.path, &cond.rvalue)?,
        CondLValue::RequestHeader(ref key) => {
            let joined = vr.request.headers.get_joined(key);
            string_compare(cond.op, &joined, &cond.rvalue)?
        }
        CondLValue::ResponseHeader(ref key) => {
            let joined = vr.response.headers.get_joined(key);
            string_compare(cond.op, &joined, &cond.rvalue)?
        }
        CondLValue::RequestRemoteIp => ip_compare(cond.op, vr.remote_addr.ip(), &cond.rvalue)?,
        CondLValue::RequestLocalIp => ip_compare(cond.op, vr.local_addr.ip(), &cond.rvalue)?,
        CondLValue::PhysicalExists
        | CondLValue::PhysicalSize
        | CondLValue::PhysicalIsDir
        | CondLValue::PhysicalIsFile => {
            let path = vr.physical.path.clone();
            match wrk.stat_cache.get(&path, vr.con_job()) {
                StatLookup::Pending => {
                    vr.stat_wait = Some(path);
                    return Ok(CheckResult::WaitForEvent);
                }
                StatLookup::Failed(_) => {
                    vr.stat_wait = None;
                    match cond.lvalue {
                        CondLValue::PhysicalExists
                        | CondLValue::PhysicalIsDir
                        | CondLValue::PhysicalIsFile => bool_compare(cond, false)?,
                        _ => int_compare(cond.op, -1, &cond.rvalue)?,
                    }
                }
                StatLookup::Found(info) => {
                    vr.stat_wait = None;
                    match cond.lvalue {
                        CondLValue::PhysicalExists => bool_compare(cond, true)?,
                        CondLValue::PhysicalIsDir => bool_compare(cond, info.is_dir)?,
                        CondLValue::PhysicalIsFile => bool_compare(cond, info.is_file)?,
                        _ => int_compare(cond.op, info.size as i64, &cond.rvalue)?,
                    }
                }
            }
        }
    };

    vr.cond_cache.insert(cond.id, value);
    Ok(CheckResult::Value(value))
}

fn bool_compare(cond: &Condition, l: bool) -> Result<bool> {
    let CondRValue::Bool(r) = cond.rvalue else {
        return Err(Error::Protocol("boolean lvalue needs boolean rvalue"));
    };
    Ok(match cond.op {
        CompOperator::Eq => l == r,
        CompOperator::Ne => l != r,
        _ => return Err(Error::Protocol("operator not valid for boolean lvalue")),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn condition_net_parsing() {
        assert!(matches!(
            CondRValue::parse_net("10.0.0.0/8"),
            Some(CondRValue::Ipv4 { prefix: 8, .. })
        ));
        assert!(matches!(
            CondRValue::parse_net("2001:db8::/32"),
            Some(CondRValue::Ipv6 { prefix: 32, .. })
        ));
        assert!(CondRValue::parse_net("10.0.0.0/33").is_none());
        assert!(CondRValue::parse_net("not-an-ip").is_none());
    }

    #[test]
    fn condition_cidr_membership() {
        let net = Ipv4Addr::new(10, 0, 0, 0);
        assert!(ipv4_in_net(Ipv4Addr::new(10, 1, 2, 3), net, 8));
        assert!(!ipv4_in_net(Ipv4Addr::new(11, 1, 2, 3), net, 8));
        assert!(ipv4_in_net(Ipv4Addr::new(192, 0, 2, 1), net, 0));
    }

    #[test]
    fn condition_string_operators() {
        let r = CondRValue::String("/static".to_owned());
        assert!(string_compare(CompOperator::Prefix, "/static/a.js", &r).unwrap());
        assert!(!string_compare(CompOperator::Prefix, "/other", &r).unwrap());
        assert!(string_compare(CompOperator::NoPrefix, "/other", &r).unwrap());
        let suffix = CondRValue::String(".js".to_owned());
        assert!(string_compare(CompOperator::Suffix, "/a.js", &suffix).unwrap());
    }

    #[test]
    fn condition_regex_operator() {
        let r = CondRValue::Regexp(Regex::new(r"^/v\d+/").unwrap());
        assert!(string_compare(CompOperator::Match, "/v2/users", &r).unwrap());
        assert!(string_compare(CompOperator::NoMatch, "/users", &r).unwrap());
    }

    #[test]
    fn condition_numeric_operators() {
        let r = CondRValue::Number(100);
        assert!(int_compare(CompOperator::Ge, 100, &r).unwrap());
        assert!(int_compare(CompOperator::Lt, 99, &r).unwrap());
        assert!(int_compare(CompOperator::Ne, 99, &r).unwrap());
        assert!(int_compare(CompOperator::Prefix, 1, &r).is_err());
    }

    #[test]
    fn condition_ids_are_unique() {
        let a = Condition::new_int(CompOperator::Eq, CondLValue::ResponseStatus, 200);
        let b = Condition::new_int(CompOperator::Eq, CondLValue::ResponseStatus, 200);
        assert_ne!(a.id(), b.id());
    }
}
