//! Endpoint Resolver
//!
//! Turns `host:port` strings into family-correct endpoints. The remote side of
//! a new subflow has to match the local side's address family, so callers pass
//! the required family explicitly instead of letting the facility reject a
//! mixed pair.

use super::error::{Operation, Result, SubflowError};
use socket2::SockAddr;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::sync::Arc;

const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;

/// Address family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// The wildcard address of this family
    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Size of the `sockaddr` structure the facility expects for this family
    pub fn sockaddr_len(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => SOCKADDR_IN_LEN,
            AddressFamily::Ipv6 => SOCKADDR_IN6_LEN,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// A resolved address and port. Only produced by the resolver or decoded from
/// facility answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Endpoint(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.0.ip())
    }

    pub(crate) fn with_port(mut self, port: u16) -> Self {
        self.0.set_port(port);
        self
    }

    /// Family-tagged binary form (`sockaddr_in` / `sockaddr_in6`)
    pub fn to_sockaddr_bytes(&self) -> Vec<u8> {
        let addr = SockAddr::from(self.0);
        // SAFETY: `as_ptr` points at `len` initialised bytes owned by `addr`,
        // which outlives the copy.
        let raw =
            unsafe { std::slice::from_raw_parts(addr.as_ptr() as *const u8, addr.len() as usize) };
        raw.to_vec()
    }

    /// Decode one socket address from the front of `buf`, returning it with
    /// the number of bytes consumed.
    pub(crate) fn from_sockaddr_bytes(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 2 {
            return None;
        }
        let family = u16::from_ne_bytes([buf[0], buf[1]]) as libc::c_int;

        match family {
            libc::AF_INET if buf.len() >= SOCKADDR_IN_LEN => {
                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                Some((Endpoint(SocketAddr::V4(SocketAddrV4::new(ip, port))), SOCKADDR_IN_LEN))
            }
            libc::AF_INET6 if buf.len() >= SOCKADDR_IN6_LEN => {
                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let flowinfo = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[8..24]);
                let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);
                let addr = SocketAddrV6::new(Ipv6Addr::from(octets), port, flowinfo, scope_id);
                Some((Endpoint(SocketAddr::V6(addr)), SOCKADDR_IN6_LEN))
            }
            _ => None,
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Split `host:port`, `[v6host]:port` or `:port` into host and port text
pub fn split_host_port(input: &str) -> std::result::Result<(&str, &str), String> {
    if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| format!("missing ']' in address {:?}", input))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| format!("missing port in address {:?}", input))?;
        return Ok((host, port));
    }

    let colon = input
        .rfind(':')
        .ok_or_else(|| format!("missing port in address {:?}", input))?;
    let host = &input[..colon];
    if host.contains(':') {
        return Err(format!("too many colons in address {:?}", input));
    }
    Ok((host, &input[colon + 1..]))
}

/// Parse `host:port` into an owned host and a numeric port
pub fn parse_host_port(input: &str) -> Result<(String, u16)> {
    let (host, port) =
        split_host_port(input).map_err(|reason| SubflowError::invalid(Operation::Resolve, reason))?;
    let port = port.parse::<u16>().map_err(|e| {
        let reason = format!("invalid port {:?} in {:?}: {}", port, input, e);
        SubflowError::invalid(Operation::Resolve, reason)
    })?;
    Ok((host.to_string(), port))
}

/// Name lookup used by the resolver
pub trait HostLookup: Send + Sync {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 0).to_socket_addrs()?.map(|addr| addr.ip()).collect())
    }
}

/// Fixed host table, for deterministic resolution
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.entries.insert(host.to_string(), addrs.to_vec());
        self
    }
}

impl HostLookup for StaticLookup {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.entries
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
    }
}

/// Resolves endpoint strings. No retries: lookup failures surface immediately.
#[derive(Clone)]
pub struct EndpointResolver {
    lookup: Arc<dyn HostLookup>,
}

impl Default for EndpointResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemLookup))
    }
}

impl fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointResolver").finish_non_exhaustive()
    }
}

impl EndpointResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }

    /// Resolve `host:port`. When `required` is set the result has that family.
    pub fn resolve(&self, host_port: &str, required: Option<AddressFamily>) -> Result<Endpoint> {
        let (host, port) = parse_host_port(host_port)?;
        self.resolve_host(&host, port, required)
    }

    /// Resolve an already split host and port. An empty host asks the facility
    /// to pick the source address and yields the wildcard address.
    pub fn resolve_host(
        &self,
        host: &str,
        port: u16,
        required: Option<AddressFamily>,
    ) -> Result<Endpoint> {
        if host.is_empty() {
            let family = required.unwrap_or(AddressFamily::Ipv4);
            return Ok(Endpoint(SocketAddr::new(family.unspecified(), port)));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            let family = AddressFamily::of(&ip);
            if let Some(required) = required {
                if required != family {
                    return Err(SubflowError::invalid(
                        Operation::Resolve,
                        format!("{} is an {} address, {} required", host, family, required),
                    ));
                }
            }
            return Ok(Endpoint(SocketAddr::new(ip, port)));
        }

        let addrs = self.lookup.lookup(host).map_err(|e| SubflowError::Resolution {
            op: Operation::Resolve,
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let ip = addrs
            .into_iter()
            .find(|ip| required.map_or(true, |family| AddressFamily::of(ip) == family))
            .ok_or_else(|| SubflowError::Resolution {
                op: Operation::Resolve,
                host: host.to_string(),
                reason: match required {
                    Some(family) => format!("no {} address", family),
                    None => "no address".to_string(),
                },
            })?;

        tracing::trace!(host, %ip, "resolved endpoint host");
        Ok(Endpoint(SocketAddr::new(ip, port)))
    }
}
