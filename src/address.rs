//! Remote endpoint addresses.

use crate::error::Error;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;

/// Port used when an address string does not name one.
pub const DEFAULT_PORT: u16 = 24800;

/// A host and port identifying a remote endpoint.
///
/// The value is immutable. Name resolution happens on first use and the
/// result is kept for the lifetime of the value, so a socket that reconnects
/// with the same `NetworkAddress` does not hit the resolver again.
#[derive(Debug, Clone)]
pub struct NetworkAddress {
    host: String,
    port: u16,
    resolved: OnceLock<SocketAddr>,
}

impl NetworkAddress {
    /// Creates an address from a host name or IP literal and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        let host = host.into();
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(Error::InvalidAddress(host));
        }
        Ok(Self {
            host: trimmed.to_string(),
            port,
            resolved: OnceLock::new(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the address, returning the first endpoint found.
    ///
    /// # Errors
    ///
    /// [`Error::Resolve`] if the resolver fails or yields no endpoints.
    pub fn resolve(&self) -> Result<SocketAddr, Error> {
        if let Some(addr) = self.resolved.get() {
            return Ok(*addr);
        }

        let addr = match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port),
            Err(_) => (self.host.as_str(), self.port)
                .to_socket_addrs()
                .map_err(|err| Error::Resolve {
                    host: self.host.clone(),
                    reason: err.to_string(),
                })?
                .next()
                .ok_or_else(|| Error::Resolve {
                    host: self.host.clone(),
                    reason: "no addresses found".to_string(),
                })?,
        };
        debug!(host = %self.host, %addr, "Resolved address");

        Ok(*self.resolved.get_or_init(|| addr))
    }
}

impl FromStr for NetworkAddress {
    type Err = Error;

    /// Parses `host`, `host:port`, `[v6]:port` or a bare IPv6 literal.
    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Self::new(ip.to_string(), DEFAULT_PORT);
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Self::new(addr.ip().to_string(), addr.port());
        }
        if s.starts_with('[') {
            // Bracketed IPv6 without a port, other bracket forms were handled above
            return match s.strip_suffix(']') {
                Some(host) => Self::new(host, DEFAULT_PORT),
                None => Err(Error::InvalidAddress(s.to_string())),
            };
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidAddress(s.to_string()))?;
                Self::new(host, port)
            }
            None => Self::new(s, DEFAULT_PORT),
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(addr);
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            resolved,
        }
    }
}

impl PartialEq for NetworkAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NetworkAddress {}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
