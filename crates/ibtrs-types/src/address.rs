use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// How a peer is addressed on the fabric.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum AddressType {
    /// IPv4 or IPv6, resolved through the RDMA connection manager.
    Ip = 0,
    /// InfiniBand GID.
    Gid = 1,
}

impl AddressType {
    fn prefix(self) -> &'static str {
        match self {
            AddressType::Ip => "ip:",
            AddressType::Gid => "gid:",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Ip => write!(f, "IP"),
            AddressType::Gid => write!(f, "GID"),
        }
    }
}

/// Peer address: an IP or GID plus the port (service id) to connect to.
///
/// Textual form is `ip:<addr>:<port>` or `gid:<gid>:<port>`. IPv6 addresses
/// under the `ip:` prefix are bracketed, e.g. `ip:[fe80::1]:1234`. A GID is
/// written in IPv6 notation without brackets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub addr_type: AddressType,
    /// IP address, or the GID stored as a 128-bit IPv6 value.
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    /// Create an IP address.
    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            addr_type: AddressType::Ip,
            ip,
            port,
        }
    }

    /// Create a GID address from its raw 16 bytes.
    pub fn gid(raw: [u8; 16], port: u16) -> Self {
        Self {
            addr_type: AddressType::Gid,
            ip: IpAddr::V6(Ipv6Addr::from(raw)),
            port,
        }
    }

    /// Convenience constructor for IPv4 literals.
    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self::ip(IpAddr::from([a, b, c, d]), port)
    }

    /// The 16 raw bytes of a GID, or the IPv6-mapped form of an IP.
    pub fn raw(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr_type {
            AddressType::Ip => write!(f, "ip:{}", SocketAddr::new(self.ip, self.port)),
            AddressType::Gid => write!(f, "gid:{}:{}", self.ip, self.port),
        }
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parse `"ip:10.0.0.1:1234"`, `"ip:[::1]:1234"` or `"gid:fe80::2:1234"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(AddressType::Ip.prefix()) {
            let sa: SocketAddr = rest.parse().map_err(|_| {
                if rest.rsplit_once(':').is_none() {
                    AddressParseError::MissingPort
                } else {
                    AddressParseError::InvalidIp
                }
            })?;
            return Ok(Address::ip(sa.ip(), sa.port()));
        }
        if let Some(rest) = s.strip_prefix(AddressType::Gid.prefix()) {
            let (gid_str, port_str) = rest.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| AddressParseError::InvalidPort)?;
            let gid: Ipv6Addr = gid_str.parse().map_err(|_| AddressParseError::InvalidGid)?;
            return Ok(Address::gid(gid.octets(), port));
        }
        match s.split_once(':') {
            Some((scheme, _)) => Err(AddressParseError::UnknownType(scheme.to_string())),
            None => Err(AddressParseError::MissingScheme),
        }
    }
}

/// Errors when parsing an `Address` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing 'ip:' or 'gid:' prefix")]
    MissingScheme,
    #[error("unknown address type: {0}")]
    UnknownType(String),
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
    #[error("invalid IP address")]
    InvalidIp,
    #[error("invalid GID")]
    InvalidGid,
}
