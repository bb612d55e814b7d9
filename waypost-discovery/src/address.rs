//! Bind address resolution
//!
//! Services usually listen on a wildcard address (`:8080`, `0.0.0.0:8080`,
//! `[::]:8080`) which is useless to peers. [`resolve`] turns such an address
//! into one that other hosts can dial by substituting the first non-loopback
//! IPv4 address bound to a local interface.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Address resolution errors
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    Format(String),

    #[error("No non-loopback IPv4 address found on local interfaces")]
    NoLocalAddress,

    #[error("Failed to list network interfaces: {0}")]
    Interfaces(#[from] io::Error),
}

/// A network/address pair, e.g. `("tcp", "10.0.0.7:8080")`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddr {
    network: String,
    address: String,
}

impl NetAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    /// Transport family, e.g. `tcp`
    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Resolve the address part, keeping the network.
    pub fn resolve(&self) -> Result<NetAddr, AddressError> {
        Ok(NetAddr::new(self.network.clone(), resolve(&self.address)?))
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Resolve `address` into a canonical, externally reachable `host:port`.
///
/// # Examples
///
/// ```
/// use waypost_discovery::address::resolve;
///
/// assert_eq!(resolve("localhost:8090").unwrap(), "localhost:8090");
/// assert!(resolve("badaddr").is_err());
/// ```
pub fn resolve(address: &str) -> Result<String, AddressError> {
    resolve_with(address, local_addr)
}

/// Return the first non-loopback IPv4 address bound to a local interface.
pub fn local_addr() -> Result<Ipv4Addr, AddressError> {
    let interfaces = if_addrs::get_if_addrs()?;

    interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
            _ => None,
        })
        .ok_or(AddressError::NoLocalAddress)
}

pub(crate) fn resolve_with<F>(address: &str, local: F) -> Result<String, AddressError>
where
    F: FnOnce() -> Result<Ipv4Addr, AddressError>,
{
    let (host, port) = split_host_port(address)?;

    let port: u16 = port
        .parse()
        .map_err(|_| AddressError::Format(format!("invalid port {:?} in address {}", port, address)))?;

    if is_wildcard(host) {
        let ip = local()?;
        return Ok(format!("{}:{}", ip, port));
    }

    if host.contains(':') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "" | "0.0.0.0" | "::")
}

fn split_host_port(address: &str) -> Result<(&str, &str), AddressError> {
    let missing_port = || AddressError::Format(format!("missing port in address {}", address));

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| AddressError::Format(format!("missing ']' in address {}", address)))?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(missing_port)?;
        (host, port)
    } else {
        let idx = address.rfind(':').ok_or_else(missing_port)?;
        let host = &address[..idx];
        if host.contains(':') {
            return Err(AddressError::Format(format!(
                "too many colons in address {}",
                address
            )));
        }
        (host, &address[idx + 1..])
    };

    if port.is_empty() {
        return Err(missing_port());
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Result<Ipv4Addr, AddressError> {
        Ok(Ipv4Addr::new(10, 1, 2, 3))
    }

    fn none() -> Result<Ipv4Addr, AddressError> {
        Err(AddressError::NoLocalAddress)
    }

    #[test]
    fn test_wildcard_hosts_use_local_ipv4() {
        assert_eq!(resolve_with("0.0.0.0:8090", fixed).unwrap(), "10.1.2.3:8090");
        assert_eq!(resolve_with(":8090", fixed).unwrap(), "10.1.2.3:8090");
        assert_eq!(resolve_with("[::]:8090", fixed).unwrap(), "10.1.2.3:8090");
    }

    #[test]
    fn test_named_host_passes_through() {
        assert_eq!(resolve_with("localhost:8090", none).unwrap(), "localhost:8090");
        assert_eq!(resolve_with("127.0.0.1:80", none).unwrap(), "127.0.0.1:80");
        assert_eq!(resolve_with("[fe80::1]:443", none).unwrap(), "[fe80::1]:443");
    }

    #[test]
    fn test_port_is_canonicalised() {
        assert_eq!(resolve_with("localhost:0080", none).unwrap(), "localhost:80");
    }

    #[test]
    fn test_bad_addresses() {
        assert!(matches!(resolve_with("badaddr", fixed), Err(AddressError::Format(_))));
        assert!(matches!(resolve_with("8090", fixed), Err(AddressError::Format(_))));
        assert!(matches!(resolve_with("host:", fixed), Err(AddressError::Format(_))));
        assert!(matches!(resolve_with("host:http", fixed), Err(AddressError::Format(_))));
        assert!(matches!(resolve_with("host:70000", fixed), Err(AddressError::Format(_))));
        assert!(matches!(resolve_with("a:b:c", fixed), Err(AddressError::Format(_))));
        assert!(matches!(resolve_with("[::1", fixed), Err(AddressError::Format(_))));
    }

    #[test]
    fn test_no_local_address() {
        assert!(matches!(
            resolve_with("0.0.0.0:8090", none),
            Err(AddressError::NoLocalAddress)
        ));
    }

    #[test]
    fn test_resolve_against_host_interfaces() {
        // Depends on the machine: either a routable IPv4 or a clean error.
        match resolve("0.0.0.0:8090") {
            Ok(addr) => {
                assert!(addr.ends_with(":8090"));
                assert!(!addr.starts_with("0.0.0.0"));
                assert!(!addr.starts_with("127."));
            }
            Err(e) => assert!(matches!(
                e,
                AddressError::NoLocalAddress | AddressError::Interfaces(_)
            )),
        }
    }

    #[test]
    fn test_net_addr() {
        let addr = NetAddr::new("tcp", ":8090");
        assert_eq!(addr.network(), "tcp");
        assert_eq!(addr.to_string(), ":8090");

        let named = NetAddr::new("tcp", "localhost:8090").resolve().unwrap();
        assert_eq!(named.network(), "tcp");
        assert_eq!(named.address(), "localhost:8090");
    }
}
