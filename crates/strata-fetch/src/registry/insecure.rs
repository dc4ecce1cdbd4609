//! Registries reachable without verified TLS.

use std::net::IpAddr;

/// Hosts and networks allowed to serve plain HTTP or unverified TLS.
///
/// Entries are either host names (matched exactly, port included) or CIDR
/// ranges (matched against the host's address, port ignored).
#[derive(Debug, Clone, Default)]
pub struct InsecureRegistryList {
    hosts: Vec<String>,
    networks: Vec<Network>,
}

#[derive(Debug, Clone, Copy)]
struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    fn parse(entry: &str) -> Option<Self> {
        let (addr, prefix) = entry.split_once('/')?;
        let addr: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl InsecureRegistryList {
    /// Build the list from configuration entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match Network::parse(entry) {
                Some(network) => list.networks.push(network),
                None => list.hosts.push(entry.to_string()),
            }
        }
        list
    }

    /// True if `host` (optionally with a port) may be reached insecurely.
    #[must_use]
    pub fn allows(&self, host: &str) -> bool {
        if self.hosts.iter().any(|h| h == host) {
            return true;
        }
        strip_port(host)
            .parse::<IpAddr>()
            .is_ok_and(|ip| self.networks.iter().any(|n| n.contains(ip)))
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_match() {
        let list = InsecureRegistryList::new(["registry.local:5000"]);
        assert!(list.allows("registry.local:5000"));
        assert!(!list.allows("registry.local"));
        assert!(!list.allows("registry.local:5001"));
    }

    #[test]
    fn cidr_match_ignores_port() {
        let list = InsecureRegistryList::new(["10.0.0.0/8", "fd00::/8"]);
        assert!(list.allows("10.1.2.3"));
        assert!(list.allows("10.1.2.3:5000"));
        assert!(!list.allows("11.0.0.1"));
        assert!(list.allows("[fd00::1]:5000"));
        assert!(list.allows("fd12::1"));
    }

    #[test]
    fn whole_internet_and_empty_list() {
        assert!(InsecureRegistryList::new(["0.0.0.0/0"]).allows("8.8.8.8"));
        assert!(!InsecureRegistryList::default().allows("8.8.8.8"));
    }
}
