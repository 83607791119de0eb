use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use reqwest::Url;

/// Hostname resolution strategy for asset downloads.
///
/// Returning `None` leaves the host to the system resolver. Some networks
/// (emulators in particular) cannot resolve the CDN host reliably, so a
/// deployment can pin that one host to a known address.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// Always defers to system resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, _host: &str) -> Option<IpAddr> {
        None
    }
}

/// Fixed hostname to address table; unknown hosts use system resolution.
#[derive(Debug, Default, Clone)]
pub struct StaticHostResolver {
    table: HashMap<String, IpAddr>,
}

impl StaticHostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &BTreeMap<String, IpAddr>) -> Self {
        let mut resolver = Self::new();
        for (host, address) in table {
            resolver.insert(host, *address);
        }
        resolver
    }

    #[must_use]
    pub fn with(mut self, host: &str, address: IpAddr) -> Self {
        self.insert(host, address);
        self
    }

    pub fn insert(&mut self, host: &str, address: IpAddr) {
        self.table.insert(host.to_ascii_lowercase(), address);
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl HostResolver for StaticHostResolver {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        self.table.get(&host.to_ascii_lowercase()).copied()
    }
}

/// Host and socket address to pin for `url`, if the resolver overrides it.
pub(crate) fn pinned_address(
    resolver: &dyn HostResolver,
    url: &str,
) -> Option<(String, SocketAddr)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    let address = resolver.resolve(host)?;
    Some((host.to_string(), SocketAddr::new(address, port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn static_resolver_pins_only_listed_hosts() {
        let resolver = StaticHostResolver::new().with(
            "cdn.example.space",
            IpAddr::V4(Ipv4Addr::new(104, 21, 3, 7)),
        );

        assert_eq!(
            resolver.resolve("CDN.example.space"),
            Some(IpAddr::V4(Ipv4Addr::new(104, 21, 3, 7)))
        );
        assert_eq!(resolver.resolve("clients3.google.com"), None);
    }

    #[test]
    fn system_resolver_never_overrides() {
        assert_eq!(SystemResolver.resolve("cdn.example.space"), None);
    }

    #[test]
    fn pinned_address_uses_scheme_default_port() {
        let resolver = StaticHostResolver::new().with(
            "cdn.example.space",
            IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)),
        );

        let (host, address) =
            pinned_address(&resolver, "https://cdn.example.space/models/a.gguf").unwrap();
        assert_eq!(host, "cdn.example.space");
        assert_eq!(address, "10.0.2.2:443".parse().unwrap());

        let (_, explicit) =
            pinned_address(&resolver, "http://cdn.example.space:8080/a.gguf").unwrap();
        assert_eq!(explicit.port(), 8080);
    }

    #[test]
    fn unpinned_or_invalid_urls_yield_nothing() {
        let resolver = StaticHostResolver::new();
        assert!(pinned_address(&resolver, "https://cdn.example.space/a").is_none());
        assert!(pinned_address(&resolver, "not a url").is_none());
    }
}
