//! Name server address resolution.
//!
//! The client connection layer only accepts IPv4 literals, so a configured
//! `host:port` is looked up once and turned into a list of `ip:port` strings.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{BoxError, ResolveError};

/// One resolved name server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    ip: Ipv4Addr,
    port: String,
}

impl ServerAddress {
    pub fn new(ip: Ipv4Addr, port: impl Into<String>) -> Self {
        Self {
            ip,
            port: port.into(),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Port token exactly as it appeared in the configured address.
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// DNS facility used by the resolver. Implementations must keep the order
/// in which the underlying facility returned the addresses.
pub trait HostLookup: Send + Sync {
    fn lookup_ip(&self, host: &str) -> impl Future<Output = Result<Vec<IpAddr>, BoxError>> + Send;
}

/// Platform resolver (getaddrinfo through tokio's blocking pool).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, BoxError> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Lookup through trust-dns, configured from the system resolver settings.
#[derive(Clone)]
pub struct TrustDnsLookup {
    resolver: TokioAsyncResolver,
}

impl TrustDnsLookup {
    pub fn from_system_conf() -> Result<Self, BoxError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }
}

impl HostLookup for TrustDnsLookup {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, BoxError> {
        let lookup = self.resolver.lookup_ip(host).await?;
        Ok(lookup.iter().collect())
    }
}

/// Splits `host:port`, rejecting anything that is not exactly one non-empty
/// host and one non-empty port.
pub fn split_name_server(input: &str) -> Result<(&str, &str), ResolveError> {
    let parts: Vec<&str> = input.split(':').collect();
    match parts.as_slice() {
        [host, port] if !host.is_empty() && !port.is_empty() => Ok((*host, *port)),
        _ => Err(ResolveError::Format {
            input: input.to_string(),
        }),
    }
}

fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

pub async fn resolve_server_addresses<L: HostLookup>(
    lookup: &L,
    name_server: &str,
) -> Result<Vec<ServerAddress>, ResolveError> {
    let (host, port) = split_name_server(name_server)?;

    let ips = lookup
        .lookup_ip(host)
        .await
        .map_err(|source| ResolveError::Resolution {
            host: host.to_string(),
            source,
        })?;

    let addresses: Vec<ServerAddress> = ips
        .into_iter()
        .filter_map(as_ipv4)
        .map(|ip| ServerAddress::new(ip, port))
        .collect();

    tracing::trace!(host, port, count = addresses.len(), "name server lookup complete");
    Ok(addresses)
}

pub async fn resolve_name_server_with<L: HostLookup>(
    lookup: &L,
    name_server: &str,
) -> Result<Vec<String>, ResolveError> {
    let addresses = resolve_server_addresses(lookup, name_server).await?;
    Ok(addresses.iter().map(ToString::to_string).collect())
}

/// Resolves `host:port` into `ipv4:port` strings with the platform resolver.
/// An empty list (IPv6-only host) is not an error here.
pub async fn resolve_name_server(name_server: &str) -> Result<Vec<String>, ResolveError> {
    resolve_name_server_with(&SystemLookup, name_server).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::net::Ipv6Addr;

    /// Lookup returning a fixed answer, or failing.
    pub(crate) struct FixedLookup(pub Option<Vec<IpAddr>>);

    impl HostLookup for FixedLookup {
        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, BoxError> {
            match &self.0 {
                Some(ips) => Ok(ips.clone()),
                None => Err(Box::new(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such host {}", host),
                ))),
            }
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn split_accepts_host_and_port() {
        assert_eq!(split_name_server("localhost:9876").unwrap(), ("localhost", "9876"));
    }

    #[test]
    fn split_rejects_bad_shapes() {
        for input in ["localhost", "host:1:2", ":9876", "localhost:", ":", "", "::1"] {
            match split_name_server(input) {
                Err(ResolveError::Format { input: got }) => assert_eq!(got, input),
                other => panic!("{input:?} gave {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn localhost_includes_loopback() {
        let addrs = resolve_name_server("localhost:9876").await.unwrap();
        assert!(addrs.contains(&"127.0.0.1:9876".to_string()), "{addrs:?}");
        for addr in &addrs {
            let (ip, port) = addr.rsplit_once(':').unwrap();
            assert!(ip.parse::<Ipv4Addr>().is_ok());
            assert_eq!(port, "9876");
        }
    }

    #[tokio::test]
    async fn unresolvable_host_names_host() {
        let err = resolve_name_server("nonexistent.invalid.test:9876").await.unwrap_err();
        match &err {
            ResolveError::Resolution { host, .. } => assert_eq!(host, "nonexistent.invalid.test"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("nonexistent.invalid.test"));
    }

    #[tokio::test]
    async fn trust_dns_resolves_localhost() {
        let lookup = TrustDnsLookup::from_system_conf().unwrap();
        let addrs = resolve_name_server_with(&lookup, "localhost:9876").await.unwrap();
        assert!(addrs.contains(&"127.0.0.1:9876".to_string()), "{addrs:?}");
    }

    #[tokio::test]
    async fn trust_dns_unresolvable_host_names_host() {
        let lookup = TrustDnsLookup::from_system_conf().unwrap();
        let err = resolve_name_server_with(&lookup, "nonexistent.invalid.test:9876")
            .await
            .unwrap_err();
        match err {
            ResolveError::Resolution { host, .. } => assert_eq!(host, "nonexistent.invalid.test"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn format_error_skips_lookup() {
        // A failing lookup must not be reached for malformed input.
        let err = resolve_name_server_with(&FixedLookup(None), "host:1:2").await.unwrap_err();
        assert!(matches!(err, ResolveError::Format { .. }));
    }

    #[tokio::test]
    async fn ipv6_only_is_empty() {
        let lookup = FixedLookup(Some(vec![
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6("2001:db8::1".parse().unwrap()),
        ]));
        let addrs = resolve_name_server_with(&lookup, "v6only:9876").await.unwrap();
        assert!(addrs.is_empty());
    }

    #[tokio::test]
    async fn keeps_lookup_order_and_port_token() {
        let lookup = FixedLookup(Some(vec![
            v4(10, 0, 0, 9),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            v4(10, 0, 0, 1),
            v4(10, 0, 0, 5),
        ]));
        let addrs = resolve_name_server_with(&lookup, "ns:port-x").await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.9:port-x", "10.0.0.1:port-x", "10.0.0.5:port-x"]);
    }

    #[tokio::test]
    async fn mapped_ipv6_counts_as_ipv4() {
        let mapped = Ipv4Addr::new(192, 168, 1, 7).to_ipv6_mapped();
        let lookup = FixedLookup(Some(vec![IpAddr::V6(mapped)]));
        let addrs = resolve_server_addresses(&lookup, "ns:9876").await.unwrap();
        assert_eq!(addrs, vec![ServerAddress::new(Ipv4Addr::new(192, 168, 1, 7), "9876")]);
        assert_eq!(addrs[0].to_string(), "192.168.1.7:9876");
    }

    #[tokio::test]
    async fn lookup_failure_keeps_cause() {
        let err = resolve_name_server_with(&FixedLookup(None), "broken:9876").await.unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("no such host broken"));
    }
}
