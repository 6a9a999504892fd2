use hickory_resolver::TokioAsyncResolver;
use std::{fmt, net::IpAddr};

/// Resolves a hostname to the set of host networks it currently maps to.
#[async_trait::async_trait]
pub trait Resolve: Send + Sync {
    /// Returns a sorted, deduplicated list of CIDR-notated host networks
    /// (`/32` for IPv4, `/128` for IPv6).
    async fn resolve(&self, hostname: &str) -> Result<Vec<String>, ResolveError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("lookup failed: {source}")]
    Lookup {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("lookup timed out")]
    Timeout { hostname: String },
}

/// Resolves hostnames with the system's DNS configuration.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

#[async_trait::async_trait]
impl<R: Resolve + ?Sized> Resolve for std::sync::Arc<R> {
    async fn resolve(&self, hostname: &str) -> Result<Vec<String>, ResolveError> {
        (**self).resolve(hostname).await
    }
}

// === impl ResolveError ===

impl ResolveError {
    pub fn lookup(
        hostname: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Lookup {
            hostname: hostname.into(),
            source: source.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            Self::Lookup { hostname, .. } | Self::Timeout { hostname } => hostname,
        }
    }
}

// === impl DnsResolver ===

impl DnsResolver {
    /// Builds a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_config() -> Result<Self, hickory_resolver::error::ResolveError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }
}

#[async_trait::async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<String>, ResolveError> {
        tracing::trace!(%hostname, "resolving");
        let lookup = self
            .resolver
            .lookup_ip(hostname)
            .await
            .map_err(|error| ResolveError::lookup(hostname, error))?;
        let cidrs = to_cidrs(lookup.iter());
        tracing::trace!(%hostname, ?cidrs, "resolved");
        Ok(cidrs)
    }
}

// `TokioAsyncResolver` does not implement `Debug`.
impl fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

/// Converts addresses into sorted, deduplicated host networks.
pub(crate) fn to_cidrs(addrs: impl IntoIterator<Item = IpAddr>) -> Vec<String> {
    let mut cidrs = addrs.into_iter().map(to_cidr).collect::<Vec<_>>();
    cidrs.sort();
    cidrs.dedup();
    cidrs
}

/// IPv4-mapped IPv6 addresses are written in their IPv4 form so that IPv4
/// networks in the filter apply to them.
fn to_cidr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(addr) => format!("{addr}/32"),
        IpAddr::V6(addr) => match addr.to_ipv4_mapped() {
            Some(addr) => format!("{addr}/32"),
            None => format!("{addr}/128"),
        },
    }
}
