//! Decides which resolved addresses may appear in a derived policy.

use ipnet::{IpNet, Ipv4Net};
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};

/// Decides whether an address may be used as an egress peer.
pub trait AddressFilter: Send + Sync {
    fn is_allowed(&self, address: &str) -> bool;
}

/// Filters addresses against static allow and deny lists and a deny list that
/// may be replaced at runtime.
///
/// Denials always take precedence: an address that overlaps any static or
/// dynamic deny network is rejected even when it is contained by an allowed
/// network. When the allow list is empty, every address that is not denied is
/// allowed; otherwise an address must be contained by an allowed network.
///
/// Addresses that cannot be parsed as a CIDR or IP address are always denied.
#[derive(Debug)]
pub struct IpFilter {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
    dynamic_deny: RwLock<Arc<[IpNet]>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid allow network {0:?}")]
    InvalidAllow(String),

    #[error("invalid deny network {0:?}")]
    InvalidDeny(String),

    #[error("invalid dynamic deny network {0:?}")]
    InvalidDynamicDeny(String),
}

// === impl IpFilter ===

impl IpFilter {
    pub fn new<A, D>(allow: A, deny: D) -> Result<Self, FilterError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let allow = parse_networks(allow, FilterError::InvalidAllow)?;
        let deny = parse_networks(deny, FilterError::InvalidDeny)?;
        let dynamic_deny: Arc<[IpNet]> = Arc::new([]);
        Ok(Self {
            allow,
            deny,
            dynamic_deny: RwLock::new(dynamic_deny),
        })
    }

    /// Replaces the entire dynamic deny list.
    ///
    /// If any network fails to parse, the previous list is left in place.
    pub fn replace_dynamic_deny<I>(&self, networks: I) -> Result<(), FilterError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let networks = parse_networks(networks, FilterError::InvalidDynamicDeny)?;
        *self.dynamic_deny.write() = networks.into();
        Ok(())
    }

    pub fn allow_networks(&self) -> &[IpNet] {
        &self.allow
    }

    pub fn deny_networks(&self) -> &[IpNet] {
        &self.deny
    }

    pub fn dynamic_deny_networks(&self) -> Arc<[IpNet]> {
        self.dynamic_deny.read().clone()
    }

    fn check(&self, net: &IpNet) -> bool {
        if self.deny.iter().any(|deny| overlaps(deny, net)) {
            return false;
        }

        let dynamic = self.dynamic_deny_networks();
        if dynamic.iter().any(|deny| overlaps(deny, net)) {
            return false;
        }

        self.allow.is_empty() || self.allow.iter().any(|allow| allow.contains(net))
    }
}

impl AddressFilter for IpFilter {
    fn is_allowed(&self, address: &str) -> bool {
        match parse_network(address) {
            Some(net) => self.check(&net),
            None => {
                tracing::debug!(%address, "denying unparseable address");
                false
            }
        }
    }
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// Parses a network in CIDR notation, or a bare address as a host network.
///
/// Networks within `::ffff:0:0/96` are converted to their IPv4 equivalent.
pub(crate) fn parse_network(s: &str) -> Option<IpNet> {
    let s = s.trim();
    let net = match s.parse::<IpNet>() {
        Ok(net) => net,
        Err(_) => IpNet::from(s.parse::<IpAddr>().ok()?),
    };
    Some(unmap(net))
}

fn unmap(net: IpNet) -> IpNet {
    let IpNet::V6(v6) = net else {
        return net;
    };
    match v6.addr().to_ipv4_mapped() {
        Some(addr) if v6.prefix_len() >= 96 => {
            Ipv4Net::new(addr, v6.prefix_len() - 96).map_or(net, IpNet::V4)
        }
        _ => net,
    }
}

fn parse_networks<I>(
    networks: I,
    err: fn(String) -> FilterError,
) -> Result<Vec<IpNet>, FilterError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    networks
        .into_iter()
        .map(|n| parse_network(n.as_ref()).ok_or_else(|| err(n.as_ref().to_string())))
        .collect()
}
