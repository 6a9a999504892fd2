use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts writes to derived `NetworkPolicy` objects.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) creations: Counter,
    pub(crate) deletions: Counter,
    pub(crate) updates: Counter,
}

/// Counts per-hostname resolution outcomes.
#[derive(Clone, Debug, Default)]
pub struct ResolverMetrics {
    addresses_filtered: Family<HostnameLabels, Counter>,
    resolution_changes: Family<HostnameLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostnameLabels {
    hostname: String,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "creations",
            "Total number of derived NetworkPolicies created",
            metrics.creations.clone(),
        );
        reg.register(
            "deletions",
            "Total number of AugmentedNetworkPolicies observed as deleted",
            metrics.deletions.clone(),
        );
        reg.register(
            "updates",
            "Total number of derived NetworkPolicies updated after a resolution change",
            metrics.updates.clone(),
        );
        metrics
    }
}

// === impl ResolverMetrics ===

impl ResolverMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "addresses_filtered",
            "Total number of resolved addresses rejected by the address filter",
            metrics.addresses_filtered.clone(),
        );
        reg.register(
            "resolution_changes",
            "Total number of times a hostname resolved to a different set of addresses",
            metrics.resolution_changes.clone(),
        );
        metrics
    }

    pub(crate) fn filtered(&self, hostname: &str) {
        self.addresses_filtered
            .get_or_create(&HostnameLabels::new(hostname))
            .inc();
    }

    pub(crate) fn changed(&self, hostname: &str) {
        self.resolution_changes
            .get_or_create(&HostnameLabels::new(hostname))
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn filtered_count(&self, hostname: &str) -> u64 {
        self.addresses_filtered
            .get_or_create(&HostnameLabels::new(hostname))
            .get()
    }

    #[cfg(test)]
    pub(crate) fn change_count(&self, hostname: &str) -> u64 {
        self.resolution_changes
            .get_or_create(&HostnameLabels::new(hostname))
            .get()
    }
}

impl HostnameLabels {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
        }
    }
}
