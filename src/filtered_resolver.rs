use crate::{
    filter::AddressFilter,
    metrics::ResolverMetrics,
    resolve::{Resolve, ResolveError},
};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Resolves hostnames through an inner resolver, drops addresses rejected by
/// the filter, and tracks when a hostname's filtered addresses change.
///
/// The last filtered result for each hostname is kept for the lifetime of the
/// resolver. It is not persisted, so the first resolution after a restart is
/// never reported as a change.
#[derive(Debug)]
pub struct FilteredResolver<R, F> {
    inner: R,
    filter: Arc<F>,
    last_seen: Mutex<AHashMap<String, Vec<String>>>,
    metrics: ResolverMetrics,
}

// === impl FilteredResolver ===

impl<R, F> FilteredResolver<R, F>
where
    R: Resolve,
    F: AddressFilter,
{
    pub fn new(inner: R, filter: Arc<F>, metrics: ResolverMetrics) -> Self {
        Self {
            inner,
            filter,
            last_seen: Mutex::new(AHashMap::new()),
            metrics,
        }
    }

    fn filter(&self, hostname: &str, addresses: Vec<String>) -> Vec<String> {
        addresses
            .into_iter()
            .filter(|address| {
                let allowed = self.filter.is_allowed(address);
                if !allowed {
                    tracing::info!(%hostname, %address, "filtered resolved address");
                    self.metrics.filtered(hostname);
                }
                allowed
            })
            .collect()
    }

    /// Records the current addresses for `hostname`, returning `true` if they
    /// differ from a previously recorded set.
    fn observe(&self, hostname: &str, addresses: &[String]) -> bool {
        let mut current = addresses.to_vec();
        current.sort();
        current.dedup();

        let mut last_seen = self.last_seen.lock();
        match last_seen.insert(hostname.to_string(), current.clone()) {
            Some(previous) if previous != current => {
                tracing::info!(%hostname, ?previous, ?current, "resolution changed");
                self.metrics.changed(hostname);
                true
            }
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl<R, F> Resolve for FilteredResolver<R, F>
where
    R: Resolve,
    F: AddressFilter,
{
    async fn resolve(&self, hostname: &str) -> Result<Vec<String>, ResolveError> {
        let addresses = self.inner.resolve(hostname).await?;
        let addresses = self.filter(hostname, addresses);
        self.observe(hostname, &addresses);
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::IpFilter;
    use maplit::hashmap;
    use std::collections::HashMap;

    /// Returns canned results that may be swapped between calls.
    #[derive(Default)]
    struct StaticResolver(Mutex<HashMap<String, Vec<String>>>);

    impl StaticResolver {
        fn new(results: HashMap<&str, Vec<&str>>) -> Self {
            let resolver = Self::default();
            for (hostname, addrs) in results {
                resolver.set(hostname, &addrs);
            }
            resolver
        }

        fn set(&self, hostname: &str, addrs: &[&str]) {
            self.0.lock().insert(
                hostname.to_string(),
                addrs.iter().map(|a| a.to_string()).collect(),
            );
        }
    }

    #[async_trait::async_trait]
    impl Resolve for StaticResolver {
        async fn resolve(&self, hostname: &str) -> Result<Vec<String>, ResolveError> {
            self.0
                .lock()
                .get(hostname)
                .cloned()
                .ok_or_else(|| ResolveError::lookup(hostname, "no such host"))
        }
    }

    fn filtered(
        inner: &Arc<StaticResolver>,
        deny: &[&str],
    ) -> (
        FilteredResolver<Arc<StaticResolver>, IpFilter>,
        ResolverMetrics,
    ) {
        let filter = IpFilter::new([] as [&str; 0], deny).unwrap();
        let metrics = ResolverMetrics::default();
        let resolver = FilteredResolver::new(inner.clone(), Arc::new(filter), metrics.clone());
        (resolver, metrics)
    }

    #[tokio::test]
    async fn filters_denied_addresses() {
        let inner = Arc::new(StaticResolver::new(hashmap! {
            "metadata.example.com" => vec!["169.254.169.254/32", "93.184.216.34/32"],
        }));
        let (resolver, metrics) = filtered(&inner, &["169.254.169.254/32"]);

        let addrs = resolver.resolve("metadata.example.com").await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34/32"]);
        assert_eq!(metrics.filtered_count("metadata.example.com"), 1);
    }

    #[tokio::test]
    async fn detects_changes() {
        let inner = Arc::new(StaticResolver::new(hashmap! {
            "example.com" => vec!["1.1.1.1/32"],
        }));
        let (resolver, metrics) = filtered(&inner, &[]);

        // The first resolution is never a change.
        resolver.resolve("example.com").await.unwrap();
        assert_eq!(metrics.change_count("example.com"), 0);

        resolver.resolve("example.com").await.unwrap();
        assert_eq!(metrics.change_count("example.com"), 0);

        inner.set("example.com", &["2.2.2.2/32"]);
        let addrs = resolver.resolve("example.com").await.unwrap();
        assert_eq!(addrs, vec!["2.2.2.2/32"]);
        assert_eq!(metrics.change_count("example.com"), 1);
    }

    #[tokio::test]
    async fn ordering_is_not_a_change() {
        let inner = Arc::new(StaticResolver::new(hashmap! {
            "example.com" => vec!["1.1.1.1/32", "2.2.2.2/32"],
        }));
        let (resolver, metrics) = filtered(&inner, &[]);
        resolver.resolve("example.com").await.unwrap();

        inner.set("example.com", &["2.2.2.2/32", "1.1.1.1/32"]);
        resolver.resolve("example.com").await.unwrap();
        assert_eq!(metrics.change_count("example.com"), 0);
    }

    #[tokio::test]
    async fn changes_are_tracked_per_hostname() {
        let inner = Arc::new(StaticResolver::new(hashmap! {
            "a.example.com" => vec!["1.1.1.1/32"],
            "b.example.com" => vec!["2.2.2.2/32"],
        }));
        let (resolver, metrics) = filtered(&inner, &[]);
        resolver.resolve("a.example.com").await.unwrap();
        resolver.resolve("b.example.com").await.unwrap();

        inner.set("b.example.com", &["3.3.3.3/32"]);
        resolver.resolve("a.example.com").await.unwrap();
        resolver.resolve("b.example.com").await.unwrap();
        assert_eq!(metrics.change_count("a.example.com"), 0);
        assert_eq!(metrics.change_count("b.example.com"), 1);
    }

    #[tokio::test]
    async fn failures_leave_state_untouched() {
        let inner = Arc::new(StaticResolver::new(hashmap! {
            "example.com" => vec!["1.1.1.1/32"],
        }));
        let (resolver, metrics) = filtered(&inner, &[]);
        resolver.resolve("example.com").await.unwrap();

        inner.0.lock().remove("example.com");
        let err = resolver.resolve("example.com").await.unwrap_err();
        assert_eq!(err.hostname(), "example.com");

        // The set recorded before the failure is still the baseline.
        inner.set("example.com", &["1.1.1.1/32"]);
        resolver.resolve("example.com").await.unwrap();
        assert_eq!(metrics.change_count("example.com"), 0);
    }
}
