use crate::{
    k8s::{AugmentedNetworkPolicyStatus, K8sDuration, NetworkPolicy, Resource, ResourceId},
    metrics::ControllerMetrics,
    resolve::{Resolve, ResolveError},
    status,
    store::PolicyStore,
    synthesize,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::{self, Duration, Instant};


/// How often hostnames are re-resolved when a policy does not specify an
/// interval.
pub const DEFAULT_RESOLUTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The shortest interval at which hostnames are re-resolved.
pub const MIN_RESOLUTION_INTERVAL: Duration = Duration::from_secs(30);

/// Synchronizes the `NetworkPolicy` derived from each `AugmentedNetworkPolicy`
/// with the addresses its hostnames currently resolve to.
pub struct Reconciler {
    store: Arc<dyn PolicyStore>,
    resolver: Arc<dyn Resolve>,
    metrics: ControllerMetrics,
    resolve_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch {id}: {source}")]
    Fetch {
        id: ResourceId,
        #[source]
        source: kube::Error,
    },

    #[error("failed to apply NetworkPolicy {id}: {source}")]
    Apply {
        id: ResourceId,
        #[source]
        source: kube::Error,
    },

    #[error("failed to update status of {id}: {source}")]
    Status {
        id: ResourceId,
        #[source]
        source: kube::Error,
    },
}

/// The outcome of resolving every hostname referenced by a policy.
#[derive(Debug, Default)]
struct Resolution {
    addresses: BTreeMap<String, Vec<String>>,
    failures: Vec<String>,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        resolver: Arc<dyn Resolve>,
        metrics: ControllerMetrics,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            metrics,
            resolve_timeout,
        }
    }

    /// Runs a single reconciliation pass for the policy identified by `id`.
    ///
    /// Returns the delay before the next pass, or `None` if the policy no
    /// longer exists.
    #[tracing::instrument(skip_all, fields(policy = %id))]
    pub async fn reconcile(&self, id: &ResourceId) -> Result<Option<Duration>, Error> {
        let policy = self
            .store
            .get_policy(id)
            .await
            .map_err(|source| Error::Fetch {
                id: id.clone(),
                source,
            })?;
        let Some(policy) = policy else {
            tracing::info!("AugmentedNetworkPolicy not found, likely deleted");
            self.metrics.deletions.inc();
            return Ok(None);
        };

        let hostnames = policy.spec.hostnames().collect::<Vec<_>>();
        let Resolution {
            addresses,
            failures,
        } = self.resolve_all(&hostnames).await;

        let desired = synthesize::desired(&policy, &addresses);
        self.apply(id, desired).await?;

        let mut status = AugmentedNetworkPolicyStatus {
            conditions: policy
                .status
                .as_ref()
                .map(|s| s.conditions.clone())
                .unwrap_or_default(),
            resolved_addresses: addresses,
        };
        let ready = status::ready(&failures, policy.meta().generation, chrono::Utc::now());
        status::upsert_condition(&mut status.conditions, ready);
        if policy.status.as_ref() != Some(&status) {
            self.store
                .update_status(id, &status)
                .await
                .map_err(|source| Error::Status {
                    id: id.clone(),
                    source,
                })?;
        }

        Ok(Some(requeue_interval(policy.spec.resolution_interval)))
    }

    /// Resolves each hostname, bounding the whole set of lookups by the
    /// resolve timeout. Failures are recorded and do not stop resolution of
    /// the remaining hostnames.
    async fn resolve_all(&self, hostnames: &[&str]) -> Resolution {
        let deadline = Instant::now() + self.resolve_timeout;
        let mut resolution = Resolution::default();
        for &hostname in hostnames {
            let result = time::timeout_at(deadline, self.resolver.resolve(hostname))
                .await
                .unwrap_or_else(|_| {
                    Err(ResolveError::Timeout {
                        hostname: hostname.to_string(),
                    })
                });
            match result {
                Ok(cidrs) => {
                    resolution.addresses.insert(hostname.to_string(), cidrs);
                }
                Err(error) => {
                    tracing::warn!(%hostname, %error, "failed to resolve hostname");
                    resolution
                        .failures
                        .push(format!("failed to resolve {hostname:?}: {error}"));
                }
            }
        }
        resolution
    }

    /// Creates the derived policy if it does not exist, or replaces its spec
    /// if it differs from `desired`.
    async fn apply(&self, id: &ResourceId, desired: NetworkPolicy) -> Result<(), Error> {
        let apply_err = |source: kube::Error| Error::Apply {
            id: id.clone(),
            source,
        };

        let existing = self
            .store
            .get_network_policy(id)
            .await
            .map_err(|source| Error::Fetch {
                id: id.clone(),
                source,
            })?;

        let Some(mut existing) = existing else {
            tracing::info!("creating NetworkPolicy");
            self.store
                .create_network_policy(&desired)
                .await
                .map_err(apply_err)?;
            self.metrics.creations.inc();
            return Ok(());
        };

        let desired_spec = desired.spec.unwrap_or_default();
        let current_spec = existing.spec.clone().unwrap_or_default();
        if synthesize::semantically_equal(&current_spec, &desired_spec) {
            tracing::debug!("NetworkPolicy is up to date");
            return Ok(());
        }

        tracing::info!("updating NetworkPolicy");
        existing.spec = Some(desired_spec);
        self.store
            .replace_network_policy(&existing)
            .await
            .map_err(apply_err)?;
        self.metrics.updates.inc();
        Ok(())
    }
}

/// Returns the delay before a policy's next pass.
pub fn requeue_interval(interval: Option<K8sDuration>) -> Duration {
    let Some(requested) = interval else {
        return DEFAULT_RESOLUTION_INTERVAL;
    };
    match requested.to_std() {
        Some(interval) if interval >= MIN_RESOLUTION_INTERVAL => interval,
        _ => {
            tracing::info!(
                %requested,
                minimum = ?MIN_RESOLUTION_INTERVAL,
                "resolutionInterval too low, using minimum"
            );
            MIN_RESOLUTION_INTERVAL
        }
    }
}
