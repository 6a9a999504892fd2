//! Keeps the filter's dynamic deny list in sync with the cluster's pod
//! networks, so that hostnames resolving to pod IPs cannot be used to reach
//! workloads inside the cluster.

use crate::{filter::IpFilter, k8s::Node};
use kube::api::{Api, ListParams};
use std::sync::Arc;
use tokio::time;
use tracing::Instrument;

/// Lists the cluster's nodes.
#[async_trait::async_trait]
pub trait NodeInventory: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error>;
}

/// Periodically replaces the filter's dynamic deny list with the pod CIDRs
/// assigned to every node.
#[derive(Debug)]
pub struct PodNetworks<N> {
    inventory: N,
    filter: Arc<IpFilter>,
    interval: time::Duration,
}

/// Lists nodes from the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodes(Api<Node>);

// === impl PodNetworks ===

impl<N: NodeInventory> PodNetworks<N> {
    pub fn new(inventory: N, filter: Arc<IpFilter>, interval: time::Duration) -> Self {
        Self {
            inventory,
            filter,
            interval,
        }
    }

    /// Spawns a task that refreshes the deny list until `shutdown` is
    /// signaled.
    pub fn spawn(self, shutdown: drain::Watch) -> tokio::task::JoinHandle<()>
    where
        N: 'static,
    {
        tokio::spawn(
            self.run(shutdown)
                .instrument(tracing::info_span!("pod_networks")),
        )
    }

    /// Refreshes the deny list immediately and then on every interval until
    /// `shutdown` is signaled.
    pub async fn run(self, shutdown: drain::Watch) {
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                // The first tick completes immediately.
                _ = interval.tick() => self.refresh().await,
                _ = &mut shutdown => {
                    tracing::debug!("shutting down");
                    return;
                }
            }
        }
    }

    /// Lists nodes and installs their pod CIDRs as the dynamic deny list.
    ///
    /// Failures are logged and leave the previous deny list in place.
    pub async fn refresh(&self) {
        let nodes = match self.inventory.list_nodes().await {
            Ok(nodes) => nodes,
            Err(error) => {
                tracing::warn!(%error, "failed to list nodes");
                return;
            }
        };

        let cidrs = pod_networks(&nodes);
        match self.filter.replace_dynamic_deny(&cidrs) {
            Ok(()) => tracing::info!(?cidrs, "updated pod network deny list"),
            Err(error) => tracing::warn!(%error, "failed to update pod network deny list"),
        }
    }
}

/// Returns the distinct pod CIDRs assigned to `nodes`, in the order they are
/// first seen.
///
/// A node's `podCIDRs` are used when set; otherwise its `podCIDR`, if any.
fn pod_networks(nodes: &[Node]) -> Vec<String> {
    let mut cidrs = Vec::<String>::new();
    let specs = nodes.iter().filter_map(|node| node.spec.as_ref());
    for spec in specs {
        let node_cidrs = match (&spec.pod_cidrs, &spec.pod_cidr) {
            (Some(cidrs), _) if !cidrs.is_empty() => cidrs.as_slice(),
            (_, Some(cidr)) if !cidr.is_empty() => std::slice::from_ref(cidr),
            _ => &[],
        };
        for cidr in node_cidrs {
            if !cidrs.contains(cidr) {
                cidrs.push(cidr.clone());
            }
        }
    }
    cidrs
}

// === impl KubeNodes ===

impl KubeNodes {
    pub fn new(client: kube::Client) -> Self {
        Self(Api::all(client))
    }
}

#[async_trait::async_trait]
impl NodeInventory for KubeNodes {
    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error> {
        let nodes = self.0.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }
}
