#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use augmented_policy_k8s_api as k8s;

pub mod controller;
pub mod filter;
pub mod filtered_resolver;
pub mod metrics;
pub mod pod_networks;
pub mod reconcile;
pub mod resolve;
pub mod status;
pub mod store;
pub mod synthesize;

pub use self::{
    filter::{AddressFilter, FilterError, IpFilter},
    filtered_resolver::FilteredResolver,
    metrics::{ControllerMetrics, ResolverMetrics},
    pod_networks::{KubeNodes, NodeInventory, PodNetworks},
    reconcile::Reconciler,
    resolve::{DnsResolver, Resolve, ResolveError},
    store::{KubeStore, PolicyStore},
};
