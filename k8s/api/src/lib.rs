#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod augmented_policy;
pub mod duration;

pub use self::{
    augmented_policy::{
        AugmentedNetworkPolicy, AugmentedNetworkPolicySpec, AugmentedNetworkPolicyStatus,
        EgressPeer, EgressRule,
    },
    duration::K8sDuration,
};
pub use k8s_openapi::{
    api::{
        core::v1::{Node, NodeSpec},
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer,
            NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{Condition, LabelSelector, Time},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    Resource,
};

/// Identifies a namespaced resource.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the ID of a namespaced resource, or `None` if the resource has
    /// no name or namespace.
    pub fn of<T: kube::Resource>(resource: &T) -> Option<Self> {
        let meta = resource.meta();
        Some(Self {
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
