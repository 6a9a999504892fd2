use crate::k8s::{
    AugmentedNetworkPolicy, AugmentedNetworkPolicyStatus, NetworkPolicy, Resource, ResourceExt,
    ResourceId,
};
use kube::api::{Api, Patch, PatchParams, PostParams};

/// The field manager used for status patches.
pub const FIELD_MANAGER: &str = "augmented-policy-controller";

/// Reads source policies and writes derived policies and status.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(
        &self,
        id: &ResourceId,
    ) -> Result<Option<AugmentedNetworkPolicy>, kube::Error>;

    async fn get_network_policy(
        &self,
        id: &ResourceId,
    ) -> Result<Option<NetworkPolicy>, kube::Error>;

    async fn create_network_policy(&self, policy: &NetworkPolicy) -> Result<(), kube::Error>;

    /// Replaces an existing policy. `policy` must carry the resource version
    /// it was read at.
    async fn replace_network_policy(&self, policy: &NetworkPolicy) -> Result<(), kube::Error>;

    async fn update_status(
        &self,
        id: &ResourceId,
        status: &AugmentedNetworkPolicyStatus,
    ) -> Result<(), kube::Error>;
}

/// A [`PolicyStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PolicyStore for KubeStore {
    async fn get_policy(
        &self,
        id: &ResourceId,
    ) -> Result<Option<AugmentedNetworkPolicy>, kube::Error> {
        self.api::<AugmentedNetworkPolicy>(&id.namespace)
            .get_opt(&id.name)
            .await
    }

    async fn get_network_policy(
        &self,
        id: &ResourceId,
    ) -> Result<Option<NetworkPolicy>, kube::Error> {
        self.api::<NetworkPolicy>(&id.namespace)
            .get_opt(&id.name)
            .await
    }

    async fn create_network_policy(&self, policy: &NetworkPolicy) -> Result<(), kube::Error> {
        let ns = policy.namespace().unwrap_or_default();
        self.api::<NetworkPolicy>(&ns)
            .create(&PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn replace_network_policy(&self, policy: &NetworkPolicy) -> Result<(), kube::Error> {
        let ns = policy.namespace().unwrap_or_default();
        self.api::<NetworkPolicy>(&ns)
            .replace(&policy.name_any(), &PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: &ResourceId,
        status: &AugmentedNetworkPolicyStatus,
    ) -> Result<(), kube::Error> {
        // Server-side apply drops any field this manager previously set but
        // omits now, e.g. hostnames that no longer resolve.
        let patch = serde_json::json!({
            "apiVersion": AugmentedNetworkPolicy::api_version(&()),
            "kind": AugmentedNetworkPolicy::kind(&()),
            "status": status,
        });
        self.api::<AugmentedNetworkPolicy>(&id.namespace)
            .patch_status(
                &id.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(patch),
            )
            .await?;
        Ok(())
    }
}
