use crate::{duration::K8sDuration, Condition, LabelSelector, NetworkPolicyPort};
use std::collections::BTreeMap;

/// An egress-only network policy whose peers are named by DNS hostname.
///
/// The controller resolves each hostname and maintains a
/// `networking.k8s.io/v1` `NetworkPolicy` of the same name with one `ipBlock`
/// peer per resolved address.
#[derive(
    Clone,
    Debug,
    PartialEq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "networking.augmented.dev",
    version = "v1alpha1",
    kind = "AugmentedNetworkPolicy",
    status = "AugmentedNetworkPolicyStatus",
    shortname = "anp",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AugmentedNetworkPolicySpec {
    pub pod_selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<EgressRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_types: Vec<String>,

    /// How often hostnames are re-resolved. Defaults to 5m; values below 30s
    /// are raised to 30s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_interval: Option<K8sDuration>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<EgressPeer>,
}

#[derive(
    Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct EgressPeer {
    pub hostname: String,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct AugmentedNetworkPolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The filtered addresses each hostname resolved to on the most recent
    /// pass. Hostnames that failed to resolve are absent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_addresses: BTreeMap<String, Vec<String>>,
}

// === impl AugmentedNetworkPolicySpec ===

impl AugmentedNetworkPolicySpec {
    /// Iterates over every distinct hostname referenced by the egress rules,
    /// in the order each is first referenced.
    pub fn hostnames(&self) -> impl Iterator<Item = &str> + '_ {
        let mut seen = std::collections::HashSet::new();
        self.egress
            .iter()
            .flat_map(|rule| rule.to.iter())
            .map(|peer| peer.hostname.as_str())
            .filter(move |hostname| seen.insert(*hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_hostname_policy() {
        let spec = serde_json::from_value::<AugmentedNetworkPolicySpec>(serde_json::json!({
            "podSelector": { "matchLabels": { "app": "web" } },
            "policyTypes": ["Egress"],
            "resolutionInterval": "10m",
            "egress": [{
                "ports": [{ "protocol": "TCP", "port": 443 }],
                "to": [{ "hostname": "example.com" }, { "hostname": "api.example.com" }],
            }],
        }))
        .expect("spec must deserialize");

        assert_eq!(spec.policy_types, vec!["Egress".to_string()]);
        assert_eq!(
            spec.resolution_interval.map(std::time::Duration::from),
            Some(std::time::Duration::from_secs(600))
        );
        assert_eq!(spec.egress.len(), 1);
        assert_eq!(spec.egress[0].ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(
            spec.hostnames().collect::<Vec<_>>(),
            vec!["example.com", "api.example.com"]
        );
    }

    #[test]
    fn hostnames_are_deduplicated_across_rules() {
        let spec = AugmentedNetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            egress: vec![
                EgressRule {
                    ports: vec![],
                    to: vec![
                        EgressPeer {
                            hostname: "b.example.com".to_string(),
                        },
                        EgressPeer {
                            hostname: "a.example.com".to_string(),
                        },
                    ],
                },
                EgressRule {
                    ports: vec![],
                    to: vec![EgressPeer {
                        hostname: "b.example.com".to_string(),
                    }],
                },
            ],
            policy_types: vec![],
            resolution_interval: None,
        };

        assert_eq!(
            spec.hostnames().collect::<Vec<_>>(),
            vec!["b.example.com", "a.example.com"]
        );
    }

    #[test]
    fn empty_status_serializes_to_empty_object() {
        let status = AugmentedNetworkPolicyStatus::default();
        assert_eq!(serde_json::to_value(status).unwrap(), serde_json::json!({}));
    }
}
