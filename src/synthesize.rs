//! Derives an IP-based `NetworkPolicy` from an `AugmentedNetworkPolicy` and
//! the addresses its hostnames resolved to.

use crate::k8s::{
    AugmentedNetworkPolicy, AugmentedNetworkPolicySpec, EgressRule, IPBlock, LabelSelector,
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer, NetworkPolicySpec, ObjectMeta,
    Resource,
};
use std::collections::BTreeMap;

/// Builds the derived policy for `policy`, owned by `policy`.
pub fn desired(
    policy: &AugmentedNetworkPolicy,
    resolved: &BTreeMap<String, Vec<String>>,
) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: policy.meta().name.clone(),
            namespace: policy.meta().namespace.clone(),
            owner_references: policy.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        spec: Some(synthesize(&policy.spec, resolved)),
        ..Default::default()
    }
}

/// Expands each hostname peer into one `ipBlock` peer per resolved address.
///
/// Peers are emitted in rule, hostname, and address order. Hostnames without
/// an entry in `resolved` contribute no peers. A rule whose hostnames all
/// contribute no peers is omitted, since a rule without peers would permit
/// every destination.
pub fn synthesize(
    spec: &AugmentedNetworkPolicySpec,
    resolved: &BTreeMap<String, Vec<String>>,
) -> NetworkPolicySpec {
    let egress = spec
        .egress
        .iter()
        .filter_map(|rule| egress_rule(rule, resolved))
        .collect::<Vec<_>>();

    NetworkPolicySpec {
        pod_selector: spec.pod_selector.clone(),
        policy_types: policy_types(spec),
        egress: non_empty(egress),
        ingress: None,
    }
}

/// The source's policy types, or the types the API server would default the
/// source to.
///
/// Defaults are written explicitly: once rules without peers are omitted, the
/// derived policy may have no egress rules, and the server would default it to
/// `Ingress` alone, leaving egress unrestricted.
fn policy_types(spec: &AugmentedNetworkPolicySpec) -> Option<Vec<String>> {
    if !spec.policy_types.is_empty() {
        return Some(spec.policy_types.clone());
    }
    if spec.egress.is_empty() {
        return None;
    }
    Some(vec!["Ingress".to_string(), "Egress".to_string()])
}

fn egress_rule(
    rule: &EgressRule,
    resolved: &BTreeMap<String, Vec<String>>,
) -> Option<NetworkPolicyEgressRule> {
    let peers = rule
        .to
        .iter()
        .filter_map(|peer| resolved.get(&peer.hostname))
        .flatten()
        .map(|cidr| NetworkPolicyPeer {
            ip_block: Some(IPBlock {
                cidr: cidr.clone(),
                except: None,
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    if peers.is_empty() && !rule.to.is_empty() {
        return None;
    }

    Some(NetworkPolicyEgressRule {
        ports: non_empty(rule.ports.clone()),
        to: non_empty(peers),
    })
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Compares two policy specs, ignoring differences the API server introduces
/// when it applies defaults.
pub fn semantically_equal(a: &NetworkPolicySpec, b: &NetworkPolicySpec) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(spec: &NetworkPolicySpec) -> NetworkPolicySpec {
    let egress = spec
        .egress
        .iter()
        .flatten()
        .map(|rule| NetworkPolicyEgressRule {
            ports: non_empty(
                rule.ports
                    .iter()
                    .flatten()
                    .cloned()
                    .map(|mut port| {
                        port.protocol.get_or_insert_with(|| "TCP".to_string());
                        port
                    })
                    .collect(),
            ),
            to: non_empty(
                rule.to
                    .iter()
                    .flatten()
                    .cloned()
                    .map(|mut peer| {
                        if let Some(ip_block) = peer.ip_block.as_mut() {
                            ip_block.except = ip_block.except.take().and_then(non_empty);
                        }
                        peer.namespace_selector = peer.namespace_selector.map(normalize_selector);
                        peer.pod_selector = peer.pod_selector.map(normalize_selector);
                        peer
                    })
                    .collect(),
            ),
        })
        .collect::<Vec<_>>();

    // The API server defaults policy types to `Ingress`, plus `Egress` when
    // egress rules are present.
    let policy_types = match spec.policy_types.as_deref() {
        Some(types) if !types.is_empty() => types.to_vec(),
        _ if egress.is_empty() => vec!["Ingress".to_string()],
        _ => vec!["Ingress".to_string(), "Egress".to_string()],
    };

    NetworkPolicySpec {
        pod_selector: normalize_selector(spec.pod_selector.clone()),
        policy_types: Some(policy_types),
        egress: non_empty(egress),
        ingress: spec.ingress.clone().and_then(non_empty),
    }
}

fn normalize_selector(selector: LabelSelector) -> LabelSelector {
    LabelSelector {
        match_expressions: selector.match_expressions.and_then(non_empty),
        match_labels: selector.match_labels.filter(|labels| !labels.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{
        AugmentedNetworkPolicySpec, EgressPeer, EgressRule, IntOrString, NetworkPolicyPort,
    };
    use maplit::{btreemap, convert_args};

    fn https() -> NetworkPolicyPort {
        NetworkPolicyPort {
            protocol: Some("TCP".to_string()),
            port: Some(IntOrString::Int(443)),
            end_port: None,
        }
    }

    fn rule(hostnames: &[&str]) -> EgressRule {
        EgressRule {
            ports: vec![https()],
            to: hostnames
                .iter()
                .map(|h| EgressPeer {
                    hostname: h.to_string(),
                })
                .collect(),
        }
    }

    fn spec(egress: Vec<EgressRule>) -> AugmentedNetworkPolicySpec {
        AugmentedNetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(convert_args!(btreemap!("app" => "web"))),
                match_expressions: None,
            },
            egress,
            policy_types: vec!["Egress".to_string()],
            resolution_interval: None,
        }
    }

    fn cidrs(peers: &Option<Vec<NetworkPolicyPeer>>) -> Vec<&str> {
        peers
            .iter()
            .flatten()
            .filter_map(|p| p.ip_block.as_ref())
            .map(|b| b.cidr.as_str())
            .collect()
    }

    #[test]
    fn expands_hostnames_in_order() {
        let resolved = convert_args!(btreemap!(
            "a.example.com" => vec!["1.1.1.1/32".to_string(), "1.1.1.2/32".to_string()],
            "b.example.com" => vec!["2.2.2.2/32".to_string()],
        ));
        let np = synthesize(&spec(vec![rule(&["b.example.com", "a.example.com"])]), &resolved);

        let egress = np.egress.expect("egress must be set");
        assert_eq!(egress.len(), 1);
        assert_eq!(
            cidrs(&egress[0].to),
            vec!["2.2.2.2/32", "1.1.1.1/32", "1.1.1.2/32"]
        );
        assert_eq!(egress[0].ports, Some(vec![https()]));
        assert_eq!(np.policy_types, Some(vec!["Egress".to_string()]));
        assert_eq!(
            np.pod_selector.match_labels,
            Some(convert_args!(btreemap!("app" => "web")))
        );
    }

    #[test]
    fn unresolved_hostnames_contribute_no_peers() {
        let resolved = convert_args!(btreemap!(
            "a.example.com" => vec!["1.1.1.1/32".to_string()],
        ));
        let np = synthesize(
            &spec(vec![
                rule(&["a.example.com", "missing.example.com"]),
                rule(&["missing.example.com"]),
            ]),
            &resolved,
        );

        let egress = np.egress.expect("egress must be set");
        assert_eq!(egress.len(), 1, "a rule with no resolved peers is omitted");
        assert_eq!(cidrs(&egress[0].to), vec!["1.1.1.1/32"]);
    }

    #[test]
    fn rules_without_peers_pass_through() {
        let np = synthesize(&spec(vec![rule(&[])]), &BTreeMap::new());
        let egress = np.egress.expect("egress must be set");
        assert_eq!(egress.len(), 1);
        assert_eq!(egress[0].to, None);
        assert_eq!(egress[0].ports, Some(vec![https()]));
    }

    #[test]
    fn defaulted_policy_types_keep_egress_restricted() {
        let mut s = spec(vec![rule(&["missing.example.com"])]);
        s.policy_types = vec![];
        let np = synthesize(&s, &BTreeMap::new());
        assert_eq!(np.egress, None);
        assert_eq!(
            np.policy_types,
            Some(vec!["Ingress".to_string(), "Egress".to_string()])
        );
        assert_eq!(normalize(&np).policy_types, np.policy_types);

        let mut s = spec(vec![]);
        s.policy_types = vec![];
        assert_eq!(synthesize(&s, &BTreeMap::new()).policy_types, None);
    }

    #[test]
    fn deterministic() {
        let resolved = convert_args!(btreemap!(
            "a.example.com" => vec!["1.1.1.1/32".to_string()],
        ));
        let s = spec(vec![rule(&["a.example.com"])]);
        assert_eq!(synthesize(&s, &resolved), synthesize(&s, &resolved));
    }

    #[test]
    fn desired_is_owned_by_source() {
        let mut policy = AugmentedNetworkPolicy::new("egress", spec(vec![]));
        policy.metadata.namespace = Some("ns".to_string());
        policy.metadata.uid = Some("8d4f5a2e".to_string());

        let np = desired(&policy, &BTreeMap::new());
        assert_eq!(np.metadata.name.as_deref(), Some("egress"));
        assert_eq!(np.metadata.namespace.as_deref(), Some("ns"));
        let orefs = np.metadata.owner_references.expect("owner must be set");
        assert_eq!(orefs.len(), 1);
        assert_eq!(orefs[0].kind, "AugmentedNetworkPolicy");
        assert_eq!(orefs[0].name, "egress");
        assert_eq!(orefs[0].uid, "8d4f5a2e");
        assert_eq!(orefs[0].controller, Some(true));
    }

    #[test]
    fn equality_ignores_server_defaults() {
        let resolved = convert_args!(btreemap!(
            "a.example.com" => vec!["1.1.1.1/32".to_string()],
        ));
        let mut s = spec(vec![rule(&["a.example.com"])]);
        s.policy_types = vec![];
        s.egress[0].ports[0].protocol = None;
        let desired = synthesize(&s, &resolved);

        let mut stored = desired.clone();
        stored.policy_types = Some(vec!["Ingress".to_string(), "Egress".to_string()]);
        stored.egress.as_mut().unwrap()[0].ports.as_mut().unwrap()[0].protocol =
            Some("TCP".to_string());
        stored.ingress = Some(vec![]);
        assert!(semantically_equal(&stored, &desired));

        let mut changed = stored.clone();
        changed.egress.as_mut().unwrap()[0].to.as_mut().unwrap()[0]
            .ip_block
            .as_mut()
            .unwrap()
            .cidr = "2.2.2.2/32".to_string();
        assert!(!semantically_equal(&changed, &desired));
    }
}
