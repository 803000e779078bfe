use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    runtime::{reflector, reflector::ObjectRef, watcher},
    Api, Client, ResourceExt,
};

use ternd_npm::dataplane::Dataplane;
use ternd_npm::ipsets::{SetKind, SetMetadata};
use ternd_npm::policies::{AclPolicy, Direction, NpmNetworkPolicy, PolicyTarget, PortRule, TranslatedIpSet};

use crate::agent::error::Error;
use crate::agent::workqueue::WorkQueue;
use crate::util::get_namespaced_name;

/// Sets selecting pods by label: one key:value set per matchLabel, one key
/// set per Exists expression. Unknown operators are dropped, not errors.
fn selector_sets(selector: &LabelSelector) -> Vec<TranslatedIpSet> {
    let mut sets = Vec::new();
    for (key, value) in selector.match_labels.iter().flatten() {
        sets.push(TranslatedIpSet::new(SetMetadata::new(
            &format!("{key}:{value}"),
            SetKind::KeyValueLabelOfPod,
        )));
    }
    for expr in selector.match_expressions.iter().flatten() {
        match expr.operator.as_str() {
            "In" => {
                for value in expr.values.iter().flatten() {
                    sets.push(TranslatedIpSet::new(SetMetadata::new(
                        &format!("{}:{value}", expr.key),
                        SetKind::KeyValueLabelOfPod,
                    )));
                }
            }
            "Exists" => sets.push(TranslatedIpSet::new(SetMetadata::new(
                &expr.key,
                SetKind::KeyLabelOfPod,
            ))),
            other => {
                tracing::debug!(operator = other, "Dropping unsupported selector operator")
            }
        }
    }
    sets
}

fn namespace_selector_sets(selector: &LabelSelector) -> Vec<TranslatedIpSet> {
    let mut sets = Vec::new();
    for (key, value) in selector.match_labels.iter().flatten() {
        sets.push(TranslatedIpSet::new(SetMetadata::new(
            &format!("{key}:{value}"),
            SetKind::KeyValueLabelOfNamespace,
        )));
    }
    if sets.is_empty() {
        sets.push(TranslatedIpSet::new(SetMetadata::all_namespaces()));
    }
    sets
}

fn cidr_set_name(policy: &str, direction: Direction, rule: usize, peer: usize) -> String {
    let direction = match direction {
        Direction::Ingress => "in",
        Direction::Egress => "out",
    };
    format!("{}-{direction}-{rule}-{peer}-cidr", policy.replace('/', "-"))
}

/// One peer of a rule, translated to the sets it references. New sets the
/// policy itself materializes (cidr blocks) carry their members.
fn peer_sets(
    peer: &NetworkPolicyPeer,
    policy_namespace: &str,
    policy_name: &str,
    direction: Direction,
    rule_idx: usize,
    peer_idx: usize,
) -> Vec<TranslatedIpSet> {
    if let Some(ip_block) = peer.ip_block.as_ref() {
        let mut members = vec![ip_block.cidr.clone()];
        for except in ip_block.except.iter().flatten() {
            members.push(format!("{except} nomatch"));
        }
        let name = cidr_set_name(policy_name, direction, rule_idx, peer_idx);
        return vec![TranslatedIpSet {
            metadata: SetMetadata::new(&name, SetKind::CidrBlocks),
            members,
        }];
    }

    let mut sets = Vec::new();
    match (peer.namespace_selector.as_ref(), peer.pod_selector.as_ref()) {
        (None, None) => sets.push(TranslatedIpSet::new(SetMetadata::all_namespaces())),
        (Some(ns_selector), pod_selector) => {
            sets.extend(namespace_selector_sets(ns_selector));
            if let Some(pod_selector) = pod_selector {
                sets.extend(selector_sets(pod_selector));
            }
        }
        (None, Some(pod_selector)) => {
            // a bare pod selector is scoped to the policy's namespace
            sets.push(TranslatedIpSet::new(SetMetadata::new(
                policy_namespace,
                SetKind::Namespace,
            )));
            sets.extend(selector_sets(pod_selector));
        }
    }
    sets
}

/// Ports of a rule: numeric ports become port matches, named ports resolve
/// through the named-port set the pod controller maintains.
fn rule_ports(ports: &[NetworkPolicyPort]) -> (Vec<PortRule>, Vec<TranslatedIpSet>) {
    let mut port_rules = Vec::new();
    let mut named_sets = Vec::new();
    for port in ports {
        let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
        match port.port.as_ref() {
            Some(IntOrString::Int(number)) => port_rules.push(PortRule {
                protocol,
                port: Some(*number),
                end_port: port.end_port,
            }),
            Some(IntOrString::String(name)) => named_sets.push(TranslatedIpSet::new(
                SetMetadata::new(name, SetKind::NamedPorts),
            )),
            None => port_rules.push(PortRule {
                protocol,
                port: None,
                end_port: None,
            }),
        }
    }
    (port_rules, named_sets)
}

/// Translates a Kubernetes NetworkPolicy into the dataplane policy form:
/// selector sets, rule sets and ordered ACLs ending in the default deny.
pub fn translate_network_policy(policy: &NetworkPolicy) -> Result<NpmNetworkPolicy, Error> {
    let namespace = crate::util::get_namespace(policy).map_err(Error::KubeLibrary)?;
    let name = get_namespaced_name(policy);
    let spec = policy.spec.clone().unwrap_or_default();

    let mut pod_selector_sets = vec![TranslatedIpSet::new(SetMetadata::new(
        &namespace,
        SetKind::Namespace,
    ))];
    pod_selector_sets.extend(selector_sets(&spec.pod_selector));
    let selector_metas: Vec<SetMetadata> = pod_selector_sets
        .iter()
        .map(|s| s.metadata.clone())
        .collect();

    let mut rule_sets: Vec<TranslatedIpSet> = Vec::new();
    let mut acls = Vec::new();

    let policy_types = spec.policy_types.clone().unwrap_or_else(|| {
        let mut types = vec!["Ingress".to_string()];
        if spec.egress.is_some() {
            types.push("Egress".to_string());
        }
        types
    });

    if policy_types.iter().any(|t| t == "Ingress") {
        for (rule_idx, rule) in spec.ingress.iter().flatten().enumerate() {
            let mut src_sets = Vec::new();
            for (peer_idx, peer) in rule.from.iter().flatten().enumerate() {
                for set in peer_sets(peer, &namespace, &name, Direction::Ingress, rule_idx, peer_idx)
                {
                    src_sets.push(set.metadata.clone());
                    rule_sets.push(set);
                }
            }
            let (ports, named_sets) = rule_ports(rule.ports.as_deref().unwrap_or_default());
            let mut dst_sets = selector_metas.clone();
            for set in named_sets {
                dst_sets.push(set.metadata.clone());
                rule_sets.push(set);
            }
            acls.push(AclPolicy {
                policy_id: format!("acl-in-{rule_idx}-{name}"),
                target: PolicyTarget::Allowed,
                direction: Direction::Ingress,
                src_sets,
                dst_sets,
                ports,
            });
        }
        acls.push(AclPolicy {
            policy_id: format!("default-deny-in-{name}"),
            target: PolicyTarget::Dropped,
            direction: Direction::Ingress,
            src_sets: Vec::new(),
            dst_sets: selector_metas.clone(),
            ports: Vec::new(),
        });
    }

    if policy_types.iter().any(|t| t == "Egress") {
        for (rule_idx, rule) in spec.egress.iter().flatten().enumerate() {
            let mut dst_sets = Vec::new();
            for (peer_idx, peer) in rule.to.iter().flatten().enumerate() {
                for set in peer_sets(peer, &namespace, &name, Direction::Egress, rule_idx, peer_idx)
                {
                    dst_sets.push(set.metadata.clone());
                    rule_sets.push(set);
                }
            }
            let (ports, named_sets) = rule_ports(rule.ports.as_deref().unwrap_or_default());
            for set in named_sets {
                dst_sets.push(set.metadata.clone());
                rule_sets.push(set);
            }
            acls.push(AclPolicy {
                policy_id: format!("acl-out-{rule_idx}-{name}"),
                target: PolicyTarget::Allowed,
                direction: Direction::Egress,
                src_sets: selector_metas.clone(),
                dst_sets,
                ports,
            });
        }
        acls.push(AclPolicy {
            policy_id: format!("default-deny-out-{name}"),
            target: PolicyTarget::Dropped,
            direction: Direction::Egress,
            src_sets: selector_metas.clone(),
            dst_sets: Vec::new(),
            ports: Vec::new(),
        });
    }

    Ok(NpmNetworkPolicy {
        name,
        pod_selector_sets,
        rule_sets,
        acls,
    })
}

pub struct NetworkPolicyController {
    dataplane: Arc<dyn Dataplane>,
    workqueue: WorkQueue<String>,
}

impl NetworkPolicyController {
    pub fn new(dataplane: Arc<dyn Dataplane>) -> NetworkPolicyController {
        NetworkPolicyController {
            dataplane,
            workqueue: WorkQueue::new(),
        }
    }

    pub fn workqueue(&self) -> &WorkQueue<String> {
        &self.workqueue
    }

    #[tracing::instrument(skip_all, fields(policy = key))]
    pub async fn sync(&self, key: &str, policy: Option<&NetworkPolicy>) -> Result<(), Error> {
        match policy {
            Some(policy) => {
                tracing::info!(policy = key, "Apply network policy");
                let translated = translate_network_policy(policy)?;
                self.dataplane
                    .update_policy(&translated)
                    .await
                    .map_err(Error::Dataplane)
            }
            None => {
                tracing::info!(policy = key, "Remove network policy");
                self.dataplane
                    .remove_policy(key)
                    .await
                    .map_err(Error::Dataplane)
            }
        }
    }
}

fn object_ref(key: &str) -> ObjectRef<NetworkPolicy> {
    match key.split_once('/') {
        Some((namespace, name)) => ObjectRef::new(name).within(namespace),
        None => ObjectRef::new(key),
    }
}

pub async fn run(controller: Arc<NetworkPolicyController>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let policies = Api::<NetworkPolicy>::all(client);
    let (reader, writer) = reflector::store::<NetworkPolicy>();
    let stream = reflector(writer, watcher(policies, watcher::Config::default()));

    tracing::info!("Start NetworkPolicy reconciler");

    let worker = controller.clone();
    let worker_reader = reader.clone();
    tokio::spawn(async move {
        while let Some(key) = worker.workqueue().get().await {
            let policy = worker_reader.get(&object_ref(&key));
            if let Err(e) = worker.sync(&key, policy.as_deref()).await {
                tracing::warn!(policy = key, error = ?e, "Failed to reconcile NetworkPolicy");
            }
            worker.workqueue().done(&key);
        }
    });

    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(policy)) => {
                controller.workqueue().add(get_namespaced_name(&policy))
            }
            Ok(watcher::Event::Deleted(policy)) => {
                controller.workqueue().add(get_namespaced_name(&policy))
            }
            Ok(watcher::Event::Restarted(policies)) => {
                for policy in policies {
                    controller.workqueue().add(get_namespaced_name(&policy));
                }
            }
            Err(e) => tracing::warn!(error = ?e, "NetworkPolicy watch error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        IPBlock, NetworkPolicyIngressRule, NetworkPolicySpec,
    };
    use kube::core::ObjectMeta;
    use ternd_npm::dataplane::HostDataplane;
    use ternd_npm::shim::FakeHostPlane;

    fn test_network_policy() -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some("testpolicy".to_string()),
                namespace: Some("test-namespace".to_string()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(
                        [("app".to_string(), "test-pod".to_string())].into_iter().collect(),
                    ),
                    ..Default::default()
                },
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![NetworkPolicyPeer {
                        ip_block: Some(IPBlock {
                            cidr: "10.0.0.0/8".to_string(),
                            except: Some(vec!["10.1.0.0/16".to_string()]),
                        }),
                        ..Default::default()
                    }]),
                    ports: Some(vec![NetworkPolicyPort {
                        port: Some(IntOrString::Int(8080)),
                        protocol: Some("TCP".to_string()),
                        end_port: None,
                    }]),
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn works_translate_selector_and_cidr() {
        let translated = translate_network_policy(&test_network_policy()).unwrap();
        assert_eq!(translated.name, "test-namespace/testpolicy");

        let selector_names: Vec<&str> = translated
            .pod_selector_sets
            .iter()
            .map(|s| s.metadata.name.as_str())
            .collect();
        assert_eq!(selector_names, vec!["test-namespace", "app:test-pod"]);

        let cidr = translated
            .rule_sets
            .iter()
            .find(|s| s.metadata.kind == SetKind::CidrBlocks)
            .unwrap();
        assert_eq!(
            cidr.metadata.name,
            "test-namespace-testpolicy-in-0-0-cidr"
        );
        assert_eq!(
            cidr.members,
            vec!["10.0.0.0/8".to_string(), "10.1.0.0/16 nomatch".to_string()]
        );
    }

    #[test]
    fn works_translate_appends_default_deny() {
        let translated = translate_network_policy(&test_network_policy()).unwrap();
        assert_eq!(translated.acls.len(), 2);
        assert_eq!(translated.acls[0].target, PolicyTarget::Allowed);
        assert_eq!(translated.acls[0].ports.len(), 1);
        assert_eq!(translated.acls[0].ports[0].port, Some(8080));
        assert_eq!(translated.acls[1].target, PolicyTarget::Dropped);
        assert!(translated.acls[1].src_sets.is_empty());
    }

    #[test]
    fn works_peer_without_selectors_targets_all_namespaces() {
        let mut policy = test_network_policy();
        policy
            .spec
            .as_mut()
            .unwrap()
            .ingress
            .as_mut()
            .unwrap()[0]
            .from = Some(vec![NetworkPolicyPeer::default()]);
        let translated = translate_network_policy(&policy).unwrap();
        assert!(translated
            .rule_sets
            .iter()
            .any(|s| s.metadata == SetMetadata::all_namespaces()));
    }

    #[tokio::test]
    async fn works_policy_sync_add_then_delete_is_a_noop() {
        let dataplane = Arc::new(HostDataplane::new("testnode", Arc::new(FakeHostPlane::new())));
        let controller = NetworkPolicyController::new(dataplane.clone());
        let policy = test_network_policy();

        controller
            .sync("test-namespace/testpolicy", Some(&policy))
            .await
            .unwrap();
        assert_eq!(dataplane.policy_count(), 1);
        assert!(dataplane.get_set("app:test-pod").unwrap().ref_count == 1);

        controller
            .sync("test-namespace/testpolicy", None)
            .await
            .unwrap();
        assert_eq!(dataplane.policy_count(), 0);
        assert_eq!(dataplane.set_count(), 0);
    }
}
