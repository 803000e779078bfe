use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{reflector, reflector::ObjectRef, watcher},
    Api, Client, ResourceExt,
};
use serde::Serialize;

use ternd_npm::dataplane::{Dataplane, PodMetadata};
use ternd_npm::ipsets::{SetKind, SetMetadata};

use crate::agent::error::Error;
use crate::agent::reconciler::namespace::{ensure_namespace, NamespaceCache};
use crate::agent::workqueue::WorkQueue;
use crate::util::diff;

const PHASE_SUCCEEDED: &str = "Succeeded";
const PHASE_FAILED: &str = "Failed";

/// A named container port flattened out of the pod spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedPort {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Port")]
    pub port: i32,
}

/// Cached view of one live pod: exactly the state currently reflected in
/// ip-sets. The delta between this and the next observed pod object drives
/// every set mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NpmPod {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "PodIP")]
    pub pod_ip: String,
    #[serde(rename = "Labels")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "ContainerPorts")]
    pub container_ports: Vec<NamedPort>,
    #[serde(rename = "Phase")]
    pub phase: String,
}

impl NpmPod {
    fn from_pod(pod: &Pod) -> NpmPod {
        NpmPod {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_default(),
            pod_ip: pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            labels: pod.labels().clone(),
            container_ports: named_ports(pod),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
        }
    }
}

fn named_ports(pod: &Pod) -> Vec<NamedPort> {
    let mut ports = Vec::new();
    if let Some(spec) = pod.spec.as_ref() {
        for container in &spec.containers {
            for port in container.ports.iter().flatten() {
                if let Some(name) = port.name.as_ref().filter(|n| !n.is_empty()) {
                    ports.push(NamedPort {
                        name: name.clone(),
                        port: port.container_port,
                    });
                }
            }
        }
    }
    ports
}

/// Label sets a pod belongs to: one per label key and one per key:value.
fn pod_label_metas(labels: &BTreeMap<String, String>) -> Vec<SetMetadata> {
    let mut metas = Vec::new();
    for (key, value) in labels {
        metas.push(SetMetadata::new(key, SetKind::KeyLabelOfPod));
        metas.push(SetMetadata::new(
            &format!("{key}:{value}"),
            SetKind::KeyValueLabelOfPod,
        ));
    }
    metas
}

pub struct PodController {
    dataplane: Arc<dyn Dataplane>,
    namespace_cache: Arc<NamespaceCache>,
    pod_map: Mutex<HashMap<String, NpmPod>>,
    workqueue: WorkQueue<String>,
}

impl PodController {
    pub fn new(dataplane: Arc<dyn Dataplane>, namespace_cache: Arc<NamespaceCache>) -> PodController {
        PodController {
            dataplane,
            namespace_cache,
            pod_map: Mutex::new(HashMap::new()),
            workqueue: WorkQueue::new(),
        }
    }

    pub fn workqueue(&self) -> &WorkQueue<String> {
        &self.workqueue
    }

    pub fn pod_count(&self) -> usize {
        self.pod_map.lock().unwrap().len()
    }

    pub fn get_pod(&self, key: &str) -> Option<NpmPod> {
        self.pod_map.lock().unwrap().get(key).cloned()
    }

    /// Diagnostic JSON of the pod cache.
    pub fn marshal_pods(&self) -> Result<String, Error> {
        let pods: BTreeMap<String, NpmPod> = self
            .pod_map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::to_string(&pods).map_err(Error::Serialization)
    }

    /// Pods with no IP, on the host network, or already out of a running
    /// phase never make it into ip-sets.
    fn is_eligible(pod: &Pod) -> bool {
        let host_network = pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false);
        if host_network {
            return false;
        }
        let status = match pod.status.as_ref() {
            Some(status) => status,
            None => return false,
        };
        if status.pod_ip.as_deref().unwrap_or("").is_empty() {
            return false;
        }
        !matches!(
            status.phase.as_deref(),
            Some(PHASE_SUCCEEDED) | Some(PHASE_FAILED)
        )
    }

    /// One reconcile pass for a pod key against the current object
    /// snapshot. Every transition of the pod cache happens here and only
    /// here.
    #[tracing::instrument(skip_all, fields(pod = key))]
    pub async fn sync(&self, key: &str, pod: Option<&Pod>) -> Result<(), Error> {
        let changed = match pod {
            Some(pod) if Self::is_eligible(pod) => self.sync_live_pod(key, pod)?,
            // deleted, terminal, host-network or IP-less: converge on absence
            _ => self.clean_up_deleted_pod(key)?,
        };
        if changed {
            self.dataplane
                .apply_dataplane()
                .await
                .map_err(Error::Dataplane)?;
        }
        Ok(())
    }

    fn sync_live_pod(&self, key: &str, pod: &Pod) -> Result<bool, Error> {
        let new_pod = NpmPod::from_pod(pod);
        let cached = self.pod_map.lock().unwrap().get(key).cloned();
        match cached {
            None => {
                tracing::info!(pod = key, ip = new_pod.pod_ip, "Add pod");
                self.add_pod_to_sets(key, &new_pod)?;
                self.pod_map
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), new_pod);
                Ok(true)
            }
            Some(cached) if cached.pod_ip != new_pod.pod_ip => {
                // no in-place rewrite: out with the old address everywhere,
                // then in with the new one
                tracing::info!(
                    pod = key,
                    old_ip = cached.pod_ip,
                    new_ip = new_pod.pod_ip,
                    "Pod changed IP"
                );
                self.remove_pod_from_sets(key, &cached, false)?;
                self.add_pod_to_sets(key, &new_pod)?;
                self.pod_map
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), new_pod);
                Ok(true)
            }
            Some(cached) => self.update_pod_in_sets(key, &cached, new_pod),
        }
    }

    fn add_pod_to_sets(&self, key: &str, pod: &NpmPod) -> Result<(), Error> {
        ensure_namespace(&self.namespace_cache, self.dataplane.as_ref(), &pod.namespace)?;

        let pod_meta = PodMetadata::new(key, &pod.pod_ip, "");
        self.dataplane
            .add_to_sets(
                &[SetMetadata::new(&pod.namespace, SetKind::Namespace)],
                &pod_meta,
            )
            .map_err(Error::Dataplane)?;

        let label_metas = pod_label_metas(&pod.labels);
        if !label_metas.is_empty() {
            self.dataplane
                .add_to_sets(&label_metas, &pod_meta)
                .map_err(Error::Dataplane)?;
        }

        for port in &pod.container_ports {
            self.dataplane
                .add_to_sets(
                    &[SetMetadata::new(&port.name, SetKind::NamedPorts)],
                    &PodMetadata::new(key, &format!("{},{}", pod.pod_ip, port.port), ""),
                )
                .map_err(Error::Dataplane)?;
        }
        Ok(())
    }

    fn update_pod_in_sets(&self, key: &str, cached: &NpmPod, new_pod: NpmPod) -> Result<bool, Error> {
        let pod_meta = PodMetadata::new(key, &cached.pod_ip, "");
        let mut changed = false;

        let (added, _, removed) = diff(
            &pod_label_metas(&cached.labels),
            &pod_label_metas(&new_pod.labels),
        );
        if !removed.is_empty() {
            self.dataplane
                .remove_from_sets(&removed, &pod_meta)
                .map_err(Error::Dataplane)?;
            for meta in &removed {
                self.dataplane.delete_ip_set(meta).map_err(Error::Dataplane)?;
            }
            changed = true;
        }
        if !added.is_empty() {
            self.dataplane
                .add_to_sets(&added, &pod_meta)
                .map_err(Error::Dataplane)?;
            changed = true;
        }

        let (added_ports, _, removed_ports) =
            diff(&cached.container_ports, &new_pod.container_ports);
        for port in &removed_ports {
            let meta = SetMetadata::new(&port.name, SetKind::NamedPorts);
            self.dataplane
                .remove_from_sets(
                    &[meta.clone()],
                    &PodMetadata::new(key, &format!("{},{}", cached.pod_ip, port.port), ""),
                )
                .map_err(Error::Dataplane)?;
            self.dataplane.delete_ip_set(&meta).map_err(Error::Dataplane)?;
            changed = true;
        }
        for port in &added_ports {
            self.dataplane
                .add_to_sets(
                    &[SetMetadata::new(&port.name, SetKind::NamedPorts)],
                    &PodMetadata::new(key, &format!("{},{}", cached.pod_ip, port.port), ""),
                )
                .map_err(Error::Dataplane)?;
            changed = true;
        }

        if changed || *cached != new_pod {
            self.pod_map
                .lock()
                .unwrap()
                .insert(key.to_string(), new_pod);
        }
        Ok(changed)
    }

    fn remove_pod_from_sets(
        &self,
        key: &str,
        cached: &NpmPod,
        delete_sets: bool,
    ) -> Result<(), Error> {
        let pod_meta = PodMetadata::new(key, &cached.pod_ip, "");
        self.dataplane
            .remove_from_sets(
                &[SetMetadata::new(&cached.namespace, SetKind::Namespace)],
                &pod_meta,
            )
            .map_err(Error::Dataplane)?;

        let label_metas = pod_label_metas(&cached.labels);
        if !label_metas.is_empty() {
            self.dataplane
                .remove_from_sets(&label_metas, &pod_meta)
                .map_err(Error::Dataplane)?;
        }

        for port in &cached.container_ports {
            self.dataplane
                .remove_from_sets(
                    &[SetMetadata::new(&port.name, SetKind::NamedPorts)],
                    &PodMetadata::new(key, &format!("{},{}", cached.pod_ip, port.port), ""),
                )
                .map_err(Error::Dataplane)?;
        }

        if delete_sets {
            for meta in label_metas {
                self.dataplane.delete_ip_set(&meta).map_err(Error::Dataplane)?;
            }
            for port in &cached.container_ports {
                self.dataplane
                    .delete_ip_set(&SetMetadata::new(&port.name, SetKind::NamedPorts))
                    .map_err(Error::Dataplane)?;
            }
        }
        Ok(())
    }

    /// Handles deletes, including tombstones: everything is keyed off the
    /// cache, so a key that was never cached is a clean no-op.
    fn clean_up_deleted_pod(&self, key: &str) -> Result<bool, Error> {
        let cached = self.pod_map.lock().unwrap().remove(key);
        match cached {
            None => Ok(false),
            Some(cached) => {
                tracing::info!(pod = key, ip = cached.pod_ip, "Delete pod");
                self.remove_pod_from_sets(key, &cached, true)?;
                Ok(true)
            }
        }
    }
}

fn pod_key(pod: &Pod) -> String {
    crate::util::get_namespaced_name(pod)
}

fn object_ref(key: &str) -> ObjectRef<Pod> {
    match key.split_once('/') {
        Some((namespace, name)) => ObjectRef::new(name).within(namespace),
        None => ObjectRef::new(key),
    }
}

pub async fn run(controller: Arc<PodController>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let pods = Api::<Pod>::all(client);
    let (reader, writer) = reflector::store::<Pod>();
    let stream = reflector(writer, watcher(pods, watcher::Config::default()));

    tracing::info!("Start Pod reconciler");

    let worker = controller.clone();
    let worker_reader = reader.clone();
    tokio::spawn(async move {
        while let Some(key) = worker.workqueue().get().await {
            let pod = worker_reader.get(&object_ref(&key));
            if let Err(e) = worker.sync(&key, pod.as_deref()).await {
                tracing::warn!(pod = key, error = ?e, "Failed to reconcile Pod");
            }
            worker.workqueue().done(&key);
        }
    });

    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pod)) => controller.workqueue().add(pod_key(&pod)),
            Ok(watcher::Event::Deleted(pod)) => controller.workqueue().add(pod_key(&pod)),
            Ok(watcher::Event::Restarted(pods)) => {
                for pod in pods {
                    controller.workqueue().add(pod_key(&pod));
                }
            }
            Err(e) => tracing::warn!(error = ?e, "Pod watch error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use kube::core::ObjectMeta;
    use ternd_npm::dataplane::HostDataplane;
    use ternd_npm::shim::FakeHostPlane;

    const HOST_NETWORK: bool = true;
    const NON_HOST_NETWORK: bool = false;

    fn create_pod(
        name: &str,
        namespace: &str,
        pod_ip: &str,
        labels: &[(&str, &str)],
        host_network: bool,
        phase: &str,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                containers: vec![Container {
                    name: "main".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some(format!("app:{name}")),
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some(pod_ip.to_string()),
                ..Default::default()
            }),
        }
    }

    struct Fixture {
        controller: PodController,
        dataplane: Arc<HostDataplane>,
        plane: Arc<FakeHostPlane>,
    }

    fn new_fixture() -> Fixture {
        let plane = Arc::new(FakeHostPlane::new());
        let dataplane = Arc::new(HostDataplane::new("testnode", plane.clone()));
        let controller = PodController::new(dataplane.clone(), Arc::new(NamespaceCache::default()));
        Fixture {
            controller,
            dataplane,
            plane,
        }
    }

    fn members(dataplane: &HostDataplane, set: &str) -> Vec<String> {
        dataplane
            .get_set(set)
            .map(|s| s.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn works_add_multiple_pods_with_same_labels() {
        let f = new_fixture();
        let labels = [("app", "test-pod")];
        let pod1 = create_pod(
            "test-pod-1",
            "test-namespace",
            "1.2.3.4",
            &labels,
            NON_HOST_NETWORK,
            "Running",
        );
        let pod2 = create_pod(
            "test-pod-2",
            "test-namespace",
            "1.2.3.5",
            &labels,
            NON_HOST_NETWORK,
            "Running",
        );

        f.controller
            .sync("test-namespace/test-pod-1", Some(&pod1))
            .await
            .unwrap();
        f.controller
            .sync("test-namespace/test-pod-2", Some(&pod2))
            .await
            .unwrap();

        assert_eq!(
            members(&f.dataplane, "test-namespace"),
            vec!["1.2.3.4", "1.2.3.5"]
        );
        assert_eq!(members(&f.dataplane, "app"), vec!["1.2.3.4", "1.2.3.5"]);
        assert_eq!(
            members(&f.dataplane, "app:test-pod"),
            vec!["1.2.3.4", "1.2.3.5"]
        );
        assert_eq!(
            members(&f.dataplane, "namedport:app:test-pod-1"),
            vec!["1.2.3.4,8080"]
        );
        assert_eq!(
            members(&f.dataplane, "namedport:app:test-pod-2"),
            vec!["1.2.3.5,8080"]
        );
        assert!(f
            .dataplane
            .get_set("all-namespaces")
            .unwrap()
            .member_sets
            .contains("test-namespace"));
        assert_eq!(f.controller.pod_count(), 2);
        assert_eq!(
            f.controller
                .get_pod("test-namespace/test-pod-1")
                .unwrap()
                .pod_ip,
            "1.2.3.4"
        );
    }

    #[tokio::test]
    async fn works_host_network_pod_has_no_side_effects() {
        let f = new_fixture();
        let pod = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            HOST_NETWORK,
            "Running",
        );

        f.controller
            .sync("test-namespace/test-pod", Some(&pod))
            .await
            .unwrap();

        assert_eq!(f.controller.pod_count(), 0);
        assert_eq!(f.dataplane.set_count(), 0);
        assert!(f.plane.calls().is_empty());

        // and the delete of the same pod is just as quiet
        f.controller
            .sync("test-namespace/test-pod", None)
            .await
            .unwrap();
        assert!(f.plane.calls().is_empty());
    }

    #[tokio::test]
    async fn works_add_then_delete_restores_set_state() {
        let f = new_fixture();
        let pod = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );

        f.controller
            .sync("test-namespace/test-pod", Some(&pod))
            .await
            .unwrap();
        f.controller
            .sync("test-namespace/test-pod", None)
            .await
            .unwrap();

        assert_eq!(f.controller.pod_count(), 0);
        assert!(f.dataplane.get_set("app").is_none());
        assert!(f.dataplane.get_set("app:test-pod").is_none());
        assert!(f.dataplane.get_set("namedport:app:test-pod").is_none());
        // the namespace outlives its pods
        assert_eq!(members(&f.dataplane, "test-namespace"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn works_tombstone_without_prior_add_is_a_noop() {
        let f = new_fixture();
        f.controller
            .sync("test-namespace/test-pod", None)
            .await
            .unwrap();
        assert_eq!(f.controller.pod_count(), 0);
        assert!(f.plane.calls().is_empty());
    }

    #[tokio::test]
    async fn works_label_update_moves_value_sets() {
        let f = new_fixture();
        let old_pod = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );
        let new_pod = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "new-test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );

        f.controller
            .sync("test-namespace/test-pod", Some(&old_pod))
            .await
            .unwrap();
        f.controller
            .sync("test-namespace/test-pod", Some(&new_pod))
            .await
            .unwrap();

        assert!(f.dataplane.get_set("app:test-pod").is_none());
        assert_eq!(members(&f.dataplane, "app:new-test-pod"), vec!["1.2.3.4"]);
        assert_eq!(members(&f.dataplane, "app"), vec!["1.2.3.4"]);
        assert_eq!(members(&f.dataplane, "test-namespace"), vec!["1.2.3.4"]);
        assert_eq!(
            f.controller
                .get_pod("test-namespace/test-pod")
                .unwrap()
                .labels["app"],
            "new-test-pod"
        );
    }

    #[tokio::test]
    async fn works_ip_update_is_full_remove_then_full_add() {
        let f = new_fixture();
        let old_pod = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );
        let new_pod = create_pod(
            "test-pod",
            "test-namespace",
            "4.3.2.1",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );

        f.controller
            .sync("test-namespace/test-pod", Some(&old_pod))
            .await
            .unwrap();
        f.controller
            .sync("test-namespace/test-pod", Some(&new_pod))
            .await
            .unwrap();

        assert_eq!(members(&f.dataplane, "test-namespace"), vec!["4.3.2.1"]);
        assert_eq!(members(&f.dataplane, "app"), vec!["4.3.2.1"]);
        assert_eq!(members(&f.dataplane, "app:test-pod"), vec!["4.3.2.1"]);
        assert_eq!(
            members(&f.dataplane, "namedport:app:test-pod"),
            vec!["4.3.2.1,8080"]
        );
        assert_eq!(
            f.controller
                .get_pod("test-namespace/test-pod")
                .unwrap()
                .pod_ip,
            "4.3.2.1"
        );
    }

    #[tokio::test]
    async fn works_succeeded_phase_equals_delete() {
        let f = new_fixture();
        let running = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );
        let succeeded = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Succeeded",
        );

        f.controller
            .sync("test-namespace/test-pod", Some(&running))
            .await
            .unwrap();
        f.controller
            .sync("test-namespace/test-pod", Some(&succeeded))
            .await
            .unwrap();

        assert_eq!(f.controller.pod_count(), 0);
        assert!(f.dataplane.get_set("app").is_none());
        assert_eq!(members(&f.dataplane, "test-namespace"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn works_pod_map_marshals_to_json() {
        let f = new_fixture();
        let pod = create_pod(
            "test-pod",
            "test-namespace",
            "1.2.3.4",
            &[("app", "test-pod")],
            NON_HOST_NETWORK,
            "Running",
        );
        f.controller
            .sync("test-namespace/test-pod", Some(&pod))
            .await
            .unwrap();

        let raw = f.controller.marshal_pods().unwrap();
        let expected = r#"{"test-namespace/test-pod":{"Name":"test-pod","Namespace":"test-namespace","PodIP":"1.2.3.4","Labels":{"app":"test-pod"},"ContainerPorts":[{"Name":"app:test-pod","Port":8080}],"Phase":"Running"}}"#;
        assert_eq!(raw, expected);
    }
}
