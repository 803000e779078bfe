use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    runtime::{reflector, reflector::ObjectRef, watcher},
    Api, Client, ResourceExt,
};

use ternd_npm::dataplane::Dataplane;
use ternd_npm::ipsets::{SetKind, SetMetadata};

use crate::agent::error::Error;
use crate::agent::workqueue::WorkQueue;

/// Namespaces currently reflected in ip-sets, with the label snapshot the
/// sets were built from. Shared with the pod controller, which must ensure
/// a namespace entry before it caches the first pod of that namespace.
#[derive(Debug, Default)]
pub struct NamespaceCache {
    inner: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl NamespaceCache {
    pub fn get(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, name: &str, labels: BTreeMap<String, String>) {
        self.inner.lock().unwrap().insert(name.to_string(), labels);
    }

    pub fn remove(&self, name: &str) {
        self.inner.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates the namespace set and links it into the all-namespaces list the
/// first time the namespace shows up, from either controller.
pub fn ensure_namespace(
    cache: &NamespaceCache,
    dataplane: &dyn Dataplane,
    namespace: &str,
) -> Result<bool, Error> {
    if cache.contains(namespace) {
        return Ok(false);
    }
    let ns_meta = SetMetadata::new(namespace, SetKind::Namespace);
    dataplane
        .add_to_lists(&[SetMetadata::all_namespaces()], &[ns_meta])
        .map_err(Error::Dataplane)?;
    cache.insert(namespace, BTreeMap::new());
    Ok(true)
}

/// List sets a namespace belongs to for its labels.
fn label_list_metas(labels: &BTreeMap<String, String>) -> Vec<SetMetadata> {
    let mut metas = Vec::new();
    for (key, value) in labels {
        metas.push(SetMetadata::new(key, SetKind::KeyLabelOfNamespace));
        metas.push(SetMetadata::new(
            &format!("{key}:{value}"),
            SetKind::KeyValueLabelOfNamespace,
        ));
    }
    metas
}

pub struct NamespaceController {
    dataplane: Arc<dyn Dataplane>,
    cache: Arc<NamespaceCache>,
    workqueue: WorkQueue<String>,
}

impl NamespaceController {
    pub fn new(dataplane: Arc<dyn Dataplane>, cache: Arc<NamespaceCache>) -> NamespaceController {
        NamespaceController {
            dataplane,
            cache,
            workqueue: WorkQueue::new(),
        }
    }

    pub fn workqueue(&self) -> &WorkQueue<String> {
        &self.workqueue
    }

    #[tracing::instrument(skip_all, fields(namespace = key))]
    pub async fn sync(&self, key: &str, namespace: Option<&Namespace>) -> Result<(), Error> {
        let cached = self.cache.get(key);
        let changed = match (namespace, cached) {
            (None, None) => false,
            (None, Some(labels)) => {
                self.clean_up_namespace(key, &labels)?;
                true
            }
            (Some(namespace), None) => {
                self.add_namespace(key, namespace)?;
                true
            }
            (Some(namespace), Some(old_labels)) => self.update_namespace(key, namespace, &old_labels)?,
        };
        if changed {
            self.dataplane
                .apply_dataplane()
                .await
                .map_err(Error::Dataplane)?;
        }
        Ok(())
    }

    fn add_namespace(&self, key: &str, namespace: &Namespace) -> Result<(), Error> {
        tracing::info!(namespace = key, "Add namespace");
        ensure_namespace(&self.cache, self.dataplane.as_ref(), key)?;
        let labels = namespace.labels().clone();
        let lists = label_list_metas(&labels);
        if !lists.is_empty() {
            self.dataplane
                .add_to_lists(&lists, &[SetMetadata::new(key, SetKind::Namespace)])
                .map_err(Error::Dataplane)?;
        }
        self.cache.insert(key, labels);
        Ok(())
    }

    fn update_namespace(
        &self,
        key: &str,
        namespace: &Namespace,
        old_labels: &BTreeMap<String, String>,
    ) -> Result<bool, Error> {
        let new_labels = namespace.labels().clone();
        if new_labels == *old_labels {
            return Ok(false);
        }
        let ns_meta = SetMetadata::new(key, SetKind::Namespace);
        let (added, _, removed) = crate::util::diff(
            &label_list_metas(old_labels),
            &label_list_metas(&new_labels),
        );
        if !removed.is_empty() {
            self.dataplane
                .remove_from_lists(&removed, &[ns_meta.clone()])
                .map_err(Error::Dataplane)?;
        }
        if !added.is_empty() {
            self.dataplane
                .add_to_lists(&added, &[ns_meta])
                .map_err(Error::Dataplane)?;
        }
        self.cache.insert(key, new_labels);
        Ok(true)
    }

    /// The namespace set leaves every list it is a member of before it is
    /// destroyed, so no list ever references a vanished set.
    fn clean_up_namespace(
        &self,
        key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        tracing::info!(namespace = key, "Delete namespace");
        let ns_meta = SetMetadata::new(key, SetKind::Namespace);
        let mut lists = label_list_metas(labels);
        lists.push(SetMetadata::all_namespaces());
        self.dataplane
            .remove_from_lists(&lists, &[ns_meta.clone()])
            .map_err(Error::Dataplane)?;
        for list in label_list_metas(labels) {
            self.dataplane
                .delete_ip_set(&list)
                .map_err(Error::Dataplane)?;
        }
        self.dataplane
            .delete_ip_set(&ns_meta)
            .map_err(Error::Dataplane)?;
        self.cache.remove(key);
        Ok(())
    }
}

pub async fn run(controller: Arc<NamespaceController>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let namespaces = Api::<Namespace>::all(client);
    let (reader, writer) = reflector::store::<Namespace>();
    let stream = reflector(writer, watcher(namespaces, watcher::Config::default()));

    tracing::info!("Start Namespace reconciler");

    let worker = controller.clone();
    let worker_reader = reader.clone();
    tokio::spawn(async move {
        while let Some(key) = worker.workqueue().get().await {
            let namespace = worker_reader.get(&ObjectRef::new(&key));
            if let Err(e) = worker.sync(&key, namespace.as_deref()).await {
                tracing::warn!(namespace = key, error = ?e, "Failed to reconcile Namespace");
            }
            worker.workqueue().done(&key);
        }
    });

    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(namespace)) => {
                controller.workqueue().add(namespace.name_any())
            }
            Ok(watcher::Event::Deleted(namespace)) => {
                controller.workqueue().add(namespace.name_any())
            }
            Ok(watcher::Event::Restarted(namespaces)) => {
                for namespace in namespaces {
                    controller.workqueue().add(namespace.name_any());
                }
            }
            Err(e) => tracing::warn!(error = ?e, "Namespace watch error"),
        }
    }
}
