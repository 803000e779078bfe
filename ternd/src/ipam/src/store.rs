use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use super::error::Error;
use super::record::{IpConfigRecord, IpState, NcBlock, PodInfo};
use super::scaler::PoolCounts;

/// Shared per-IP lifecycle store.
///
/// All state transitions go through the operations below; callers never hold
/// the lock across host or network I/O, they work on the returned clones.
#[derive(Debug, Clone, Default)]
pub struct IpConfigStore {
    inner: Arc<RwLock<IpConfigStoreInner>>,
}

#[derive(Debug, Default)]
struct IpConfigStoreInner {
    records: HashMap<String, IpConfigRecord>,
    // uuid sets per state; BTreeSet so selection is lowest-uuid-first
    by_state: HashMap<IpState, BTreeSet<String>>,
    by_pod: HashMap<String, String>,
}

impl IpConfigStoreInner {
    fn transition(&mut self, id: &str, to: IpState) {
        if let Some(record) = self.records.get_mut(id) {
            let from = record.state;
            record.state = to;
            if let Some(ids) = self.by_state.get_mut(&from) {
                ids.remove(id);
            }
            self.by_state.entry(to).or_default().insert(id.to_string());
        }
    }

    fn insert(&mut self, record: IpConfigRecord) {
        self.by_state
            .entry(record.state)
            .or_default()
            .insert(record.id.clone());
        if let Some(info) = record.pod_info.as_ref() {
            self.by_pod.insert(info.pod_key(), record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> Option<IpConfigRecord> {
        let record = self.records.remove(id)?;
        if let Some(ids) = self.by_state.get_mut(&record.state) {
            ids.remove(id);
        }
        if let Some(info) = record.pod_info.as_ref() {
            self.by_pod.remove(&info.pod_key());
        }
        Some(record)
    }

    fn first_in_state(&self, state: IpState) -> Option<String> {
        self.by_state
            .get(&state)
            .and_then(|ids| ids.iter().next().cloned())
    }

    fn address_in_use(&self, address: &str) -> bool {
        self.records
            .values()
            .any(|r| r.state != IpState::PendingRelease && r.ip_address == address)
    }
}

impl IpConfigStore {
    pub fn new() -> IpConfigStore {
        IpConfigStore::default()
    }

    /// Reserves an `Available` IP for the pod, lowest uuid first.
    ///
    /// Reserving again for a pod that already holds an IP returns the
    /// existing assignment. An empty `Available` set is the caller's signal
    /// that the pool is exhausted; this store never sizes the pool.
    pub fn assign(&self, pod_info: PodInfo) -> Result<IpConfigRecord, Error> {
        let mut inner = self.inner.write().map_err(|_| Error::FailedToGetLock)?;
        let pod_key = pod_info.pod_key();
        if let Some(id) = inner.by_pod.get(&pod_key) {
            let id = id.clone();
            return Ok(inner.records[&id].clone());
        }
        let id = inner
            .first_in_state(IpState::Available)
            .ok_or(Error::PoolExhausted)?;
        inner.transition(&id, IpState::Allocated);
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownRecord(id.clone()))?;
        record.pod_info = Some(pod_info);
        let record = record.clone();
        inner.by_pod.insert(pod_key, id);
        Ok(record)
    }

    /// Returns a pod's IP to the pool. Releasing a pod that holds no IP is
    /// a success and changes nothing.
    pub fn release(&self, pod_key: &str) -> Result<Option<IpConfigRecord>, Error> {
        let mut inner = self.inner.write().map_err(|_| Error::FailedToGetLock)?;
        let id = match inner.by_pod.remove(pod_key) {
            Some(id) => id,
            None => return Ok(None),
        };
        inner.transition(&id, IpState::Available);
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownRecord(id.clone()))?;
        record.pod_info = None;
        Ok(Some(record.clone()))
    }

    /// Moves up to `count` `Available` records to `PendingRelease` so the
    /// pool monitor can hand them back to the cluster allocator. Allocated
    /// records are never touched.
    pub fn mark_pending_release(&self, count: usize) -> Result<Vec<IpConfigRecord>, Error> {
        let mut inner = self.inner.write().map_err(|_| Error::FailedToGetLock)?;
        let mut marked = Vec::new();
        for _ in 0..count {
            let id = match inner.first_in_state(IpState::Available) {
                Some(id) => id,
                None => break,
            };
            inner.transition(&id, IpState::PendingRelease);
            marked.push(inner.records[&id].clone());
        }
        Ok(marked)
    }

    /// Promotes `PendingProgramming` records of a programmed NC to
    /// `Available`. Returns how many were promoted.
    pub fn mark_programmed(&self, nc_id: &str) -> Result<usize, Error> {
        let mut inner = self.inner.write().map_err(|_| Error::FailedToGetLock)?;
        let pending: Vec<String> = inner
            .by_state
            .get(&IpState::PendingProgramming)
            .map(|ids| {
                ids.iter()
                    .filter(|id| inner.records[*id].nc_id == nc_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for id in &pending {
            inner.transition(id, IpState::Available);
        }
        Ok(pending.len())
    }

    /// Merges the cluster-announced truth from NNC status.
    ///
    /// New IPs appear as `PendingProgramming`. IPs that vanished from the
    /// announcement are destroyed only if they were `PendingRelease`; a
    /// vanished IP in any other state means the node and the cluster
    /// disagree about an address a pod may still be using, which is fatal.
    pub fn reconcile_from_nnc(&self, blocks: &[NcBlock]) -> Result<(), Error> {
        let mut inner = self.inner.write().map_err(|_| Error::FailedToGetLock)?;

        let mut announced: HashMap<&str, (&str, &str)> = HashMap::new();
        for block in blocks {
            for (id, address) in &block.ips {
                announced.insert(id.as_str(), (block.id.as_str(), address.as_str()));
            }
        }

        // Validate before mutating so a fatal inconsistency leaves the
        // store untouched for inspection.
        for id in inner.records.keys() {
            if announced.contains_key(id.as_str()) {
                continue;
            }
            let record = &inner.records[id];
            if record.state != IpState::PendingRelease {
                return Err(Error::InconsistentState(format!(
                    "IP {} ({}) disappeared from NNC while {}",
                    record.ip_address, record.id, record.state
                )));
            }
        }
        for (&id, &(_, address)) in &announced {
            match inner.records.get(id) {
                Some(record) => {
                    if record.ip_address != address && record.state == IpState::Allocated {
                        return Err(Error::InconsistentState(format!(
                            "announced address {} for allocated IP {} ({})",
                            address, record.ip_address, record.id
                        )));
                    }
                }
                None => {
                    if inner.address_in_use(address) {
                        return Err(Error::DuplicateAddress(address.to_string()));
                    }
                }
            }
        }

        let removed: Vec<String> = inner
            .records
            .keys()
            .filter(|id| !announced.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            tracing::info!(id = id, "Destroy released IP");
            inner.remove(&id);
        }

        for (id, (nc_id, address)) in announced {
            match inner.records.get_mut(id) {
                Some(record) => {
                    // NNC wins for IP identity, the store wins for state.
                    record.nc_id = nc_id.to_string();
                    record.ip_address = address.to_string();
                }
                None => {
                    inner.insert(IpConfigRecord::pending(nc_id, id, address));
                }
            }
        }

        Ok(())
    }

    /// Replaces the whole store with records loaded from disk.
    pub fn replace_all(&self, records: Vec<IpConfigRecord>) -> Result<(), Error> {
        for record in &records {
            let allocated = record.state == IpState::Allocated;
            if allocated != record.pod_info.is_some() {
                return Err(Error::InconsistentState(format!(
                    "loaded record {} is {} with pod info {:?}",
                    record.id, record.state, record.pod_info
                )));
            }
        }
        let mut inner = self.inner.write().map_err(|_| Error::FailedToGetLock)?;
        inner.records.clear();
        inner.by_state.clear();
        inner.by_pod.clear();
        for record in records {
            if inner.records.contains_key(&record.id) {
                return Err(Error::DuplicateAddress(record.ip_address));
            }
            inner.insert(record);
        }
        Ok(())
    }

    pub fn counts(&self) -> Result<PoolCounts, Error> {
        let inner = self.inner.read().map_err(|_| Error::FailedToGetLock)?;
        let count = |state: IpState| -> i64 {
            inner
                .by_state
                .get(&state)
                .map(|ids| ids.len() as i64)
                .unwrap_or(0)
        };
        Ok(PoolCounts {
            available: count(IpState::Available),
            allocated: count(IpState::Allocated),
            pending_programming: count(IpState::PendingProgramming),
            pending_release: count(IpState::PendingRelease),
        })
    }

    /// Records currently in `state`, ordered by uuid.
    pub fn records_in_state(&self, state: IpState) -> Result<Vec<IpConfigRecord>, Error> {
        let inner = self.inner.read().map_err(|_| Error::FailedToGetLock)?;
        Ok(inner
            .by_state
            .get(&state)
            .map(|ids| ids.iter().map(|id| inner.records[id].clone()).collect())
            .unwrap_or_default())
    }

    /// Full per-uuid snapshot, for the diagnostic surface and persistence.
    pub fn snapshot(&self) -> Result<HashMap<String, IpConfigRecord>, Error> {
        let inner = self.inner.read().map_err(|_| Error::FailedToGetLock)?;
        Ok(inner.records.clone())
    }

    pub fn get_by_pod(&self, pod_key: &str) -> Result<Option<IpConfigRecord>, Error> {
        let inner = self.inner.read().map_err(|_| Error::FailedToGetLock)?;
        Ok(inner
            .by_pod
            .get(pod_key)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn block(id: &str, ips: &[(&str, &str)]) -> NcBlock {
        NcBlock {
            id: id.to_string(),
            subnet: "10.240.0.0/16".to_string(),
            version: 1,
            ips: ips
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<String, String>>(),
        }
    }

    fn seeded_store() -> IpConfigStore {
        let store = IpConfigStore::new();
        store
            .reconcile_from_nnc(&[block(
                "nc-1",
                &[
                    ("aaa-1", "10.240.0.4"),
                    ("bbb-2", "10.240.0.5"),
                    ("ccc-3", "10.240.0.6"),
                ],
            )])
            .unwrap();
        store.mark_programmed("nc-1").unwrap();
        store
    }

    #[test]
    fn works_new_ips_start_pending_programming() {
        let store = IpConfigStore::new();
        store
            .reconcile_from_nnc(&[block("nc-1", &[("aaa-1", "10.240.0.4")])])
            .unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.pending_programming, 1);
        assert_eq!(counts.available, 0);
    }

    #[test]
    fn works_assign_picks_lowest_uuid() {
        let store = seeded_store();
        let record = store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        assert_eq!(record.id, "aaa-1");
        assert_eq!(record.state, IpState::Allocated);
        assert_eq!(
            record.pod_info,
            Some(PodInfo::new("test-namespace", "test-pod"))
        );
    }

    #[test]
    fn works_assign_is_idempotent_per_pod() {
        let store = seeded_store();
        let first = store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        let second = store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.counts().unwrap().allocated, 1);
    }

    #[test]
    fn fails_assign_when_exhausted() {
        let store = seeded_store();
        for i in 0..3 {
            store
                .assign(PodInfo::new("test-namespace", &format!("pod-{i}")))
                .unwrap();
        }
        let err = store
            .assign(PodInfo::new("test-namespace", "one-too-many"))
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
    }

    #[test]
    fn works_release_returns_ip_to_pool() {
        let store = seeded_store();
        store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        let released = store.release("test-namespace/test-pod").unwrap().unwrap();
        assert_eq!(released.state, IpState::Available);
        assert!(released.pod_info.is_none());
        assert_eq!(store.counts().unwrap().available, 3);
    }

    #[test]
    fn works_release_unknown_pod_is_a_noop() {
        let store = seeded_store();
        assert!(store.release("test-namespace/who").unwrap().is_none());
        assert_eq!(store.counts().unwrap().available, 3);
    }

    #[test]
    fn works_mark_pending_release_skips_allocated() {
        let store = seeded_store();
        store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        let marked = store.mark_pending_release(16).unwrap();
        assert_eq!(marked.len(), 2);
        let counts = store.counts().unwrap();
        assert_eq!(counts.pending_release, 2);
        assert_eq!(counts.allocated, 1);
        assert_eq!(counts.available, 0);
    }

    #[test]
    fn works_reconcile_destroys_pending_release() {
        let store = seeded_store();
        store.mark_pending_release(1).unwrap();
        // "aaa-1" was marked; the cluster then removed it from the NNC.
        store
            .reconcile_from_nnc(&[block(
                "nc-1",
                &[("bbb-2", "10.240.0.5"), ("ccc-3", "10.240.0.6")],
            )])
            .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.counts().unwrap().pending_release, 0);
    }

    #[test]
    fn fails_reconcile_when_inuse_ip_disappears() {
        let store = seeded_store();
        store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        let err = store
            .reconcile_from_nnc(&[block(
                "nc-1",
                &[("bbb-2", "10.240.0.5"), ("ccc-3", "10.240.0.6")],
            )])
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));
        // Nothing was destroyed.
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn works_allocated_invariant_holds_after_every_transition() {
        let store = seeded_store();
        store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();
        store.release("test-namespace/test-pod").unwrap();
        store.mark_pending_release(1).unwrap();
        for record in store.snapshot().unwrap().values() {
            assert_eq!(
                record.state == IpState::Allocated,
                record.pod_info.is_some(),
                "{record}"
            );
        }
    }

    #[test]
    fn fails_replace_all_on_broken_invariant() {
        let store = IpConfigStore::new();
        let mut record = IpConfigRecord::pending("nc-1", "aaa-1", "10.240.0.4");
        record.state = IpState::Allocated;
        let err = store.replace_all(vec![record]).unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));
    }
}
