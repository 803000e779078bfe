use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The list holding one member set per live namespace.
pub const ALL_NAMESPACES: &str = "all-namespaces";

/// Prefix stamped on every set name the dataplane materializes on the host,
/// so a reset can find and destroy exactly our sets.
pub const SET_PREFIX: &str = "ternd-";

/// Named-port sets share their name with label sets ("app:web" can be both
/// a key:value label and a port name), so they live under their own prefix
/// in the store and on the host.
const NAMED_PORT_PREFIX: &str = "namedport:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SetKind {
    Namespace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NamedPorts,
    NestedLabelOfPod,
    CidrBlocks,
    KeyLabelOfNamespace,
    KeyValueLabelOfNamespace,
}

impl SetKind {
    /// List kinds hold other sets as members instead of addresses.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            SetKind::NestedLabelOfPod
                | SetKind::KeyLabelOfNamespace
                | SetKind::KeyValueLabelOfNamespace
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetMetadata {
    pub name: String,
    pub kind: SetKind,
}

impl SetMetadata {
    pub fn new(name: &str, kind: SetKind) -> SetMetadata {
        SetMetadata {
            name: name.to_string(),
            kind,
        }
    }

    pub fn all_namespaces() -> SetMetadata {
        SetMetadata::new(ALL_NAMESPACES, SetKind::KeyLabelOfNamespace)
    }

    /// Unique key of the set in the store and in list memberships.
    pub fn store_name(&self) -> String {
        match self.kind {
            SetKind::NamedPorts => format!("{NAMED_PORT_PREFIX}{}", self.name),
            _ => self.name.clone(),
        }
    }

    pub fn host_name(&self) -> String {
        format!("{SET_PREFIX}{}", self.store_name())
    }
}

#[derive(Debug, Clone)]
pub struct IpSet {
    pub metadata: SetMetadata,
    /// IPs, `ip,port` tuples or `cidr [nomatch]` entries, depending on kind.
    pub members: BTreeSet<String>,
    /// Child set store-names, list kinds only.
    pub member_sets: BTreeSet<String>,
    /// Number of policies referencing this set.
    pub ref_count: usize,
    pub dirty: bool,
    pub pending_delete: bool,
    /// Bumped on every mutation; lets the applier clear dirty flags only
    /// for the exact state it flushed.
    pub version: u64,
    /// Whether the last flush materialized this set on the host.
    pub on_host: bool,
}

impl IpSet {
    fn new(metadata: SetMetadata) -> IpSet {
        IpSet {
            metadata,
            members: BTreeSet::new(),
            member_sets: BTreeSet::new(),
            ref_count: 0,
            dirty: true,
            pending_delete: false,
            version: 0,
            on_host: false,
        }
    }

    /// A set may be destroyed only when no policy references it and no pod
    /// membership remains.
    pub fn is_deletable(&self) -> bool {
        self.ref_count == 0 && self.members.is_empty() && self.member_sets.is_empty()
    }

    /// Whether the host should carry this set at all.
    pub fn should_exist_on_host(&self) -> bool {
        self.ref_count > 0 || !self.members.is_empty() || !self.member_sets.is_empty()
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.version += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct DeletedSet {
    on_host: bool,
    is_list: bool,
}

/// In-memory registry of every set the node knows about. Store-name→set is
/// bijective: a name can never be reused with another kind.
#[derive(Debug, Default)]
pub struct IpSetStore {
    sets: HashMap<String, IpSet>,
    /// Sets removed since the last flush; the ones the host carried need an
    /// explicit destroy.
    deleted: HashMap<String, DeletedSet>,
}

impl IpSetStore {
    pub fn new() -> IpSetStore {
        IpSetStore::default()
    }

    pub fn get(&self, store_name: &str) -> Option<&IpSet> {
        self.sets.get(store_name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn create_or_get(&mut self, metadata: &SetMetadata) -> Result<&mut IpSet, Error> {
        let key = metadata.store_name();
        if let Some(existing) = self.sets.get(&key) {
            if existing.metadata.kind != metadata.kind {
                return Err(Error::Logical(format!(
                    "set {key} exists as {:?}, requested {:?}",
                    existing.metadata.kind, metadata.kind
                )));
            }
        } else {
            self.deleted.remove(&key);
            self.sets.insert(key.clone(), IpSet::new(metadata.clone()));
        }
        Ok(self.sets.get_mut(&key).unwrap())
    }

    /// Adds `member` to the set, creating it on first use. Duplicate adds
    /// are no-ops and do not dirty the set.
    pub fn add_member(&mut self, metadata: &SetMetadata, member: &str) -> Result<(), Error> {
        let set = self.create_or_get(metadata)?;
        if set.members.insert(member.to_string()) {
            set.pending_delete = false;
            set.touch();
        }
        Ok(())
    }

    /// Removes `member`. Unknown sets and non-members are no-ops.
    pub fn remove_member(&mut self, metadata: &SetMetadata, member: &str) -> Result<(), Error> {
        let key = metadata.store_name();
        if let Some(set) = self.sets.get_mut(&key) {
            if set.members.remove(member) {
                set.touch();
            }
        }
        self.sweep(&key);
        Ok(())
    }

    /// Adds the set stored as `child` as a member of the list set `parent`.
    /// The child must already exist; the parent is created on first use.
    pub fn add_to_list(&mut self, parent: &SetMetadata, child: &str) -> Result<(), Error> {
        if !parent.kind.is_list() {
            return Err(Error::NotAListSet(parent.name.clone()));
        }
        if !self.sets.contains_key(child) {
            return Err(Error::UnknownSet(child.to_string()));
        }
        let set = self.create_or_get(parent)?;
        if set.member_sets.insert(child.to_string()) {
            set.pending_delete = false;
            set.touch();
        }
        Ok(())
    }

    pub fn remove_from_list(&mut self, parent: &SetMetadata, child: &str) -> Result<(), Error> {
        let key = parent.store_name();
        if let Some(set) = self.sets.get_mut(&key) {
            if !set.metadata.kind.is_list() {
                return Err(Error::NotAListSet(key));
            }
            if set.member_sets.remove(child) {
                set.touch();
            }
        }
        self.sweep(&key);
        Ok(())
    }

    pub fn inc_ref(&mut self, metadata: &SetMetadata) -> Result<(), Error> {
        let set = self.create_or_get(metadata)?;
        set.ref_count += 1;
        set.pending_delete = false;
        set.touch();
        Ok(())
    }

    pub fn dec_ref(&mut self, metadata: &SetMetadata) -> Result<(), Error> {
        let key = metadata.store_name();
        let set = self
            .sets
            .get_mut(&key)
            .ok_or_else(|| Error::UnknownSet(key.clone()))?;
        if set.ref_count == 0 {
            return Err(Error::Logical(format!("ref count underflow on {key}")));
        }
        set.ref_count -= 1;
        set.touch();
        self.sweep(&key);
        Ok(())
    }

    /// Deletes the set if nothing holds it, otherwise marks it for deletion
    /// as soon as the last reference goes away.
    pub fn delete(&mut self, metadata: &SetMetadata) -> bool {
        let key = metadata.store_name();
        let deletable = match self.sets.get(&key) {
            Some(set) => set.is_deletable(),
            None => return true,
        };
        if deletable {
            let set = self.sets.remove(&key).unwrap();
            self.deleted.insert(
                key,
                DeletedSet {
                    on_host: set.on_host,
                    is_list: set.metadata.kind.is_list(),
                },
            );
            true
        } else {
            if let Some(set) = self.sets.get_mut(&key) {
                set.pending_delete = true;
            }
            false
        }
    }

    fn sweep(&mut self, key: &str) {
        if self
            .sets
            .get(key)
            .map(|s| s.pending_delete && s.is_deletable())
            .unwrap_or(false)
        {
            let set = self.sets.remove(key).unwrap();
            self.deleted.insert(
                key.to_string(),
                DeletedSet {
                    on_host: set.on_host,
                    is_list: set.metadata.kind.is_list(),
                },
            );
        }
    }

    /// Snapshot of everything the next flush must touch: dirty sets (with
    /// the version flushed) and deletions. Deleted lists come before
    /// deleted hash sets so a destroy never hits a set still referenced by
    /// a list.
    pub fn dirty_snapshot(&self) -> DirtySnapshot {
        let mut deleted: Vec<(&String, &DeletedSet)> =
            self.deleted.iter().filter(|(_, d)| d.on_host).collect();
        deleted.sort_by_key(|(name, d)| (!d.is_list, (*name).clone()));
        DirtySnapshot {
            sets: self
                .sets
                .values()
                .filter(|s| s.dirty)
                .cloned()
                .collect::<Vec<IpSet>>(),
            deleted: deleted.into_iter().map(|(name, _)| name.clone()).collect(),
        }
    }

    /// Clears dirty flags for sets whose version is unchanged since the
    /// snapshot was taken; anything mutated mid-flush stays dirty for the
    /// next apply.
    pub fn commit_flush(&mut self, snapshot: &DirtySnapshot) {
        for flushed in &snapshot.sets {
            if let Some(set) = self.sets.get_mut(&flushed.metadata.store_name()) {
                set.on_host = flushed.should_exist_on_host();
                if set.version == flushed.version {
                    set.dirty = false;
                }
            }
        }
        for name in &snapshot.deleted {
            self.deleted.remove(name);
        }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.sets.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirtySnapshot {
    pub sets: Vec<IpSet>,
    pub deleted: Vec<String>,
}

impl DirtySnapshot {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deleted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, kind: SetKind) -> SetMetadata {
        SetMetadata::new(name, kind)
    }

    #[test]
    fn works_create_is_idempotent() {
        let mut store = IpSetStore::new();
        store
            .create_or_get(&meta("test-namespace", SetKind::Namespace))
            .unwrap();
        store
            .create_or_get(&meta("test-namespace", SetKind::Namespace))
            .unwrap();
        assert_eq!(store.len(), 1);
        let set = store.get("test-namespace").unwrap();
        assert_eq!(set.ref_count, 0);
        assert!(set.members.is_empty());
        assert!(set.dirty);
    }

    #[test]
    fn fails_create_with_conflicting_kind() {
        let mut store = IpSetStore::new();
        store
            .create_or_get(&meta("app", SetKind::KeyLabelOfPod))
            .unwrap();
        let err = store
            .create_or_get(&meta("app", SetKind::Namespace))
            .unwrap_err();
        assert!(matches!(err, Error::Logical(_)));
    }

    #[test]
    fn works_named_port_sets_live_under_their_own_prefix() {
        let mut store = IpSetStore::new();
        store
            .add_member(&meta("app:web", SetKind::KeyValueLabelOfPod), "1.2.3.4")
            .unwrap();
        store
            .add_member(&meta("app:web", SetKind::NamedPorts), "1.2.3.4,8080")
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("app:web").is_some());
        assert!(store.get("namedport:app:web").is_some());
    }

    #[test]
    fn works_duplicate_add_does_not_dirty() {
        let mut store = IpSetStore::new();
        let m = meta("test-namespace", SetKind::Namespace);
        store.add_member(&m, "1.2.3.4").unwrap();
        let version = store.get("test-namespace").unwrap().version;
        store.add_member(&m, "1.2.3.4").unwrap();
        assert_eq!(store.get("test-namespace").unwrap().version, version);
    }

    #[test]
    fn works_remove_nonmember_is_a_noop() {
        let mut store = IpSetStore::new();
        let m = meta("test-namespace", SetKind::Namespace);
        store.add_member(&m, "1.2.3.4").unwrap();
        store.remove_member(&m, "4.3.2.1").unwrap();
        store
            .remove_member(&meta("no-such-set", SetKind::Namespace), "1.2.3.4")
            .unwrap();
        assert_eq!(store.get("test-namespace").unwrap().members.len(), 1);
    }

    #[test]
    fn fails_list_add_for_non_list_kind() {
        let mut store = IpSetStore::new();
        store
            .create_or_get(&meta("test-namespace", SetKind::Namespace))
            .unwrap();
        let err = store
            .add_to_list(&meta("other-namespace", SetKind::Namespace), "test-namespace")
            .unwrap_err();
        assert!(matches!(err, Error::NotAListSet(_)));
    }

    #[test]
    fn fails_list_add_for_missing_child() {
        let mut store = IpSetStore::new();
        let err = store
            .add_to_list(&SetMetadata::all_namespaces(), "test-namespace")
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSet(_)));
    }

    #[test]
    fn works_delete_defers_until_unreferenced() {
        let mut store = IpSetStore::new();
        let m = meta("app", SetKind::KeyLabelOfPod);
        store.inc_ref(&m).unwrap();
        assert!(!store.delete(&m));
        assert!(store.get("app").unwrap().pending_delete);

        store.dec_ref(&m).unwrap();
        assert!(store.get("app").is_none());
    }

    #[test]
    fn works_delete_defers_until_members_gone() {
        let mut store = IpSetStore::new();
        let m = meta("test-namespace", SetKind::Namespace);
        store.add_member(&m, "1.2.3.4").unwrap();
        assert!(!store.delete(&m));
        store.remove_member(&m, "1.2.3.4").unwrap();
        assert!(store.get("test-namespace").is_none());
    }

    #[test]
    fn works_commit_flush_keeps_midflight_mutations_dirty() {
        let mut store = IpSetStore::new();
        let m = meta("test-namespace", SetKind::Namespace);
        store.add_member(&m, "1.2.3.4").unwrap();

        let snapshot = store.dirty_snapshot();
        // A pod event lands while the flush is on the wire.
        store.add_member(&m, "1.2.3.5").unwrap();
        store.commit_flush(&snapshot);

        assert!(store.get("test-namespace").unwrap().dirty);
    }
}
