use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::error::Error;
use super::ipsets::{DirtySnapshot, IpSet, IpSetStore, SetKind, SetMetadata, SET_PREFIX};
use super::policies::{Direction, NpmNetworkPolicy, PolicyStore, PolicyTarget};
use super::shim::{HostPlane, PolicyChainSpec, EGRESS_CHAIN, INGRESS_CHAIN};
use super::translate::{translate, AclRecord, PolicyPlan};

pub const MAX_APPLY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// The bus value carried from the controllers into the dataplane: one pod
/// (or one of its named ports) as a set member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMetadata {
    pub pod_key: String,
    /// `ip`, or `ip,port` when targeting a named-port set.
    pub ip: String,
    pub node_name: String,
}

impl PodMetadata {
    pub fn new(pod_key: &str, ip: &str, node_name: &str) -> PodMetadata {
        PodMetadata {
            pod_key: pod_key.to_string(),
            ip: ip.to_string(),
            node_name: node_name.to_string(),
        }
    }
}

/// The dataplane surface the controllers drive. Membership mutations are
/// cheap in-memory operations; `apply_dataplane` flushes the accumulated
/// delta to the host in one shot.
#[async_trait]
pub trait Dataplane: Send + Sync {
    fn create_ip_sets(&self, metadatas: &[SetMetadata]) -> Result<(), Error>;
    fn delete_ip_set(&self, metadata: &SetMetadata) -> Result<(), Error>;
    fn add_to_sets(&self, metadatas: &[SetMetadata], pod: &PodMetadata) -> Result<(), Error>;
    fn remove_from_sets(&self, metadatas: &[SetMetadata], pod: &PodMetadata) -> Result<(), Error>;
    fn add_to_lists(&self, lists: &[SetMetadata], members: &[SetMetadata]) -> Result<(), Error>;
    fn remove_from_lists(&self, lists: &[SetMetadata], members: &[SetMetadata])
        -> Result<(), Error>;
    async fn apply_dataplane(&self) -> Result<(), Error>;
    async fn add_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), Error>;
    async fn update_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), Error>;
    async fn remove_policy(&self, name: &str) -> Result<(), Error>;
}

/// Host-backed dataplane: the ip-set store, the installed policies, and the
/// platform plane behind them.
pub struct HostDataplane {
    node_name: String,
    plane: Arc<dyn HostPlane>,
    ipsets: RwLock<IpSetStore>,
    policies: RwLock<PolicyStore>,
    generation: AtomicU64,
    chain_seq: AtomicU64,
}

impl HostDataplane {
    pub fn new(node_name: &str, plane: Arc<dyn HostPlane>) -> HostDataplane {
        HostDataplane {
            node_name: node_name.to_string(),
            plane,
            ipsets: RwLock::new(IpSetStore::new()),
            policies: RwLock::new(PolicyStore::new()),
            generation: AtomicU64::new(0),
            chain_seq: AtomicU64::new(0),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Flushes the base chains and destroys every set this dataplane owns
    /// on the host, so a restart converges from a clean slate.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.with_retry(|| self.plane.reset()).await
    }

    /// Completed flush count.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get_set(&self, name: &str) -> Option<IpSet> {
        self.ipsets.read().ok()?.get(name).cloned()
    }

    pub fn set_count(&self) -> usize {
        self.ipsets.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn policy_count(&self) -> usize {
        self.policies.read().map(|p| p.len()).unwrap_or(0)
    }

    async fn with_retry<F, Fut>(&self, mut op: F) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < MAX_APPLY_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "Transient host error, retrying");
                    tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates and references every set the plan needs, and fills the
    /// members the policy itself contributes.
    fn materialize_plan(&self, plan: &PolicyPlan) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for set in &plan.sets {
            store.inc_ref(&set.metadata)?;
            if set.metadata.kind.is_list() {
                for member in &set.members {
                    store.add_to_list(&set.metadata, member)?;
                }
            } else {
                for member in &set.members {
                    store.add_member(&set.metadata, member)?;
                }
            }
        }
        Ok(())
    }

    /// Drops the references a plan holds. Members also carried by `keep`
    /// (the replacing plan, on updates) stay in place; sets nothing else
    /// uses are marked for deletion and flushed on the next apply.
    fn release_plan(&self, plan: &PolicyPlan, keep: Option<&PolicyPlan>) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for set in &plan.sets {
            let kept = keep.and_then(|k| {
                k.sets
                    .iter()
                    .find(|s| s.metadata.store_name() == set.metadata.store_name())
            });
            for member in &set.members {
                if kept.map(|k| k.members.contains(member)).unwrap_or(false) {
                    continue;
                }
                if set.metadata.kind.is_list() {
                    store.remove_from_list(&set.metadata, member)?;
                } else {
                    store.remove_member(&set.metadata, member)?;
                }
            }
            store.dec_ref(&set.metadata)?;
            if kept.is_none() {
                store.delete(&set.metadata);
            }
        }
        Ok(())
    }

    fn render_policy_chain(&self, name: &str, acls: &[AclRecord], position: usize) -> PolicyChainSpec {
        let seq = self.chain_seq.fetch_add(1, Ordering::SeqCst);
        let chain = format!("TERND-{}-{seq}", sanitize_chain(name));

        let mut rules = Vec::new();
        let mut directions = Vec::new();
        for acl in acls {
            if !directions.contains(&acl.direction) {
                directions.push(acl.direction);
            }
            let mut matches = Vec::new();
            for src in &acl.src_set_names {
                matches.push(format!("-m set --match-set {SET_PREFIX}{src} src"));
            }
            for dst in &acl.dst_set_names {
                matches.push(format!("-m set --match-set {SET_PREFIX}{dst} dst"));
            }
            let target = match acl.target {
                PolicyTarget::Allowed => "ACCEPT",
                PolicyTarget::Dropped => "DROP",
            };
            if acl.ports.is_empty() {
                let mut tokens = matches.clone();
                tokens.push(format!("-j {target}"));
                rules.push(tokens.join(" "));
            } else {
                for port in &acl.ports {
                    let dport = match (port.port, port.end_port) {
                        (Some(p), Some(e)) => format!(" --dport {p}:{e}"),
                        (Some(p), None) => format!(" --dport {p}"),
                        _ => String::new(),
                    };
                    let mut tokens = matches.clone();
                    tokens.push(format!(
                        "-p {}{dport} -j {target}",
                        port.protocol.to_lowercase()
                    ));
                    rules.push(tokens.join(" "));
                }
            }
        }

        let jumps = directions
            .iter()
            .map(|d| {
                let parent = match d {
                    Direction::Ingress => INGRESS_CHAIN,
                    Direction::Egress => EGRESS_CHAIN,
                };
                (parent.to_string(), position)
            })
            .collect();

        PolicyChainSpec {
            chain,
            rules,
            jumps,
        }
    }

    fn installed_chain_spec(&self, installed: &super::policies::InstalledPolicy) -> PolicyChainSpec {
        let plan = translate(&installed.policy);
        let mut directions = Vec::new();
        for acl in &plan.acls {
            if !directions.contains(&acl.direction) {
                directions.push(acl.direction);
            }
        }
        PolicyChainSpec {
            chain: installed.chain.clone(),
            rules: Vec::new(),
            jumps: directions
                .iter()
                .map(|d| {
                    let parent = match d {
                        Direction::Ingress => INGRESS_CHAIN,
                        Direction::Egress => EGRESS_CHAIN,
                    };
                    (parent.to_string(), 1)
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Dataplane for HostDataplane {
    fn create_ip_sets(&self, metadatas: &[SetMetadata]) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for metadata in metadatas {
            store.create_or_get(metadata)?;
        }
        Ok(())
    }

    fn delete_ip_set(&self, metadata: &SetMetadata) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        if !store.delete(metadata) {
            tracing::debug!(set = metadata.name, "Set still in use, deferring deletion");
        }
        Ok(())
    }

    fn add_to_sets(&self, metadatas: &[SetMetadata], pod: &PodMetadata) -> Result<(), Error> {
        if pod.ip.is_empty() {
            return Err(Error::Validation(format!("pod {} has no IP", pod.pod_key)));
        }
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for metadata in metadatas {
            store.add_member(metadata, &pod.ip)?;
        }
        Ok(())
    }

    fn remove_from_sets(&self, metadatas: &[SetMetadata], pod: &PodMetadata) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for metadata in metadatas {
            store.remove_member(metadata, &pod.ip)?;
        }
        Ok(())
    }

    fn add_to_lists(&self, lists: &[SetMetadata], members: &[SetMetadata]) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for member in members {
            store.create_or_get(member)?;
        }
        for list in lists {
            for member in members {
                store.add_to_list(list, &member.store_name())?;
            }
        }
        Ok(())
    }

    fn remove_from_lists(
        &self,
        lists: &[SetMetadata],
        members: &[SetMetadata],
    ) -> Result<(), Error> {
        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        for list in lists {
            for member in members {
                store.remove_from_list(list, &member.store_name())?;
            }
        }
        Ok(())
    }

    async fn apply_dataplane(&self) -> Result<(), Error> {
        let snapshot = {
            let store = self.ipsets.read().map_err(|_| Error::FailedToGetLock)?;
            let snapshot = store.dirty_snapshot();
            if snapshot.is_empty() {
                return Ok(());
            }
            // A list referencing a vanished set would program garbage;
            // abort the whole flush instead.
            for set in &snapshot.sets {
                for child in &set.member_sets {
                    if store.get(child).is_none() {
                        return Err(Error::UnknownSet(child.clone()));
                    }
                }
            }
            snapshot
        };

        let program = render_restore_program(&snapshot);
        if !program.is_empty() {
            self.with_retry(|| self.plane.restore_sets(&program)).await?;
        }

        let mut store = self.ipsets.write().map_err(|_| Error::FailedToGetLock)?;
        store.commit_flush(&snapshot);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), Error> {
        let plan = translate(policy);
        self.materialize_plan(&plan)?;
        // Sets must exist on the host before any rule references them.
        self.apply_dataplane().await?;

        let spec = {
            let policies = self.policies.read().map_err(|_| Error::FailedToGetLock)?;
            self.render_policy_chain(&policy.name, &plan.acls, policies.position(&policy.name))
        };
        self.with_retry(|| self.plane.add_policy(&spec)).await?;

        let mut policies = self.policies.write().map_err(|_| Error::FailedToGetLock)?;
        policies.insert(policy.clone(), spec.chain);
        Ok(())
    }

    async fn update_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), Error> {
        let old = {
            let policies = self.policies.read().map_err(|_| Error::FailedToGetLock)?;
            policies.get(&policy.name).cloned()
        };
        let old = match old {
            Some(old) => old,
            None => return self.add_policy(policy).await,
        };

        let plan = translate(policy);
        self.materialize_plan(&plan)?;
        self.apply_dataplane().await?;

        let new_spec = {
            let policies = self.policies.read().map_err(|_| Error::FailedToGetLock)?;
            self.render_policy_chain(&policy.name, &plan.acls, policies.position(&policy.name))
        };
        let old_spec = self.installed_chain_spec(&old);

        // New rules land before the old ones leave, so there is never a
        // window without enforcement.
        self.with_retry(|| self.plane.add_policy(&new_spec)).await?;
        self.with_retry(|| self.plane.remove_policy(&old_spec)).await?;

        self.release_plan(&translate(&old.policy), Some(&plan))?;
        self.apply_dataplane().await?;

        let mut policies = self.policies.write().map_err(|_| Error::FailedToGetLock)?;
        policies.insert(policy.clone(), new_spec.chain);
        Ok(())
    }

    async fn remove_policy(&self, name: &str) -> Result<(), Error> {
        let installed = {
            let policies = self.policies.read().map_err(|_| Error::FailedToGetLock)?;
            policies.get(name).cloned()
        };
        let installed = match installed {
            Some(installed) => installed,
            None => return Ok(()),
        };

        // The rule is unwired before its sets are released, so no live
        // rule ever references a set the next flush is about to destroy.
        self.apply_dataplane().await?;
        let spec = self.installed_chain_spec(&installed);
        self.with_retry(|| self.plane.remove_policy(&spec)).await?;

        {
            let mut policies = self.policies.write().map_err(|_| Error::FailedToGetLock)?;
            policies.remove(name);
        }
        self.release_plan(&translate(&installed.policy), None)?;
        self.apply_dataplane().await?;
        Ok(())
    }
}

fn sanitize_chain(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn set_method(kind: SetKind) -> &'static str {
    if kind.is_list() {
        "list:set"
    } else if kind == SetKind::NamedPorts {
        "hash:ip,port"
    } else {
        "hash:net"
    }
}

/// Serializes the dirty delta into one ipset-restore program: full desired
/// state of every touched set, hash sets before lists, destroys last.
fn render_restore_program(snapshot: &DirtySnapshot) -> String {
    let mut sets: Vec<&IpSet> = snapshot.sets.iter().collect();
    sets.sort_by_key(|s| (s.metadata.kind.is_list(), s.metadata.name.clone()));

    let mut lines = Vec::new();
    let mut destroys = Vec::new();
    for set in sets {
        let host = set.metadata.host_name();
        if set.should_exist_on_host() {
            lines.push(format!("create {host} {}", set_method(set.metadata.kind)));
            lines.push(format!("flush {host}"));
            for member in &set.members {
                lines.push(format!("add {host} {member}"));
            }
            for child in &set.member_sets {
                lines.push(format!("add {host} {SET_PREFIX}{child}"));
            }
        } else if set.on_host {
            destroys.push(format!("destroy {host}"));
        }
    }
    for name in &snapshot.deleted {
        destroys.push(format!("destroy {SET_PREFIX}{name}"));
    }
    lines.extend(destroys);
    lines.join("\n")
}
