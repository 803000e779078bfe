use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ipsets::SetMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyTarget {
    Allowed,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
}

/// One port match of an ACL rule, kept in the order the policy gave it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub protocol: String,
    pub port: Option<i32>,
    pub end_port: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPolicy {
    pub policy_id: String,
    pub target: PolicyTarget,
    pub direction: Direction,
    pub src_sets: Vec<SetMetadata>,
    pub dst_sets: Vec<SetMetadata>,
    pub ports: Vec<PortRule>,
}

/// A set a policy needs materialized, together with the members the policy
/// itself contributes (child set names for list kinds, cidr entries for
/// cidr kinds; selector sets are filled by the pod controllers instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedIpSet {
    pub metadata: SetMetadata,
    pub members: Vec<String>,
}

impl TranslatedIpSet {
    pub fn new(metadata: SetMetadata) -> TranslatedIpSet {
        TranslatedIpSet {
            metadata,
            members: Vec::new(),
        }
    }

    pub fn with_members(metadata: SetMetadata, members: &[&str]) -> TranslatedIpSet {
        TranslatedIpSet {
            metadata,
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// A network policy after selector translation: the sets it needs and its
/// ordered ACL rules, keyed by `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmNetworkPolicy {
    pub name: String,
    pub pod_selector_sets: Vec<TranslatedIpSet>,
    pub rule_sets: Vec<TranslatedIpSet>,
    pub acls: Vec<AclPolicy>,
}

/// A policy as installed on the host: the translated policy plus the chain
/// carrying its rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPolicy {
    pub policy: NpmNetworkPolicy,
    pub chain: String,
}

/// Installed policies, ordered by name. The position of a policy in this
/// order is its position in the host chain dispatch.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: BTreeMap<String, InstalledPolicy>,
}

impl PolicyStore {
    pub fn new() -> PolicyStore {
        PolicyStore::default()
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPolicy> {
        self.policies.get(name)
    }

    pub fn insert(&mut self, policy: NpmNetworkPolicy, chain: String) -> Option<InstalledPolicy> {
        self.policies
            .insert(policy.name.clone(), InstalledPolicy { policy, chain })
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledPolicy> {
        self.policies.remove(name)
    }

    /// 1-based position of `name` in policy-name order, were it inserted.
    pub fn position(&self, name: &str) -> usize {
        self.policies.keys().filter(|k| k.as_str() < name).count() + 1
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
