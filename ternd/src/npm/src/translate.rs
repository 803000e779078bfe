use std::collections::BTreeMap;

use super::policies::{AclPolicy, NpmNetworkPolicy, PortRule, TranslatedIpSet};

/// Everything the applier must do for one policy: the deduplicated sets to
/// materialize and reference, and the ACL records with resolved set names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyPlan {
    /// Hash sets first, list sets after, each group in name order, so a
    /// list's children are always materialized before the list itself.
    pub sets: Vec<TranslatedIpSet>,
    pub acls: Vec<AclRecord>,
}

/// An ACL rule with set references resolved to set names. Rule order within
/// the policy is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRecord {
    pub policy_id: String,
    pub target: super::policies::PolicyTarget,
    pub direction: super::policies::Direction,
    pub src_set_names: Vec<String>,
    pub dst_set_names: Vec<String>,
    pub ports: Vec<PortRule>,
}

/// Translates a policy into its dataplane plan.
///
/// Deterministic: two semantically equal policies produce identical plans,
/// whatever order their selector sets arrived in.
pub fn translate(policy: &NpmNetworkPolicy) -> PolicyPlan {
    let mut merged: BTreeMap<String, TranslatedIpSet> = BTreeMap::new();
    for translated in policy
        .pod_selector_sets
        .iter()
        .chain(policy.rule_sets.iter())
    {
        let entry = merged
            .entry(translated.metadata.name.clone())
            .or_insert_with(|| TranslatedIpSet::new(translated.metadata.clone()));
        for member in &translated.members {
            if !entry.members.contains(member) {
                entry.members.push(member.clone());
            }
        }
        entry.members.sort();
    }

    let (lists, hashes): (Vec<TranslatedIpSet>, Vec<TranslatedIpSet>) = merged
        .into_values()
        .partition(|s| s.metadata.kind.is_list());

    let mut sets = hashes;
    sets.extend(lists);

    let acls = policy
        .acls
        .iter()
        .map(|acl| AclRecord {
            policy_id: acl.policy_id.clone(),
            target: acl.target,
            direction: acl.direction,
            src_set_names: sorted_names(&acl.src_sets),
            dst_set_names: sorted_names(&acl.dst_sets),
            ports: acl.ports.clone(),
        })
        .collect();

    PolicyPlan { sets, acls }
}

fn sorted_names(sets: &[super::ipsets::SetMetadata]) -> Vec<String> {
    let mut names: Vec<String> = sets.iter().map(|s| s.name.clone()).collect();
    names.sort();
    names.dedup();
    names
}
