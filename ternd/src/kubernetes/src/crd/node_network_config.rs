pub use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ternd_ipam::record::NcBlock;
use ternd_ipam::scaler::ScalerConfig;

pub const NODE_NETWORK_CONFIG_NODE_LABEL: &str = "nodenetworkconfig.tern.dev/node";

/// Per-node IP pool request and assignment. The node owns the spec (it is
/// the only writer of `requestedIPCount`); the cluster allocator owns the
/// status.
#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "tern.dev",
    version = "v1alpha1",
    kind = "NodeNetworkConfig",
    shortname = "nnc"
)]
#[kube(status = "NodeNetworkConfigStatus")]
#[kube(
    printcolumn = r#"{"name":"REQUESTED", "type":"integer", "description":"Requested IP count", "jsonPath":".spec.requestedIPCount"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigSpec {
    #[serde(rename = "requestedIPCount")]
    pub requested_ip_count: i64,
    pub scaler: Scaler,
}

/// Pool watermarks, granular to `batchSize`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scaler {
    pub batch_size: i64,
    pub min_free_percent: i64,
    pub max_free_percent: i64,
}

impl Default for Scaler {
    fn default() -> Self {
        Self {
            batch_size: 16,
            min_free_percent: 50,
            max_free_percent: 150,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigStatus {
    pub network_containers: Vec<NetworkContainer>,
}

/// A block of IPs the cluster allocator assigned to this node.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContainer {
    pub id: String,
    #[serde(rename = "primaryIP")]
    pub primary_ip: String,
    pub subnet_address_space: String,
    pub default_gateway: String,
    pub version: i64,
    pub ip_assignments: Vec<IpAssignment>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpAssignment {
    /// Stable uuid of the assignment.
    pub name: String,
    pub ip: String,
}

impl NodeNetworkConfig {
    /// The announced truth in the form the IP-config store merges.
    pub fn nc_blocks(&self) -> Vec<NcBlock> {
        self.status
            .as_ref()
            .map(|status| {
                status
                    .network_containers
                    .iter()
                    .map(|nc| NcBlock {
                        id: nc.id.clone(),
                        subnet: nc.subnet_address_space.clone(),
                        version: nc.version,
                        ips: nc
                            .ip_assignments
                            .iter()
                            .map(|a| (a.name.clone(), a.ip.clone()))
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total IPs the cluster has actually assigned so far.
    pub fn announced_ip_count(&self) -> i64 {
        self.status
            .as_ref()
            .map(|status| {
                status
                    .network_containers
                    .iter()
                    .map(|nc| nc.ip_assignments.len() as i64)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// A request is outstanding while the status has not caught up to the
    /// spec; the pool monitor must not recompute until it has.
    pub fn request_outstanding(&self) -> bool {
        self.spec.requested_ip_count != self.announced_ip_count()
    }

    pub fn scaler_config(&self) -> ScalerConfig {
        ScalerConfig {
            batch_size: self.spec.scaler.batch_size,
            min_free_percent: self.spec.scaler.min_free_percent,
            max_free_percent: self.spec.scaler.max_free_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn nnc(requested: i64, assigned: usize) -> NodeNetworkConfig {
        NodeNetworkConfig {
            metadata: ObjectMeta {
                name: Some("testnode".to_string()),
                ..Default::default()
            },
            spec: NodeNetworkConfigSpec {
                requested_ip_count: requested,
                scaler: Scaler::default(),
            },
            status: Some(NodeNetworkConfigStatus {
                network_containers: vec![NetworkContainer {
                    id: "nc-1".to_string(),
                    primary_ip: "10.240.0.0".to_string(),
                    subnet_address_space: "10.240.0.0/16".to_string(),
                    default_gateway: "10.240.0.1".to_string(),
                    version: 1,
                    ip_assignments: (0..assigned)
                        .map(|i| IpAssignment {
                            name: format!("uuid-{i}"),
                            ip: format!("10.240.0.{}", i + 4),
                        })
                        .collect(),
                }],
            }),
        }
    }

    #[test]
    fn works_request_outstanding() {
        assert!(nnc(16, 8).request_outstanding());
        assert!(!nnc(8, 8).request_outstanding());
    }

    #[test]
    fn works_nc_blocks_carry_assignments() {
        let blocks = nnc(16, 2).nc_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].ips.len(), 2);
        assert_eq!(blocks[0].ips["uuid-0"], "10.240.0.4");
    }
}
