use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle state of a pre-provisioned pod IP.
///
/// Created as `PendingProgramming` when its network container is announced,
/// promoted to `Available` once the host confirms the container is
/// programmed, `Allocated` while reserved for a pod, and `PendingRelease`
/// while waiting for the cluster allocator to take the address back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpState {
    PendingProgramming,
    Available,
    Allocated,
    PendingRelease,
}

impl fmt::Display for IpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpState::PendingProgramming => write!(f, "PendingProgramming"),
            IpState::Available => write!(f, "Available"),
            IpState::Allocated => write!(f, "Allocated"),
            IpState::PendingRelease => write!(f, "PendingRelease"),
        }
    }
}

/// The pod an IP is reserved for.
///
/// The wire form is polymorphic: the orchestrator variant carries an
/// interface id alongside the pod coordinates, the plain variant does not.
/// Decoding dispatches on the shape of the JSON object, so both forms are
/// accepted wherever a record is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodInfo {
    Kubernetes {
        namespace: String,
        name: String,
    },
    Orchestrated {
        namespace: String,
        name: String,
        interface_id: String,
    },
}

impl PodInfo {
    pub fn new(namespace: &str, name: &str) -> PodInfo {
        PodInfo::Kubernetes {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn with_interface(namespace: &str, name: &str, interface_id: &str) -> PodInfo {
        PodInfo::Orchestrated {
            namespace: namespace.to_string(),
            name: name.to_string(),
            interface_id: interface_id.to_string(),
        }
    }

    /// Parses a `namespace/name` reservation key.
    pub fn from_pod_key(key: &str) -> Option<PodInfo> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(PodInfo::new(namespace, name))
    }

    /// Reservation ids are opaque; pod keys pass through, anything else is
    /// filed under the default namespace.
    pub fn from_reservation_id(id: &str) -> PodInfo {
        PodInfo::from_pod_key(id).unwrap_or_else(|| PodInfo::new("default", id))
    }

    pub fn pod_key(&self) -> String {
        match self {
            PodInfo::Kubernetes { namespace, name }
            | PodInfo::Orchestrated {
                namespace, name, ..
            } => format!("{namespace}/{name}"),
        }
    }
}

impl Serialize for PodInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PodInfo::Kubernetes { namespace, name } => {
                let mut s = serializer.serialize_struct("PodInfo", 2)?;
                s.serialize_field("PodNamespace", namespace)?;
                s.serialize_field("PodName", name)?;
                s.end()
            }
            PodInfo::Orchestrated {
                namespace,
                name,
                interface_id,
            } => {
                let mut s = serializer.serialize_struct("PodInfo", 3)?;
                s.serialize_field("PodNamespace", namespace)?;
                s.serialize_field("PodName", name)?;
                s.serialize_field("PodInterfaceID", interface_id)?;
                s.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PodInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        pod_info_from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn pod_info_from_value(value: &serde_json::Value) -> Result<PodInfo, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "PodInfo is not an object".to_string())?;
    let field = |key: &str| -> Result<String, String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("PodInfo is missing {key}"))
    };
    let namespace = field("PodNamespace")?;
    let name = field("PodName")?;
    match obj.get("PodInterfaceID").and_then(|v| v.as_str()) {
        Some(interface_id) => Ok(PodInfo::Orchestrated {
            namespace,
            name,
            interface_id: interface_id.to_string(),
        }),
        None => Ok(PodInfo::Kubernetes { namespace, name }),
    }
}

/// One pre-provisioned pod IP, keyed by a cluster-assigned UUID that is
/// stable for the lifetime of the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpConfigRecord {
    #[serde(rename = "NCID")]
    pub nc_id: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "State")]
    pub state: IpState,
    #[serde(rename = "PodInfo", skip_serializing_if = "Option::is_none")]
    pub pod_info: Option<PodInfo>,
}

impl IpConfigRecord {
    pub fn pending(nc_id: &str, id: &str, ip_address: &str) -> IpConfigRecord {
        IpConfigRecord {
            nc_id: nc_id.to_string(),
            id: id.to_string(),
            ip_address: ip_address.to_string(),
            state: IpState::PendingProgramming,
            pod_info: None,
        }
    }
}

impl fmt::Display for IpConfigRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IpConfigRecord: Id: [{}], NcId: [{}], IpAddress: [{}], State: [{}], PodInfo: [{:?}]",
            self.id, self.nc_id, self.ip_address, self.state, self.pod_info
        )
    }
}

// The default derive cannot decode the polymorphic PodInfo field, and old
// state files may omit fields entirely, so decoding goes through a shape
// dispatch on the raw object.
impl<'de> Deserialize<'de> for IpConfigRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("IpConfigRecord is not an object"))?;

        let str_field = |key: &str| -> String {
            obj.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let state = match obj.get("State") {
            Some(v) => {
                serde_json::from_value::<IpState>(v.clone()).map_err(serde::de::Error::custom)?
            }
            None => IpState::PendingProgramming,
        };
        let pod_info = match obj.get("PodInfo") {
            Some(serde_json::Value::Null) | None => None,
            Some(v) => Some(pod_info_from_value(v).map_err(serde::de::Error::custom)?),
        };

        Ok(IpConfigRecord {
            nc_id: str_field("NCID"),
            id: str_field("ID"),
            ip_address: str_field("IPAddress"),
            state,
            pod_info,
        })
    }
}

/// A network container as announced by the cluster allocator through NNC
/// status: a block id, its subnet, a programming version and the uuid→IP
/// assignments it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcBlock {
    pub id: String,
    pub subnet: String,
    pub version: i64,
    pub ips: BTreeMap<String, String>,
}
