use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Node-local request surface. Paths are fixed wire contract; they are
// mounted under both version prefixes.
pub const SET_ENVIRONMENT_PATH: &str = "/network/environment";
pub const CREATE_NETWORK_PATH: &str = "/network/create";
pub const DELETE_NETWORK_PATH: &str = "/network/delete";
pub const CREATE_HNS_NETWORK_PATH: &str = "/network/hns/create";
pub const DELETE_HNS_NETWORK_PATH: &str = "/network/hns/delete";
pub const RESERVE_IP_ADDRESS_PATH: &str = "/network/ip/reserve";
pub const RELEASE_IP_ADDRESS_PATH: &str = "/network/ip/release";
pub const GET_HOST_LOCAL_IP_PATH: &str = "/network/ip/hostlocal";
pub const GET_IP_ADDRESS_UTILIZATION_PATH: &str = "/network/ip/utilization";
pub const GET_UNHEALTHY_IP_ADDRESSES_PATH: &str = "/network/ipaddresses/unhealthy";
pub const GET_HEALTH_REPORT_PATH: &str = "/network/health";
pub const NUMBER_OF_CPU_CORES_PATH: &str = "/hostcpucores";
pub const CREATE_HOST_NC_APIPA_ENDPOINT_PATH: &str = "/network/createhostncapipaendpoint";
pub const DELETE_HOST_NC_APIPA_ENDPOINT_PATH: &str = "/network/deletehostncapipaendpoint";
pub const NM_AGENT_SUPPORTED_APIS_PATH: &str = "/network/nmagentsupportedapis";
pub const V1_PREFIX: &str = "/v0.1";
pub const V2_PREFIX: &str = "/v0.2";

/// Stable error codes embedded in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success,
    UnsupportedNetworkType,
    InvalidParameter,
    UnexpectedError,
    AddressUnavailable,
    NotFound,
    InconsistentState,
}

impl ReturnCode {
    pub fn code(&self) -> i32 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::UnsupportedNetworkType => 1,
            ReturnCode::InvalidParameter => 2,
            ReturnCode::UnexpectedError => 3,
            ReturnCode::AddressUnavailable => 4,
            ReturnCode::NotFound => 5,
            ReturnCode::InconsistentState => 6,
        }
    }

    pub fn from_code(code: i32) -> ReturnCode {
        match code {
            0 => ReturnCode::Success,
            1 => ReturnCode::UnsupportedNetworkType,
            2 => ReturnCode::InvalidParameter,
            4 => ReturnCode::AddressUnavailable,
            5 => ReturnCode::NotFound,
            6 => ReturnCode::InconsistentState,
            _ => ReturnCode::UnexpectedError,
        }
    }
}

impl Serialize for ReturnCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for ReturnCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ReturnCode::from_code(i32::deserialize(deserializer)?))
    }
}

/// Generic response embedded in every reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ReturnCode")]
    pub return_code: ReturnCode,
    #[serde(rename = "Message")]
    pub message: String,
}

impl Response {
    pub fn success() -> Response {
        Response {
            return_code: ReturnCode::Success,
            message: String::new(),
        }
    }

    pub fn error(return_code: ReturnCode, message: &str) -> Response {
        Response {
            return_code,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetEnvironmentRequest {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "NetworkType")]
    pub network_type: String,
}

/// Subnet as an address plus prefix length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "PrefixLength")]
    pub prefix_length: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfiguration {
    #[serde(rename = "NodeIP")]
    pub node_ip: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "NodeSubnet")]
    pub node_subnet: Subnet,
}

/// Overlay layout for all nodes taking part in the network.
///
/// The subnet field is spelled `OverlaySubent` on the wire; peers have
/// shipped with that spelling, so it stays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayConfiguration {
    #[serde(rename = "NodeCount")]
    pub node_count: i32,
    #[serde(rename = "LocalNodeIP")]
    pub local_node_ip: String,
    #[serde(rename = "OverlaySubent")]
    pub overlay_subent: Subnet,
    #[serde(rename = "NodeConfig")]
    pub node_config: Vec<NodeConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    #[serde(rename = "OverlayConfiguration", default)]
    pub overlay_configuration: OverlayConfiguration,
    #[serde(rename = "Options", default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteNetworkRequest {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetInfo {
    #[serde(rename = "AddressPrefix")]
    pub address_prefix: String,
    #[serde(rename = "GatewayAddress")]
    pub gateway_address: String,
    #[serde(rename = "Policies", default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacPool {
    #[serde(rename = "StartMacAddress")]
    pub start_mac_address: String,
    #[serde(rename = "EndMacAddress")]
    pub end_mac_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHnsNetworkRequest {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    #[serde(rename = "NetworkType")]
    pub network_type: String,
    #[serde(rename = "NetworkAdapterName", default, skip_serializing_if = "String::is_empty")]
    pub network_adapter_name: String,
    #[serde(rename = "SourceMac", default, skip_serializing_if = "String::is_empty")]
    pub source_mac: String,
    #[serde(rename = "Policies", default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<serde_json::Value>,
    #[serde(rename = "MacPools", default, skip_serializing_if = "Vec::is_empty")]
    pub mac_pools: Vec<MacPool>,
    #[serde(rename = "Subnets", default)]
    pub subnets: Vec<SubnetInfo>,
    #[serde(rename = "DNSSuffix", default, skip_serializing_if = "String::is_empty")]
    pub dns_suffix: String,
    #[serde(rename = "DNSServerList", default, skip_serializing_if = "String::is_empty")]
    pub dns_server_list: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHnsNetworkRequest {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveIpAddressRequest {
    #[serde(rename = "ReservationID")]
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveIpAddressResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseIpAddressRequest {
    #[serde(rename = "ReservationID")]
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddressesUtilizationResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "Available")]
    pub available: i64,
    #[serde(rename = "Reserved")]
    pub reserved: i64,
    #[serde(rename = "Unhealthy")]
    pub unhealthy: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetIpAddressesResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostLocalIpAddressResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumOfCpuCoresResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "NumOfCPUCores")]
    pub num_of_cpu_cores: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHostNcApipaEndpointRequest {
    #[serde(rename = "NetworkContainerID")]
    pub network_container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHostNcApipaEndpointResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHostNcApipaEndpointRequest {
    #[serde(rename = "NetworkContainerID")]
    pub network_container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHostNcApipaEndpointResponse {
    #[serde(rename = "Response")]
    pub response: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmAgentSupportedApisRequest {
    #[serde(rename = "GetNmAgentSupportedApisURL", default)]
    pub get_nm_agent_supported_apis_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmAgentSupportedApisResponse {
    #[serde(rename = "Response")]
    pub response: Response,
    #[serde(rename = "SupportedApis")]
    pub supported_apis: Vec<String>,
}

/// State the pool monitor exposes to the request surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamPoolMonitorStateSnapshot {
    #[serde(rename = "MinimumFreeIps")]
    pub minimum_free_ips: i64,
    #[serde(rename = "MaximumFreeIps")]
    pub maximum_free_ips: i64,
    #[serde(rename = "UpdatingIpsNotInUseCount")]
    pub updating_ips_not_in_use_count: i64,
    #[serde(rename = "CachedNNC", default, skip_serializing_if = "Option::is_none")]
    pub cached_nnc: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_return_code_round_trip() {
        let raw = serde_json::to_string(&Response::error(
            ReturnCode::AddressUnavailable,
            "pool exhausted",
        ))
        .unwrap();
        assert_eq!(raw, r#"{"ReturnCode":4,"Message":"pool exhausted"}"#);
        let decoded: Response = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.return_code, ReturnCode::AddressUnavailable);
    }

    #[test]
    fn works_overlay_subent_spelling_is_preserved() {
        let overlay = OverlayConfiguration {
            node_count: 1,
            local_node_ip: "10.0.0.4".to_string(),
            overlay_subent: Subnet {
                ip_address: "10.0.0.0".to_string(),
                prefix_length: 16,
            },
            node_config: vec![],
        };
        let raw = serde_json::to_string(&overlay).unwrap();
        assert!(raw.contains(r#""OverlaySubent""#));
    }
}
