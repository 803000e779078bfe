use std::sync::{Arc, RwLock};

use actix_web::{
    web::{self, Data, Json},
    HttpResponse, Responder,
};
use ternd_ipam::error::Error as IpamError;
use ternd_ipam::record::{IpState, PodInfo};
use ternd_ipam::store::IpConfigStore;

use super::api::{self, IpamPoolMonitorStateSnapshot, Response, ReturnCode};
use super::error::Error;
use super::hostnet::NetworkPlane;

const HOST_NC_APIPA_NETWORK: &str = "host-nc-apipa-network";
const SUPPORTED_HOST_AGENT_APIS: &[&str] = &["NetworkManagement"];

/// Shared state behind the request surface. The service is a thin wrapper
/// over the IP-config store and the network plane; it never sizes the pool.
pub struct CnsState {
    pub node_name: String,
    pub local_ip: String,
    pub store: IpConfigStore,
    pub network: Arc<dyn NetworkPlane>,
    pub environment: RwLock<Option<api::SetEnvironmentRequest>>,
    pub pool_snapshot: Arc<RwLock<IpamPoolMonitorStateSnapshot>>,
}

impl CnsState {
    pub fn new(
        node_name: &str,
        local_ip: &str,
        store: IpConfigStore,
        network: Arc<dyn NetworkPlane>,
    ) -> CnsState {
        CnsState {
            node_name: node_name.to_string(),
            local_ip: local_ip.to_string(),
            store,
            network,
            environment: RwLock::new(None),
            pool_snapshot: Arc::new(RwLock::new(IpamPoolMonitorStateSnapshot::default())),
        }
    }
}

/// Registers every route of the request surface; mounted under each version
/// prefix by the server.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource(api::SET_ENVIRONMENT_PATH).route(web::post().to(set_environment)))
        .service(web::resource(api::CREATE_NETWORK_PATH).route(web::post().to(create_network)))
        .service(web::resource(api::DELETE_NETWORK_PATH).route(web::post().to(delete_network)))
        .service(
            web::resource(api::CREATE_HNS_NETWORK_PATH).route(web::post().to(create_hns_network)),
        )
        .service(
            web::resource(api::DELETE_HNS_NETWORK_PATH).route(web::post().to(delete_hns_network)),
        )
        .service(
            web::resource(api::RESERVE_IP_ADDRESS_PATH).route(web::post().to(reserve_ip_address)),
        )
        .service(
            web::resource(api::RELEASE_IP_ADDRESS_PATH).route(web::post().to(release_ip_address)),
        )
        .service(web::resource(api::GET_HOST_LOCAL_IP_PATH).route(web::get().to(host_local_ip)))
        .service(
            web::resource(api::GET_IP_ADDRESS_UTILIZATION_PATH)
                .route(web::get().to(ip_address_utilization)),
        )
        .service(
            web::resource(api::GET_UNHEALTHY_IP_ADDRESSES_PATH)
                .route(web::get().to(unhealthy_ip_addresses)),
        )
        .service(web::resource(api::GET_HEALTH_REPORT_PATH).route(web::get().to(health_report)))
        .service(web::resource(api::NUMBER_OF_CPU_CORES_PATH).route(web::get().to(cpu_cores)))
        .service(
            web::resource(api::CREATE_HOST_NC_APIPA_ENDPOINT_PATH)
                .route(web::post().to(create_host_nc_apipa_endpoint)),
        )
        .service(
            web::resource(api::DELETE_HOST_NC_APIPA_ENDPOINT_PATH)
                .route(web::post().to(delete_host_nc_apipa_endpoint)),
        )
        .service(
            web::resource(api::NM_AGENT_SUPPORTED_APIS_PATH)
                .route(web::post().to(nm_agent_supported_apis)),
        );
}

fn plane_response(result: Result<(), Error>) -> Response {
    match result {
        Ok(()) => Response::success(),
        Err(e @ (Error::UnknownNetwork(_) | Error::UnknownEndpoint(_))) => {
            Response::error(ReturnCode::NotFound, &e.to_string())
        }
        Err(e) => Response::error(ReturnCode::UnexpectedError, &e.to_string()),
    }
}

async fn set_environment(
    state: Data<CnsState>,
    req: Json<api::SetEnvironmentRequest>,
) -> impl Responder {
    tracing::info!(
        location = req.location,
        network_type = req.network_type,
        "Set environment"
    );
    match state.environment.write() {
        Ok(mut environment) => {
            *environment = Some(req.into_inner());
            HttpResponse::Ok().json(Response::success())
        }
        Err(_) => HttpResponse::Ok().json(Response::error(
            ReturnCode::UnexpectedError,
            "state lock poisoned",
        )),
    }
}

async fn create_network(
    state: Data<CnsState>,
    req: Json<api::CreateNetworkRequest>,
) -> impl Responder {
    tracing::info!(network = req.network_name, "Create network");
    HttpResponse::Ok().json(plane_response(
        state.network.create_network(&req.network_name).await,
    ))
}

async fn delete_network(
    state: Data<CnsState>,
    req: Json<api::DeleteNetworkRequest>,
) -> impl Responder {
    tracing::info!(network = req.network_name, "Delete network");
    HttpResponse::Ok().json(plane_response(
        state.network.delete_network(&req.network_name).await,
    ))
}

async fn create_hns_network(
    state: Data<CnsState>,
    req: Json<api::CreateHnsNetworkRequest>,
) -> impl Responder {
    tracing::info!(network = req.network_name, "Create HNS network");
    HttpResponse::Ok().json(plane_response(
        state.network.create_network(&req.network_name).await,
    ))
}

async fn delete_hns_network(
    state: Data<CnsState>,
    req: Json<api::DeleteHnsNetworkRequest>,
) -> impl Responder {
    tracing::info!(network = req.network_name, "Delete HNS network");
    HttpResponse::Ok().json(plane_response(
        state.network.delete_network(&req.network_name).await,
    ))
}

async fn reserve_ip_address(
    state: Data<CnsState>,
    req: Json<api::ReserveIpAddressRequest>,
) -> impl Responder {
    if req.reservation_id.is_empty() {
        return HttpResponse::Ok().json(api::ReserveIpAddressResponse {
            response: Response::error(ReturnCode::InvalidParameter, "empty ReservationID"),
            ip_address: String::new(),
        });
    }
    let pod_info = PodInfo::from_reservation_id(&req.reservation_id);
    match state.store.assign(pod_info) {
        Ok(record) => HttpResponse::Ok().json(api::ReserveIpAddressResponse {
            response: Response::success(),
            ip_address: record.ip_address,
        }),
        Err(IpamError::PoolExhausted) => HttpResponse::Ok().json(api::ReserveIpAddressResponse {
            response: Response::error(ReturnCode::AddressUnavailable, "No available IP addresses"),
            ip_address: String::new(),
        }),
        Err(e) => HttpResponse::Ok().json(api::ReserveIpAddressResponse {
            response: Response::error(ReturnCode::UnexpectedError, &e.to_string()),
            ip_address: String::new(),
        }),
    }
}

async fn release_ip_address(
    state: Data<CnsState>,
    req: Json<api::ReleaseIpAddressRequest>,
) -> impl Responder {
    if req.reservation_id.is_empty() {
        return HttpResponse::Ok().json(Response::error(
            ReturnCode::InvalidParameter,
            "empty ReservationID",
        ));
    }
    let pod_key = PodInfo::from_reservation_id(&req.reservation_id).pod_key();
    // releasing an unknown reservation is a success, not an error
    match state.store.release(&pod_key) {
        Ok(_) => HttpResponse::Ok().json(Response::success()),
        Err(e) => {
            HttpResponse::Ok().json(Response::error(ReturnCode::UnexpectedError, &e.to_string()))
        }
    }
}

async fn host_local_ip(state: Data<CnsState>) -> impl Responder {
    HttpResponse::Ok().json(api::HostLocalIpAddressResponse {
        response: Response::success(),
        ip_address: state.local_ip.clone(),
    })
}

async fn ip_address_utilization(state: Data<CnsState>) -> impl Responder {
    match state.store.counts() {
        Ok(counts) => HttpResponse::Ok().json(api::IpAddressesUtilizationResponse {
            response: Response::success(),
            available: counts.available,
            reserved: counts.allocated,
            unhealthy: counts.pending_release,
        }),
        Err(e) => HttpResponse::Ok().json(api::IpAddressesUtilizationResponse {
            response: Response::error(ReturnCode::UnexpectedError, &e.to_string()),
            available: 0,
            reserved: 0,
            unhealthy: 0,
        }),
    }
}

async fn unhealthy_ip_addresses(state: Data<CnsState>) -> impl Responder {
    match state.store.records_in_state(IpState::PendingRelease) {
        Ok(records) => HttpResponse::Ok().json(api::GetIpAddressesResponse {
            response: Response::success(),
            ip_addresses: records.into_iter().map(|r| r.ip_address).collect(),
        }),
        Err(e) => HttpResponse::Ok().json(api::GetIpAddressesResponse {
            response: Response::error(ReturnCode::UnexpectedError, &e.to_string()),
            ip_addresses: vec![],
        }),
    }
}

async fn health_report() -> impl Responder {
    HttpResponse::Ok().json(Response {
        return_code: ReturnCode::Success,
        message: "Active".to_string(),
    })
}

async fn cpu_cores() -> impl Responder {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1);
    HttpResponse::Ok().json(api::NumOfCpuCoresResponse {
        response: Response::success(),
        num_of_cpu_cores: cores,
    })
}

async fn create_host_nc_apipa_endpoint(
    state: Data<CnsState>,
    req: Json<api::CreateHostNcApipaEndpointRequest>,
) -> impl Responder {
    if req.network_container_id.is_empty() {
        return HttpResponse::Ok().json(api::CreateHostNcApipaEndpointResponse {
            response: Response::error(ReturnCode::InvalidParameter, "empty NetworkContainerID"),
            endpoint_id: String::new(),
        });
    }
    if let Err(e) = state.network.create_network(HOST_NC_APIPA_NETWORK).await {
        return HttpResponse::Ok().json(api::CreateHostNcApipaEndpointResponse {
            response: Response::error(ReturnCode::UnexpectedError, &e.to_string()),
            endpoint_id: String::new(),
        });
    }
    match state
        .network
        .create_endpoint(HOST_NC_APIPA_NETWORK, &req.network_container_id)
        .await
    {
        Ok(endpoint_id) => HttpResponse::Ok().json(api::CreateHostNcApipaEndpointResponse {
            response: Response::success(),
            endpoint_id,
        }),
        Err(e) => HttpResponse::Ok().json(api::CreateHostNcApipaEndpointResponse {
            response: Response::error(ReturnCode::UnexpectedError, &e.to_string()),
            endpoint_id: String::new(),
        }),
    }
}

async fn delete_host_nc_apipa_endpoint(
    state: Data<CnsState>,
    req: Json<api::DeleteHostNcApipaEndpointRequest>,
) -> impl Responder {
    let endpoint_id = format!("{HOST_NC_APIPA_NETWORK}-{}", req.network_container_id);
    HttpResponse::Ok().json(api::DeleteHostNcApipaEndpointResponse {
        response: plane_response(state.network.delete_endpoint(&endpoint_id).await),
    })
}

async fn nm_agent_supported_apis(
    _req: Json<api::NmAgentSupportedApisRequest>,
) -> impl Responder {
    HttpResponse::Ok().json(api::NmAgentSupportedApisResponse {
        response: Response::success(),
        supported_apis: SUPPORTED_HOST_AGENT_APIS
            .iter()
            .map(|s| s.to_string())
            .collect(),
    })
}
