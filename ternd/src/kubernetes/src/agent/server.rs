use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::mpsc::unbounded_channel;

use ternd_cns::api as cns_api;
use ternd_cns::hostnet::MemoryNetworkPlane;
use ternd_cns::service::{self, CnsState};
use ternd_ipam::state_file::{self, FileLock};
use ternd_ipam::store::IpConfigStore;
use ternd_npm::dataplane::HostDataplane;
use ternd_npm::shim::LinuxHostPlane;
use ternd_trace::init::{prepare_tracing, TraceConfig};

use crate::agent::reconciler::namespace::NamespaceCache;
use crate::agent::reconciler::network_policy::NetworkPolicyController;
use crate::agent::reconciler::node_network_config::{
    AssumeProgrammed, PoolComponents, ENV_HOSTNAME,
};
use crate::agent::reconciler::pod::PodController;
use crate::agent::reconciler::pool::PoolMonitor;
use crate::agent::reconciler::{self, namespace::NamespaceController};
use crate::context::State;

use super::config::Config;

pub const ENV_NODE_IP: &str = "NODE_IP";

const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

pub fn start(config: Config, trace: TraceConfig) {
    let agent = Agent::new(config);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(agent, trace));
}

#[tracing::instrument(skip_all)]
async fn run(a: Agent, trace_config: TraceConfig) {
    prepare_tracing(trace_config).await;

    // Initialize Kubernetes controller state
    let state = State::new("ternd-agent");

    let node_name = std::env::var(ENV_HOSTNAME).expect("HOSTNAME environment value is not set");
    let local_ip = std::env::var(ENV_NODE_IP).unwrap_or_default();

    // Restore the persisted IP state; the NNC reconciler resolves any
    // divergence against the announced truth on its first pass.
    let store = IpConfigStore::new();
    let mut lock = FileLock::new(Path::new(&a.lock_file)).expect("Failed to prepare the state lock");
    let records = state_file::load(Path::new(&a.state_file), &mut lock)
        .expect("Failed to load the IP state file");
    store
        .replace_all(records)
        .expect("Persisted IP state is inconsistent");

    let dataplane = Arc::new(HostDataplane::new(
        &node_name,
        Arc::new(LinuxHostPlane::new()),
    ));
    dataplane
        .initialize()
        .await
        .expect("Failed to reset the dataplane");

    tracing::info!("Start Agent Reconcilers");

    let namespace_cache = Arc::new(NamespaceCache::default());
    let pod_controller = Arc::new(PodController::new(dataplane.clone(), namespace_cache.clone()));
    let namespace_controller = Arc::new(NamespaceController::new(
        dataplane.clone(),
        namespace_cache.clone(),
    ));
    let policy_controller = Arc::new(NetworkPolicyController::new(dataplane.clone()));

    tokio::spawn(reconciler::pod::run(pod_controller.clone()));
    tokio::spawn(reconciler::namespace::run(namespace_controller.clone()));
    tokio::spawn(reconciler::network_policy::run(policy_controller.clone()));

    // IP pool: NNC reconciler feeding the pool monitor
    let (sender, receiver) = unbounded_channel();
    let components = Arc::new(PoolComponents::new(
        store.clone(),
        sender,
        Arc::new(AssumeProgrammed),
    ));
    let nnc_state = state.clone();
    let nnc_components = components.clone();
    let requeue_interval = a.requeue_interval;
    tokio::spawn(async move {
        reconciler::node_network_config::run(nnc_state, requeue_interval, nnc_components).await;
    });

    let kube_client = Client::try_default()
        .await
        .expect("Failed to create kube client");
    let cns_state = Data::new(CnsState::new(
        &node_name,
        &local_ip,
        store.clone(),
        Arc::new(MemoryNetworkPlane::new()),
    ));

    let mut monitor = PoolMonitor::new(
        kube_client,
        store.clone(),
        Duration::from_secs(a.pool_interval),
        receiver,
        cns_state.pool_snapshot.clone(),
    );
    tokio::spawn(async move {
        monitor.run().await;
    });

    // Periodic persistence of the IP state
    let persist_store = store.clone();
    let state_path = a.state_file.clone();
    let lock_path = a.lock_file.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = match persist_store.snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to snapshot the IP state");
                    continue;
                }
            };
            let mut lock = match FileLock::new(Path::new(&lock_path)) {
                Ok(lock) => lock,
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to prepare the state lock");
                    continue;
                }
            };
            if let Err(e) = state_file::save(
                Path::new(&state_path),
                snapshot.into_values(),
                &mut lock,
            ) {
                tracing::warn!(error = ?e, "Failed to persist the IP state");
            }
        }
    });

    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(cns_state.clone())
            .app_data(Data::new(server_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .service(web::scope(cns_api::V1_PREFIX).configure(service::routes))
            .service(web::scope(cns_api::V2_PREFIX).configure(service::routes))
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind(format!("0.0.0.0:{}", a.http_port))
    .unwrap()
    .shutdown_timeout(5);

    tracing::info!(http_port = a.http_port, "Agent server is running.");

    server.run().await.unwrap()
}

pub struct Agent {
    http_port: u32,
    requeue_interval: u64,
    pool_interval: u64,
    state_file: String,
    lock_file: String,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self {
            http_port: config.http_port,
            requeue_interval: config.requeue_interval,
            pool_interval: config.pool_interval,
            state_file: config.state_file,
            lock_file: config.lock_file,
        }
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&metrics, &mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}
