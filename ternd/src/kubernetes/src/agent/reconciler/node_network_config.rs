use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use tokio::sync::mpsc::UnboundedSender;

use ternd_ipam::error::Error as IpamError;
use ternd_ipam::store::IpConfigStore;

use crate::{
    agent::error::Error,
    context::{error_policy, ContextWith, Ctx, State},
    crd::node_network_config::NodeNetworkConfig,
};

pub const ENV_HOSTNAME: &str = "HOSTNAME";

/// How the agent learns that an announced NC has been programmed on the
/// host, which is what promotes its IPs from `PendingProgramming` to
/// `Available`.
pub trait ProgrammedVersionSource: Send + Sync {
    fn programmed_version(&self, nc_id: &str) -> Option<i64>;
}

/// The host agent programs an announced NC before its status update lands
/// on the apiserver, so the default source reports every NC as programmed.
pub struct AssumeProgrammed;

impl ProgrammedVersionSource for AssumeProgrammed {
    fn programmed_version(&self, _nc_id: &str) -> Option<i64> {
        Some(i64::MAX)
    }
}

/// Shared between the NNC reconciler and the pool monitor.
pub struct PoolComponents {
    pub store: IpConfigStore,
    pub notifier: UnboundedSender<NodeNetworkConfig>,
    pub version_source: Arc<dyn ProgrammedVersionSource>,
    /// Set on a fatal store inconsistency; the reconciler refuses to touch
    /// the pool again until an operator intervenes.
    pub halted: AtomicBool,
}

impl PoolComponents {
    pub fn new(
        store: IpConfigStore,
        notifier: UnboundedSender<NodeNetworkConfig>,
        version_source: Arc<dyn ProgrammedVersionSource>,
    ) -> PoolComponents {
        PoolComponents {
            store,
            notifier,
            version_source,
            halted: AtomicBool::new(false),
        }
    }
}

pub async fn reconciler(
    nnc: Arc<NodeNetworkConfig>,
    ctx: Arc<ContextWith<Arc<PoolComponents>>>,
) -> Result<Action, Error> {
    reconcile(&nnc, ctx).await
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    nnc: &NodeNetworkConfig,
    ctx: Arc<ContextWith<Arc<PoolComponents>>>,
) -> Result<Action, Error> {
    tracing::info!(name = nnc.name_any(), "Reconcile NodeNetworkConfig");

    let component = ctx.component.clone();
    if component.halted.load(Ordering::SeqCst) {
        tracing::error!(
            name = nnc.name_any(),
            "IP pool is halted, ignoring NodeNetworkConfig update"
        );
        return Err(Error::PoolHalted);
    }

    let blocks = nnc.nc_blocks();
    if let Err(e) = component.store.reconcile_from_nnc(&blocks) {
        if matches!(
            e,
            IpamError::InconsistentState(_) | IpamError::DuplicateAddress(_)
        ) {
            component.halted.store(true, Ordering::SeqCst);
            tracing::error!(
                name = nnc.name_any(),
                error = %e,
                "Fatal inconsistency between NodeNetworkConfig and the IP store, halting"
            );
        }
        return Err(Error::Ipam(e));
    }

    for block in &blocks {
        let programmed = component
            .version_source
            .programmed_version(&block.id)
            .unwrap_or(-1);
        if programmed >= block.version {
            let promoted = component
                .store
                .mark_programmed(&block.id)
                .map_err(Error::Ipam)?;
            if promoted > 0 {
                tracing::info!(nc = block.id, count = promoted, "IPs became available");
            }
        }
    }

    component
        .notifier
        .send(nnc.clone())
        .map_err(|_| Error::FailedToNotify)?;

    Ok(Action::await_change())
}

pub async fn run(state: State, interval: u64, components: Arc<PoolComponents>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let nncs = Api::<NodeNetworkConfig>::all(client.clone());
    if let Err(e) = nncs.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    tracing::info!("Start NodeNetworkConfig reconciler");
    let node_name = std::env::var(ENV_HOSTNAME).expect("HOSTNAME environment value is not set");
    let watch_config = Config::default().fields(&format!("metadata.name={node_name}"));

    Controller::new(nncs, watch_config.any_semantic())
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<NodeNetworkConfig, Error, ContextWith<Arc<PoolComponents>>>,
            state.to_context_with::<Arc<PoolComponents>>(client, interval, components),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::fixture::reconciler::test_node_network_config;
    use ternd_ipam::record::{IpState, PodInfo};

    struct FixedVersions(HashMap<String, i64>);

    impl ProgrammedVersionSource for FixedVersions {
        fn programmed_version(&self, nc_id: &str) -> Option<i64> {
            self.0.get(nc_id).copied()
        }
    }

    fn components(
        version_source: Arc<dyn ProgrammedVersionSource>,
    ) -> (
        Arc<PoolComponents>,
        tokio::sync::mpsc::UnboundedReceiver<NodeNetworkConfig>,
    ) {
        let (sender, receiver) = unbounded_channel();
        (
            Arc::new(PoolComponents::new(
                IpConfigStore::new(),
                sender,
                version_source,
            )),
            receiver,
        )
    }

    #[tokio::test]
    async fn works_announced_ips_become_available_and_monitor_is_notified() {
        let (components, mut receiver) = components(Arc::new(AssumeProgrammed));
        let (ctx, _api, _registry) = ContextWith::test(components.clone());

        let nnc = test_node_network_config(16, 2);
        reconcile(&nnc, ctx).await.unwrap();

        let counts = components.store.counts().unwrap();
        assert_eq!(counts.available, 2);
        assert_eq!(counts.pending_programming, 0);
        assert_eq!(receiver.recv().await.unwrap().name_any(), nnc.name_any());
    }

    #[tokio::test]
    async fn works_ips_stay_pending_until_nc_version_catches_up() {
        let source = FixedVersions(HashMap::from([("nc-1".to_string(), 0)]));
        let (components, _receiver) = components(Arc::new(source));
        let (ctx, _api, _registry) = ContextWith::test(components.clone());

        // status announces version 1, the host has only programmed 0
        let nnc = test_node_network_config(16, 2);
        reconcile(&nnc, ctx).await.unwrap();

        let counts = components.store.counts().unwrap();
        assert_eq!(counts.pending_programming, 2);
        assert_eq!(counts.available, 0);
    }

    #[tokio::test]
    async fn fails_and_halts_when_an_allocated_ip_disappears() {
        let (components, _receiver) = components(Arc::new(AssumeProgrammed));
        let (ctx, _api, _registry) = ContextWith::test(components.clone());

        let nnc = test_node_network_config(16, 2);
        reconcile(&nnc, ctx.clone()).await.unwrap();
        components
            .store
            .assign(PodInfo::new("test-namespace", "test-pod"))
            .unwrap();

        // the cluster withdraws every IP, including the allocated one
        let mut shrunk = nnc.clone();
        shrunk.status.as_mut().unwrap().network_containers[0]
            .ip_assignments
            .clear();
        let err = reconcile(&shrunk, ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Ipam(IpamError::InconsistentState(_))));
        assert!(components.halted.load(Ordering::SeqCst));

        // once halted nothing else gets through
        let err = reconcile(&nnc, ctx).await.unwrap_err();
        assert!(matches!(err, Error::PoolHalted));
        assert_eq!(
            components
                .store
                .records_in_state(IpState::Allocated)
                .unwrap()
                .len(),
            1
        );
    }
}
