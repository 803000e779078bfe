use std::sync::{Arc, RwLock};
use std::time::Duration;

use kube::{api::PostParams, Api, Client, ResourceExt};
use tokio::sync::mpsc::UnboundedReceiver;

use ternd_cns::api::IpamPoolMonitorStateSnapshot;
use ternd_ipam::scaler::{decide, PoolDecision};
use ternd_ipam::store::IpConfigStore;

use crate::agent::error::Error;
use crate::crd::node_network_config::NodeNetworkConfig;

const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// The single control loop sizing the node's IP pool.
///
/// Fed by NNC watch notifications and a periodic tick. All pool math is in
/// `ternd_ipam::scaler`; this loop only carries state between the store,
/// the NNC spec and the published snapshot.
pub struct PoolMonitor {
    client: Client,
    store: IpConfigStore,
    interval: Duration,
    receiver: UnboundedReceiver<NodeNetworkConfig>,
    snapshot: Arc<RwLock<IpamPoolMonitorStateSnapshot>>,
    cached: Option<NodeNetworkConfig>,
}

impl PoolMonitor {
    pub fn new(
        client: Client,
        store: IpConfigStore,
        interval: Duration,
        receiver: UnboundedReceiver<NodeNetworkConfig>,
        snapshot: Arc<RwLock<IpamPoolMonitorStateSnapshot>>,
    ) -> PoolMonitor {
        PoolMonitor {
            client,
            store,
            interval,
            receiver,
            snapshot,
            cached: None,
        }
    }

    pub async fn run(&mut self) {
        tracing::info!("Start pool monitor");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                nnc = self.receiver.recv() => {
                    match nnc {
                        Some(nnc) => self.cached = Some(nnc),
                        None => {
                            tracing::info!("Notifier closed, stopping pool monitor");
                            return;
                        }
                    }
                }
            }
            if let Err(e) = self.reconcile_pool().await {
                tracing::warn!(error = ?e, "Pool reconcile failed");
            }
        }
    }

    #[tracing::instrument(skip_all)]
    async fn reconcile_pool(&mut self) -> Result<(), Error> {
        let nnc = match self.cached.as_ref() {
            Some(nnc) => nnc.clone(),
            None => return Ok(()),
        };
        let config = nnc.scaler_config();
        let counts = self.store.counts().map_err(Error::Ipam)?;

        self.publish_snapshot(&nnc, config.min_free(), config.max_free(), counts.pending_release);

        // Hysteresis: while a request is outstanding the status has not
        // caught up to the spec, and recomputing would oscillate.
        if nnc.request_outstanding() {
            tracing::debug!(
                requested = nnc.spec.requested_ip_count,
                announced = nnc.announced_ip_count(),
                "Waiting for the allocator to catch up"
            );
            return Ok(());
        }

        match decide(&counts, &config, nnc.spec.requested_ip_count) {
            PoolDecision::NoOp => Ok(()),
            PoolDecision::Expand { requested_ip_count } => {
                tracing::info!(
                    requested_ip_count,
                    free = counts.free(),
                    min_free = config.min_free(),
                    "Request pool expansion"
                );
                self.write_requested_ip_count(&nnc, requested_ip_count).await
            }
            PoolDecision::Contract {
                requested_ip_count,
                release_count,
            } => {
                let marked = self
                    .store
                    .mark_pending_release(release_count as usize)
                    .map_err(Error::Ipam)?;
                let pending = self.store.counts().map_err(Error::Ipam)?.pending_release;
                tracing::info!(
                    requested_ip_count,
                    marked = marked.len(),
                    "Request pool contraction"
                );
                self.publish_snapshot(&nnc, config.min_free(), config.max_free(), pending);
                self.write_requested_ip_count(&nnc, requested_ip_count).await
            }
        }
    }

    fn publish_snapshot(
        &self,
        nnc: &NodeNetworkConfig,
        minimum_free_ips: i64,
        maximum_free_ips: i64,
        updating_ips_not_in_use_count: i64,
    ) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = IpamPoolMonitorStateSnapshot {
                minimum_free_ips,
                maximum_free_ips,
                updating_ips_not_in_use_count,
                cached_nnc: serde_json::to_value(nnc).ok(),
            };
        }
    }

    /// Spec writes are optimistic: a conflict refetches and retries; an
    /// update that does not converge is surfaced and retried on the next
    /// tick.
    async fn write_requested_ip_count(
        &mut self,
        nnc: &NodeNetworkConfig,
        requested_ip_count: i64,
    ) -> Result<(), Error> {
        let api = Api::<NodeNetworkConfig>::all(self.client.clone());
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let mut current = api.get(&nnc.name_any()).await.map_err(Error::Kube)?;
            current.spec.requested_ip_count = requested_ip_count;
            match api
                .replace(&nnc.name_any(), &PostParams::default(), &current)
                .await
            {
                Ok(updated) => {
                    self.cached = Some(updated);
                    return Ok(());
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    tracing::warn!(attempt, "Conflict updating NodeNetworkConfig, retrying");
                }
                Err(e) => return Err(Error::Kube(e)),
            }
        }
        Err(Error::NncUpdateStuck)
    }
}
