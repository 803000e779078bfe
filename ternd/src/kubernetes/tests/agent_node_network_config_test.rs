use std::sync::Arc;

use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use tokio::sync::mpsc::unbounded_channel;

use ternd_ipam::record::{IpState, PodInfo};
use ternd_ipam::store::IpConfigStore;
use ternd_kubernetes::{
    agent::reconciler::node_network_config::{self, AssumeProgrammed, PoolComponents},
    context::{Ctx, State},
    crd::node_network_config::NodeNetworkConfig,
    fixture::{
        reconciler::{test_node_network_config, test_node_network_config_empty, TEST_NODE},
        test_trace,
    },
};

use crate::common::{cleanup_kind, setup_kind};

mod common;

#[tokio::test]
#[ignore = "use kind cluster"]
async fn integration_test_node_network_config() {
    tracing::info!("Creating a kind cluster");
    setup_kind();

    test_trace().await;

    tracing::info!("Getting kube client");
    let client = Client::try_default().await.unwrap();

    tracing::info!("Preparing components");
    let store = IpConfigStore::new();
    let (sender, mut receiver) = unbounded_channel::<NodeNetworkConfig>();
    let components = Arc::new(PoolComponents::new(
        store.clone(),
        sender,
        Arc::new(AssumeProgrammed),
    ));

    let ctx = State::default().to_context_with(client.clone(), 30, components.clone());

    tracing::info!("Creating a NodeNetworkConfig resource");
    let nnc = test_node_network_config_empty(16);
    let nnc_api = Api::<NodeNetworkConfig>::all(ctx.client().clone());
    let ssapply = PatchParams::apply("ctrltest");
    let nnc_patch = Patch::Apply(nnc.clone());
    nnc_api
        .patch(&nnc.name_any(), &ssapply, &nnc_patch)
        .await
        .unwrap();

    tracing::info!("Writing the allocator-side status");
    let mut announced = nnc_api.get(TEST_NODE).await.unwrap();
    announced.status = test_node_network_config(16, 4).status;
    nnc_api
        .replace_status(
            TEST_NODE,
            &PostParams::default(),
            serde_json::to_vec(&announced).unwrap(),
        )
        .await
        .unwrap();

    tracing::info!("Reconciling NodeNetworkConfig");
    let applied = nnc_api.get(TEST_NODE).await.unwrap();
    node_network_config::reconciler(Arc::new(applied.clone()), ctx.clone())
        .await
        .unwrap();

    tracing::info!("Receiving the notification");
    let received = receiver.recv().await.unwrap();
    assert_eq!(received.name_any(), applied.name_any());

    tracing::info!("Checking announced IPs are available");
    let counts = store.counts().unwrap();
    assert_eq!(counts.available, 4);
    assert_eq!(counts.pending_programming, 0);

    tracing::info!("Reserving and releasing an IP");
    let record = store
        .assign(PodInfo::new("test-namespace", "test-pod"))
        .unwrap();
    assert_eq!(record.state, IpState::Allocated);
    store.release("test-namespace/test-pod").unwrap();

    tracing::info!("Reconciling the same announcement is idempotent");
    node_network_config::reconciler(Arc::new(applied), ctx.clone())
        .await
        .unwrap();
    assert_eq!(store.counts().unwrap().available, 4);

    tracing::info!("Cleaning up a kind cluster");
    cleanup_kind();
}
