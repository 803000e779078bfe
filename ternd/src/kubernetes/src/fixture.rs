// #[cfg(test)]
pub mod reconciler {
    use std::sync::Arc;

    use http::{Request, Response};
    use kube::client::Body;
    use prometheus::Registry;
    use ternd_trace::metrics::Metrics;

    use kube::{core::ObjectMeta, Client};

    use crate::{
        context::{Context, ContextWith},
        crd::node_network_config::{
            IpAssignment, NetworkContainer, NodeNetworkConfig, NodeNetworkConfigSpec,
            NodeNetworkConfigStatus, Scaler,
        },
    };

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(pub ApiServerHandle);

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl Context {
        pub fn test() -> (Arc<Self>, ApiServerVerifier, Registry) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, "default");
            let registry = Registry::default();
            let ctx = Self {
                client: mock_client,
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
            };
            (Arc::new(ctx), ApiServerVerifier(handle), registry)
        }
    }

    impl<T: Clone> ContextWith<T> {
        pub fn test(component: T) -> (Arc<Self>, ApiServerVerifier, Registry) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, "default");
            let registry = Registry::default();
            let ctx = Context {
                client: mock_client,
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
            };
            let ctx_with = Self {
                inner: ctx,
                component,
            };
            (Arc::new(ctx_with), ApiServerVerifier(handle), registry)
        }
    }

    pub const TEST_NODE: &str = "tern-integration-control-plane";

    /// An NNC as the cluster allocator would announce it: `assigned` IPs in
    /// one NC, all at version 1.
    pub fn test_node_network_config(
        requested_ip_count: i64,
        assigned: usize,
    ) -> NodeNetworkConfig {
        NodeNetworkConfig {
            metadata: ObjectMeta {
                name: Some(TEST_NODE.to_string()),
                ..Default::default()
            },
            spec: NodeNetworkConfigSpec {
                requested_ip_count,
                scaler: Scaler {
                    batch_size: 16,
                    min_free_percent: 50,
                    max_free_percent: 100,
                },
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
                            name: format!("{:08}-0000-0000-0000-000000000000", i),
                            ip: format!("10.240.0.{}", i + 4),
                        })
                        .collect(),
                }],
            }),
        }
    }

    /// The same NNC without any status, as freshly created by the operator.
    pub fn test_node_network_config_empty(requested_ip_count: i64) -> NodeNetworkConfig {
        let mut nnc = test_node_network_config(requested_ip_count, 0);
        nnc.status = None;
        nnc
    }
}

pub async fn test_trace() {
    ternd_trace::init::prepare_tracing(ternd_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
    })
    .await;
}
