use kube::CustomResourceExt;
use ternd_kubernetes::crd;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&crd::node_network_config::NodeNetworkConfig::crd()).unwrap()
    );
}
