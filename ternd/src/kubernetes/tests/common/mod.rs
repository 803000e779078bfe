// Make sure kind binary is in here
const KIND_BIN: &str = "../../../bin/kind";
const KUBECTL_BIN: &str = "../../../bin/kubectl";
const CRD_MANIFEST: &str = "../../../manifests/crd/tern.yaml";
const KIND_CLUSTER_NAME: &str = "tern-integration";
#[allow(dead_code)]
pub(super) const KIND_NODE_CP: &str = "tern-integration-control-plane";
const KIND_CLUSTER_IMAGE: &str = "kindest/node";
const KIND_CLUSTER_IMAGE_VERSION_ENV: &str = "KIND_NODE_VERSION";

pub fn setup_kind() {
    cleanup_kind_no_output();
    let mut binding = std::process::Command::new(KIND_BIN);
    binding.args(["create", "cluster", "--name", KIND_CLUSTER_NAME]);
    if let Ok(v) = std::env::var(KIND_CLUSTER_IMAGE_VERSION_ENV) {
        binding.args(["--image", &format!("{}:{}", KIND_CLUSTER_IMAGE, v)]);
    };

    let out = binding.output().expect("failed to create kind cluster");
    output_result(out);

    install_crd();

    std::thread::sleep(std::time::Duration::from_secs(2));
}

pub fn cleanup_kind() {
    let out = std::process::Command::new(KIND_BIN)
        .args(["delete", "cluster", "--name", KIND_CLUSTER_NAME])
        .output()
        .expect("failed to delete kind cluster");
    output_result(out);
}

fn cleanup_kind_no_output() {
    let _ = std::process::Command::new(KIND_BIN)
        .args(["delete", "cluster", "--name", KIND_CLUSTER_NAME])
        .output();
}

fn install_crd() {
    let out = std::process::Command::new(KUBECTL_BIN)
        .args(["apply", "-f", CRD_MANIFEST])
        .output()
        .expect("failed to install CRD");
    output_result(out);
}

fn output_result(out: std::process::Output) {
    if !out.status.success() {
        panic!(
            "{}\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
    }
}
