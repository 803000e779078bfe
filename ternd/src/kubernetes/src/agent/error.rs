use ternd_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),

    #[error("Failed to get lock")]
    FailedToGetLock,

    #[error("Var Error: {0}")]
    Var(#[source] std::env::VarError),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("config error")]
    Config(#[from] ConfigError),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Kubernetes Library Error: {0}")]
    KubeLibrary(#[source] crate::error::Error),

    #[error("Ipam Error: {0}")]
    Ipam(#[source] ternd_ipam::error::Error),

    #[error("Dataplane Error: {0}")]
    Dataplane(#[source] ternd_npm::error::Error),

    #[error("Missing fields: {0}")]
    MissingFields(String),

    #[error("Failed to notify")]
    FailedToNotify,

    #[error("NodeNetworkConfig update did not converge")]
    NncUpdateStuck,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Pool is halted by an inconsistent IP state")]
    PoolHalted,
}

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("already configured")]
    AlreadyConfigured,
    #[error("failed to load")]
    FailedToLoad,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid data")]
    InvalidData,
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
