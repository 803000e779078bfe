use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Ipam Error: {0}")]
    Ipam(#[from] ternd_ipam::error::Error),

    #[error("Network does not exist: {0}")]
    UnknownNetwork(String),

    #[error("Endpoint does not exist: {0}")]
    UnknownEndpoint(String),

    #[error("Network already exists: {0}")]
    NetworkExists(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
