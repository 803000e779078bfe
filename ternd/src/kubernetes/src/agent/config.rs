use std::fs;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, Error};

pub const DEFAULT_HTTP_PORT: u32 = 10090;
pub const DEFAULT_REQUEUE_INTERVAL: u64 = 30 * 60;
pub const DEFAULT_POOL_INTERVAL: u64 = 30;
pub const DEFAULT_STATE_FILE: &str = "/var/lib/ternd/ip-state.json";
pub const DEFAULT_LOCK_FILE: &str = "/var/lib/ternd/ip-state.lock";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub http_port: u32,
    pub requeue_interval: u64,
    pub pool_interval: u64,
    pub state_file: String,
    pub lock_file: String,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        serde_yaml::from_str(&contents).map_err(|_| Error::Config(ConfigError::FailedToLoad))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            pool_interval: DEFAULT_POOL_INTERVAL,
            state_file: DEFAULT_STATE_FILE.to_string(),
            lock_file: DEFAULT_LOCK_FILE.to_string(),
        }
    }
}
