use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::Error;

/// Host network capability interface behind the legacy network routes.
/// Implementations wrap the platform's compute-network API; tests use the
/// recording fake below.
#[async_trait]
pub trait NetworkPlane: Send + Sync {
    async fn create_network(&self, name: &str) -> Result<(), Error>;
    async fn delete_network(&self, name: &str) -> Result<(), Error>;
    /// Returns the created endpoint id.
    async fn create_endpoint(&self, network: &str, name: &str) -> Result<String, Error>;
    async fn delete_endpoint(&self, id: &str) -> Result<(), Error>;
    async fn apply_endpoint_policy(
        &self,
        id: &str,
        policy: &serde_json::Value,
    ) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default)]
struct FakeEndpoint {
    network: String,
    policies: Vec<serde_json::Value>,
}

/// In-memory plane mirroring what the host would carry.
#[derive(Debug, Default)]
pub struct MemoryNetworkPlane {
    networks: Mutex<Vec<String>>,
    endpoints: Mutex<HashMap<String, FakeEndpoint>>,
}

impl MemoryNetworkPlane {
    pub fn new() -> MemoryNetworkPlane {
        MemoryNetworkPlane::default()
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().unwrap().clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn endpoint_network(&self, id: &str) -> Option<String> {
        self.endpoints
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.network.clone())
    }

    pub fn endpoint_policy_count(&self, id: &str) -> usize {
        self.endpoints
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.policies.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl NetworkPlane for MemoryNetworkPlane {
    async fn create_network(&self, name: &str) -> Result<(), Error> {
        let mut networks = self.networks.lock().unwrap();
        if !networks.iter().any(|n| n == name) {
            networks.push(name.to_string());
        }
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<(), Error> {
        let mut networks = self.networks.lock().unwrap();
        match networks.iter().position(|n| n == name) {
            Some(idx) => {
                networks.remove(idx);
                Ok(())
            }
            None => Err(Error::UnknownNetwork(name.to_string())),
        }
    }

    async fn create_endpoint(&self, network: &str, name: &str) -> Result<String, Error> {
        if !self.networks.lock().unwrap().iter().any(|n| n == network) {
            return Err(Error::UnknownNetwork(network.to_string()));
        }
        let id = format!("{network}-{name}");
        self.endpoints.lock().unwrap().insert(
            id.clone(),
            FakeEndpoint {
                network: network.to_string(),
                policies: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn delete_endpoint(&self, id: &str) -> Result<(), Error> {
        match self.endpoints.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownEndpoint(id.to_string())),
        }
    }

    async fn apply_endpoint_policy(
        &self,
        id: &str,
        policy: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = endpoints
            .get_mut(id)
            .ok_or_else(|| Error::UnknownEndpoint(id.to_string()))?;
        endpoint.policies.push(policy.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn works_network_and_endpoint_lifecycle() {
        let plane = MemoryNetworkPlane::new();
        plane.create_network("overlay0").await.unwrap();
        // duplicate create is idempotent
        plane.create_network("overlay0").await.unwrap();
        assert_eq!(plane.networks(), vec!["overlay0"]);

        let id = plane.create_endpoint("overlay0", "nc-1").await.unwrap();
        assert_eq!(plane.endpoint_network(&id).unwrap(), "overlay0");
        plane
            .apply_endpoint_policy(&id, &serde_json::json!({"Type": "OutBoundNAT"}))
            .await
            .unwrap();
        assert_eq!(plane.endpoint_policy_count(&id), 1);
        plane.delete_endpoint(&id).await.unwrap();
        plane.delete_network("overlay0").await.unwrap();

        assert!(plane.networks().is_empty());
        assert_eq!(plane.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn fails_endpoint_on_missing_network() {
        let plane = MemoryNetworkPlane::new();
        let err = plane.create_endpoint("overlay0", "nc-1").await.unwrap_err();
        assert!(matches!(err, Error::UnknownNetwork(_)));
    }
}
