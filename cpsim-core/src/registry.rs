//! Charge point registry
//!
//! Owned by the application root and passed to whatever needs to address a specific
//! charge point. Each entry is an independent engine; the registry only keeps them
//! addressable by a short id and a display label.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::charge_point::ChargePoint;
use crate::config::SimulatorConfig;
use crate::error::EngineError;
use crate::persistence::StateStore;
use crate::transport::Transport;

/// Central system URL for charge points added without one
pub const DEFAULT_CSMS_URL: &str = "ws://localhost:9000/ocpp/";

pub struct RegistryEntry {
    pub id: String,
    pub label: String,
    pub charge_point: ChargePoint,
}

pub struct ChargePointRegistry {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn StateStore>>,
    /// Newest first
    entries: Vec<RegistryEntry>,
}

impl ChargePointRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            store: None,
            entries: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build and register a charge point; returns its registry id
    pub async fn add(
        &mut self,
        label: Option<String>,
        config: SimulatorConfig,
    ) -> Result<String, EngineError> {
        let id = self.fresh_id();
        self.add_with_id(id, label, config).await
    }

    /// Register a charge point with the default URL and a `SIM_<id>` identity
    pub async fn add_default(&mut self, label: Option<String>) -> Result<String, EngineError> {
        let id = self.fresh_id();
        let config = SimulatorConfig::new(format!("SIM_{}", id), DEFAULT_CSMS_URL);
        self.add_with_id(id, label, config).await
    }

    async fn add_with_id(
        &mut self,
        id: String,
        label: Option<String>,
        config: SimulatorConfig,
    ) -> Result<String, EngineError> {
        let label = label
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| format!("CP {}", id));

        let mut builder = ChargePoint::builder(config).transport(self.transport.clone());
        if let Some(store) = &self.store {
            builder = builder.store(store.clone());
        }
        let charge_point = builder.build().await?;

        info!("Registered {} ({}) as {}", label, charge_point.cp_id(), id);
        self.entries.insert(
            0,
            RegistryEntry {
                id: id.clone(),
                label,
                charge_point,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&ChargePoint> {
        self.entry(id).map(|entry| &entry.charge_point)
    }

    pub fn entry(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn label(&self, id: &str) -> Option<&str> {
        self.entry(id).map(|entry| entry.label.as_str())
    }

    /// Returns false if no entry has this id
    pub fn rename(&mut self, id: &str, label: impl Into<String>) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.label = label.into();
                true
            }
            None => false,
        }
    }

    /// Disconnect and drop a charge point
    pub async fn remove(&mut self, id: &str) -> Option<RegistryEntry> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        let entry = self.entries.remove(index);
        entry.charge_point.disconnect().await;
        info!("Removed {} ({})", entry.label, entry.id);
        Some(entry)
    }

    /// Registry ids, newest first
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh_id(&self) -> String {
        loop {
            let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
            if self.entry(&id).is_none() {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_add_get_rename_remove() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let mut registry = ChargePointRegistry::new(Arc::new(transport));

        let first = registry
            .add(None, SimulatorConfig::new("CP-A", "ws://csms/ocpp"))
            .await
            .unwrap();
        let second = registry
            .add(Some("Garage".into()), SimulatorConfig::new("CP-B", "ws://csms/ocpp"))
            .await
            .unwrap();

        assert_eq!(first.len(), 8);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![second.clone(), first.clone()]);
        assert_eq!(registry.label(&first), Some(format!("CP {}", first).as_str()));
        assert_eq!(registry.label(&second), Some("Garage"));

        assert!(registry.rename(&first, "Street"));
        assert!(!registry.rename("missing", "x"));
        assert_eq!(registry.label(&first), Some("Street"));

        // Connect the first one so removal has something to close
        let cp = registry.get(&first).unwrap().clone();
        let connecting = tokio::spawn({
            let cp = cp.clone();
            async move { cp.connect().await }
        });
        let peer = acceptor.accept().await.unwrap();
        assert_eq!(peer.url(), "ws://csms/ocpp/CP-A");
        peer.open().await;
        connecting.await.unwrap().unwrap();

        let removed = registry.remove(&first).await.unwrap();
        assert_eq!(removed.label, "Street");
        assert_eq!(cp.connection_state(), ConnectionState::Disconnected);
        assert_eq!(registry.ids(), vec![second]);
        assert!(registry.remove(&first).await.is_none());
    }

    #[tokio::test]
    async fn test_add_default_identity() {
        let (transport, _acceptor) = MemoryTransport::new();
        let mut registry = ChargePointRegistry::new(Arc::new(transport));

        let id = registry.add_default(None).await.unwrap();
        let cp = registry.get(&id).unwrap();
        assert_eq!(cp.cp_id(), format!("SIM_{}", id));
        assert_eq!(cp.config().csms_url, DEFAULT_CSMS_URL);
        assert_eq!(registry.label(&id), Some(format!("CP {}", id).as_str()));
    }
}
