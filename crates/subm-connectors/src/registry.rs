//! Typed connector registry with a mandatory fallback.
//!
//! Lookup never returns "no connector": an unset or unknown key resolves to
//! the generic manual-packet connector, so every directory is submittable.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connector::Connector;
use crate::form_directory::FormDirectoryConnector;
use crate::manual_packet::ManualPacketConnector;

#[derive(Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
    fallback: Arc<dyn Connector>,
}

impl ConnectorRegistry {
    /// Empty registry with the given fallback. Prefer `Default` which wires
    /// the built-in connectors.
    pub fn new(fallback: Arc<dyn Connector>) -> Self {
        Self {
            connectors: HashMap::new(),
            fallback,
        }
    }

    /// Register a connector under its own key, replacing any previous one.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.key().to_string(), connector);
    }

    /// Resolve a directory's declared key; unset or unknown keys fall back.
    pub fn get(&self, key: Option<&str>) -> Arc<dyn Connector> {
        key.and_then(|k| self.connectors.get(k).cloned())
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Registered keys, sorted, fallback included.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connectors.keys().cloned().collect();
        let fallback_key = self.fallback.key().to_string();
        if !keys.contains(&fallback_key) {
            keys.push(fallback_key);
        }
        keys.sort();
        keys
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        let mut registry = Self::new(Arc::new(ManualPacketConnector));
        registry.register(Arc::new(ManualPacketConnector));
        registry.register(Arc::new(FormDirectoryConnector));
        registry
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.list())
            .field("fallback", &self.fallback.key())
            .finish()
    }
}
