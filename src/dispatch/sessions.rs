//! Registry of connected sessions.
//!
//! Client sessions are indexed by normalized address so recipient matching is a lookup per
//! recipient rather than a scan over every connection. Delivery nodes are kept in a flat map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::LiveTarget;
use crate::error::RegistryError;

struct ClientEntry {
    address: String,
    target: Arc<dyn LiveTarget>,
}

#[derive(Default)]
struct Sessions {
    clients: HashMap<Uuid, ClientEntry>,
    by_address: HashMap<String, HashSet<Uuid>>,
    nodes: HashMap<Uuid, Arc<dyn LiveTarget>>,
}

pub struct SessionRegistry {
    max_per_address: usize,
    inner: RwLock<Sessions>,
}

impl SessionRegistry {
    pub fn new(max_per_address: usize) -> Self {
        Self {
            max_per_address,
            inner: RwLock::new(Sessions::default()),
        }
    }

    /// Register an end-user session for an already normalized address.
    pub async fn register_client(
        &self,
        address: &str,
        target: Arc<dyn LiveTarget>,
    ) -> Result<Uuid, RegistryError> {
        let mut inner = self.inner.write().await;
        let open = inner.by_address.get(address).map_or(0, HashSet::len);
        if open >= self.max_per_address {
            return Err(RegistryError::TooManyConnections {
                address: address.to_string(),
                limit: self.max_per_address,
            });
        }
        let id = target.id();
        inner
            .by_address
            .entry(address.to_string())
            .or_default()
            .insert(id);
        inner.clients.insert(
            id,
            ClientEntry {
                address: address.to_string(),
                target,
            },
        );
        Ok(id)
    }

    pub async fn register_node(&self, target: Arc<dyn LiveTarget>) -> Uuid {
        let id = target.id();
        self.inner.write().await.nodes.insert(id, target);
        id
    }

    /// Remove a session of either kind. Unknown ids are ignored.
    pub async fn unregister(&self, id: Uuid) {
        let mut inner = self.inner.write().await;
        inner.nodes.remove(&id);
        if let Some(entry) = inner.clients.remove(&id) {
            if let Some(ids) = inner.by_address.get_mut(&entry.address) {
                ids.remove(&id);
                if ids.is_empty() {
                    inner.by_address.remove(&entry.address);
                }
            }
        }
    }

    /// Client sessions bound to any of `addresses`, each at most once.
    pub async fn clients_for(&self, addresses: &[String]) -> Vec<Arc<dyn LiveTarget>> {
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        addresses
            .iter()
            .filter_map(|address| inner.by_address.get(address))
            .flatten()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| inner.clients.get(id))
            .map(|entry| entry.target.clone())
            .collect()
    }

    pub async fn nodes(&self) -> Vec<Arc<dyn LiveTarget>> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}
