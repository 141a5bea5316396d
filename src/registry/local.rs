//! Sessions live on this replica.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::Session;

type Connections = HashMap<String, HashMap<String, Arc<Session>>>;

/// `account -> node_id -> session`.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    connections: Arc<RwLock<Connections>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, returning whichever session held the pair before.
    pub async fn register(
        &self,
        account: &str,
        node_id: &str,
        session: Arc<Session>,
    ) -> Option<Arc<Session>> {
        self.connections
            .write()
            .await
            .entry(account.to_string())
            .or_default()
            .insert(node_id.to_string(), session)
    }

    /// Remove the pair only if it still maps to `session`.
    pub async fn unregister(&self, account: &str, node_id: &str, session: &Arc<Session>) -> bool {
        let mut connections = self.connections.write().await;
        let Some(nodes) = connections.get_mut(account) else {
            return false;
        };
        match nodes.get(node_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                nodes.remove(node_id);
                if nodes.is_empty() {
                    connections.remove(account);
                }
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, account: &str, node_id: &str) -> Option<Arc<Session>> {
        self.connections
            .read()
            .await
            .get(account)
            .and_then(|nodes| nodes.get(node_id))
            .cloned()
    }

    pub async fn get_by_account(&self, account: &str) -> HashMap<String, Arc<Session>> {
        self.connections
            .read()
            .await
            .get(account)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_all(&self) -> Connections {
        self.connections.read().await.clone()
    }
}
