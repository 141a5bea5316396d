//! Find a connection, wherever it lives.
//!
//! The gateway checks its own registry before asking Redis which replica
//! owns a pair; `job_receiver` owns no sessions and only asks Redis.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::metrics;
use crate::proxy::ProxyFactory;
use crate::registry::{GlobalRegistry, LocalRegistry};
use crate::session::Sessionlike;

/// Node ids per account, both sorted.
pub type ConnectionList = BTreeMap<String, Vec<String>>;

#[async_trait]
pub trait ConnectionLocator: Send + Sync {
    async fn locate(
        &self,
        account: &str,
        node_id: &str,
        request_id: &str,
    ) -> Option<Arc<dyn Sessionlike>>;

    async fn list(&self) -> ConnectionList;
}

pub struct LocalLocator {
    registry: LocalRegistry,
}

impl LocalLocator {
    pub fn new(registry: LocalRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ConnectionLocator for LocalLocator {
    async fn locate(
        &self,
        account: &str,
        node_id: &str,
        _request_id: &str,
    ) -> Option<Arc<dyn Sessionlike>> {
        let session = self.registry.get(account, node_id).await?;
        Some(session)
    }

    async fn list(&self) -> ConnectionList {
        self.registry
            .get_all()
            .await
            .into_iter()
            .map(|(account, nodes)| {
                let mut nodes: Vec<String> = nodes.into_keys().collect();
                nodes.sort();
                (account, nodes)
            })
            .collect()
    }
}

/// Resolves the owning replica through the global registry and hands back
/// a proxy to it.
pub struct RedisLocator {
    global: Arc<dyn GlobalRegistry>,
    proxies: ProxyFactory,
}

impl RedisLocator {
    pub fn new(global: Arc<dyn GlobalRegistry>, proxies: ProxyFactory) -> Self {
        Self { global, proxies }
    }

    async fn owner(&self, account: &str, node_id: &str) -> Option<String> {
        match self.global.get(account, node_id).await {
            Ok(owner) => owner,
            Err(e) => {
                metrics::redis_lookup_failed();
                warn!(account = %account, node_id = %node_id, error = %e, "Connection lookup failed");
                None
            }
        }
    }

    fn proxy(
        &self,
        hostname: &str,
        account: &str,
        node_id: &str,
        request_id: &str,
    ) -> Arc<dyn Sessionlike> {
        debug!(account = %account, node_id = %node_id, hostname = %hostname, "Proxying to owning gateway");
        Arc::new(self.proxies.connect(hostname, account, node_id, request_id))
    }
}

#[async_trait]
impl ConnectionLocator for RedisLocator {
    async fn locate(
        &self,
        account: &str,
        node_id: &str,
        request_id: &str,
    ) -> Option<Arc<dyn Sessionlike>> {
        let owner = self.owner(account, node_id).await?;
        Some(self.proxy(&owner, account, node_id, request_id))
    }

    async fn list(&self) -> ConnectionList {
        match self.global.get_all().await {
            Ok(all) => all
                .into_iter()
                .map(|(account, nodes)| {
                    let mut nodes: Vec<String> = nodes.into_keys().collect();
                    nodes.sort();
                    (account, nodes)
                })
                .collect(),
            Err(e) => {
                metrics::redis_lookup_failed();
                warn!(error = %e, "Unable to list connections");
                ConnectionList::new()
            }
        }
    }
}

/// Local registry first, then Redis. A claim that names this replica but
/// has no local session is treated as absent.
pub struct LayeredLocator {
    local: LocalLocator,
    remote: RedisLocator,
    hostname: String,
}

impl LayeredLocator {
    pub fn new(local: LocalLocator, remote: RedisLocator, hostname: String) -> Self {
        Self {
            local,
            remote,
            hostname,
        }
    }
}

#[async_trait]
impl ConnectionLocator for LayeredLocator {
    async fn locate(
        &self,
        account: &str,
        node_id: &str,
        request_id: &str,
    ) -> Option<Arc<dyn Sessionlike>> {
        if let Some(session) = self.local.locate(account, node_id, request_id).await {
            return Some(session);
        }
        let owner = self.remote.owner(account, node_id).await?;
        if owner == self.hostname {
            debug!(account = %account, node_id = %node_id, "Claim names this gateway but no session is live");
            return None;
        }
        Some(self.remote.proxy(&owner, account, node_id, request_id))
    }

    async fn list(&self) -> ConnectionList {
        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (account, nodes) in self.local.list().await.into_iter().chain(self.remote.list().await) {
            merged.entry(account).or_default().extend(nodes);
        }
        merged
            .into_iter()
            .map(|(account, nodes)| (account, nodes.into_iter().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::registry::MemoryRegistry;
    use crate::session::tests::test_session;

    fn proxies() -> ProxyFactory {
        ProxyFactory::new(&ProxyConfig {
            scheme: "http".into(),
            port: 9090,
            timeout_secs: 1,
            client_id: "gateway".into(),
            psk: "s3cret".into(),
        })
        .unwrap()
    }

    async fn layered(global: &MemoryRegistry) -> (LayeredLocator, LocalRegistry) {
        let local = LocalRegistry::new();
        let locator = LayeredLocator::new(
            LocalLocator::new(local.clone()),
            RedisLocator::new(Arc::new(global.clone()), proxies()),
            "pod-1".into(),
        );
        (locator, local)
    }

    #[tokio::test]
    async fn test_local_hit_wins() {
        let global = MemoryRegistry::new();
        let (locator, local) = layered(&global).await;
        let (session, _rx) = test_session("01", "node-a", 1);
        local.register("01", "node-a", session).await;

        let found = locator.locate("01", "node-a", "req-1").await.unwrap();
        assert_eq!(
            found.capabilities().await.unwrap(),
            serde_json::json!({"worker": ["ansible"]})
        );
    }

    #[tokio::test]
    async fn test_miss_everywhere() {
        let global = MemoryRegistry::new();
        let (locator, _local) = layered(&global).await;
        assert!(locator.locate("01", "node-a", "req-1").await.is_none());
    }

    #[tokio::test]
    async fn test_claim_naming_self_is_a_miss() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "pod-1").await.unwrap();
        let (locator, _local) = layered(&global).await;
        assert!(locator.locate("01", "node-a", "req-1").await.is_none());
    }

    #[tokio::test]
    async fn test_remote_claim_yields_proxy() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "pod-2").await.unwrap();
        let (locator, _local) = layered(&global).await;
        assert!(locator.locate("01", "node-a", "req-1").await.is_some());

        let remote = RedisLocator::new(Arc::new(global.clone()), proxies());
        assert!(remote.locate("01", "node-a", "req-1").await.is_some());
        assert!(remote.locate("01", "node-b", "req-1").await.is_none());
    }

    #[tokio::test]
    async fn test_list_merges_sorted() {
        let global = MemoryRegistry::new();
        global.register("01", "node-b", "pod-2").await.unwrap();
        global.register("02", "node-c", "pod-2").await.unwrap();
        let (locator, local) = layered(&global).await;
        let (session, _rx) = test_session("01", "node-a", 1);
        local.register("01", "node-a", session).await;

        let list = locator.list().await;
        assert_eq!(list["01"], vec!["node-a".to_string(), "node-b".to_string()]);
        assert_eq!(list["02"], vec!["node-c".to_string()]);

        let local_only = LocalLocator::new(local).list().await;
        assert_eq!(local_only.len(), 1);
    }
}
