//! Redis-backed [`GlobalRegistry`].
//!
//! Registering runs one server-side script: a `SET NX` claim with no expiry
//! and, only when it wins, the three index `SADD`s. Nothing is written when
//! the claim is lost. Unregistering deletes the claim and removes all three
//! members in one `MULTI`/`EXEC`.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::{
    account_member, connections_member, host_member, parse_account_members,
    parse_connection_members, parse_host_members, primary_key, GlobalRegistry, RegistryError,
    CONNECTIONS_SET,
};
use crate::config::RedisConfig;

/// KEYS: primary, connections set, account set, host set.
/// ARGV: hostname, then the member for each of the three sets.
/// Returns nil when claimed, else the current owner.
const CLAIM_SCRIPT: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('SADD', KEYS[2], ARGV[2])
    redis.call('SADD', KEYS[3], ARGV[3])
    redis.call('SADD', KEYS[4], ARGV[4])
    return nil
end
return redis.call('GET', KEYS[1])
";

static CLAIM: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(CLAIM_SCRIPT));

#[derive(Clone)]
pub struct RedisRegistry {
    conn: ConnectionManager,
}

impl RedisRegistry {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, RegistryError> {
        Self::connect_url(&cfg.url()).await
    }

    pub async fn connect_url(url: &str) -> Result<Self, RegistryError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { conn })
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, RegistryError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }
}

#[async_trait]
impl GlobalRegistry for RedisRegistry {
    async fn exists(&self, account: &str, node_id: &str) -> Result<bool, RegistryError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(primary_key(account, node_id))
            .query_async(&mut conn)
            .await?;
        Ok(count != 0)
    }

    async fn register(
        &self,
        account: &str,
        node_id: &str,
        hostname: &str,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = CLAIM
            .key(primary_key(account, node_id))
            .key(CONNECTIONS_SET)
            .key(account)
            .key(hostname)
            .arg(hostname)
            .arg(connections_member(account, node_id, hostname))
            .arg(account_member(node_id, hostname))
            .arg(host_member(account, node_id))
            .invoke_async(&mut conn)
            .await?;

        if let Some(owner) = owner {
            debug!(account = %account, node_id = %node_id, owner = %owner, "Claim already held");
            return Err(RegistryError::DuplicateConnection { hostname: owner });
        }

        info!(account = %account, node_id = %node_id, hostname = %hostname, "Registered connection with redis");
        Ok(())
    }

    async fn unregister(
        &self,
        account: &str,
        node_id: &str,
        hostname: &str,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(primary_key(account, node_id))
            .ignore()
            .srem(CONNECTIONS_SET, connections_member(account, node_id, hostname))
            .ignore()
            .srem(account, account_member(node_id, hostname))
            .ignore()
            .srem(hostname, host_member(account, node_id))
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(account = %account, node_id = %node_id, hostname = %hostname, "Unregistered connection from redis");
        Ok(())
    }

    async fn get(&self, account: &str, node_id: &str) -> Result<Option<String>, RegistryError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(primary_key(account, node_id))
            .query_async(&mut conn)
            .await?;
        Ok(owner)
    }

    async fn get_by_account(&self, account: &str) -> Result<HashMap<String, String>, RegistryError> {
        Ok(parse_account_members(self.members(account).await?))
    }

    async fn get_by_host(
        &self,
        hostname: &str,
    ) -> Result<HashMap<String, Vec<String>>, RegistryError> {
        Ok(parse_host_members(self.members(hostname).await?))
    }

    async fn get_all(&self) -> Result<HashMap<String, HashMap<String, String>>, RegistryError> {
        Ok(parse_connection_members(self.members(CONNECTIONS_SET).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect() -> RedisRegistry {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into());
        RedisRegistry::connect_url(&url).await.unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore = "needs a redis server at REDIS_URL"]
    async fn test_register_unregister_round_trip() {
        let registry = connect().await;
        let (account, node, host) = (unique("acct"), unique("node"), unique("pod"));

        registry.register(&account, &node, &host).await.unwrap();
        assert!(registry.exists(&account, &node).await.unwrap());
        assert_eq!(registry.get(&account, &node).await.unwrap(), Some(host.clone()));
        assert_eq!(registry.get_by_account(&account).await.unwrap()[&node], host);
        assert_eq!(registry.get_by_host(&host).await.unwrap()[&account], vec![node.clone()]);
        assert_eq!(registry.get_all().await.unwrap()[&account][&node], host);

        registry.unregister(&account, &node, &host).await.unwrap();
        assert!(!registry.exists(&account, &node).await.unwrap());
        assert!(registry.members(&account).await.unwrap().is_empty());
        assert!(registry.members(&host).await.unwrap().is_empty());
        assert!(!registry
            .members(CONNECTIONS_SET)
            .await
            .unwrap()
            .contains(&connections_member(&account, &node, &host)));
    }

    #[tokio::test]
    #[ignore = "needs a redis server at REDIS_URL"]
    async fn test_duplicate_claim() {
        let registry = connect().await;
        let (account, node) = (unique("acct"), unique("node"));

        let (first, second) = (unique("pod"), unique("pod"));

        registry.register(&account, &node, &first).await.unwrap();
        let err = registry.register(&account, &node, &second).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateConnection { hostname } if hostname == first));

        // The losing claim leaves no index members behind.
        assert!(registry.members(&second).await.unwrap().is_empty());
        assert_eq!(registry.get_by_account(&account).await.unwrap().len(), 1);
        assert!(!registry
            .members(CONNECTIONS_SET)
            .await
            .unwrap()
            .contains(&connections_member(&account, &node, &second)));

        registry.unregister(&account, &node, &first).await.unwrap();
    }
}
