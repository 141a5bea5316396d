//! In-process [`GlobalRegistry`] with the same keyspace as the Redis one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    account_member, connections_member, host_member, parse_account_members,
    parse_connection_members, parse_host_members, primary_key, GlobalRegistry, RegistryError,
    CONNECTIONS_SET,
};

#[derive(Default)]
struct Keyspace {
    strings: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
}

impl Keyspace {
    fn sadd(&mut self, key: &str, member: String) {
        self.sets.entry(key.to_string()).or_default().insert(member);
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn smembers(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// True when no key of any kind is present.
    pub fn is_empty(&self) -> bool {
        let ks = self.lock();
        ks.strings.is_empty() && ks.sets.is_empty()
    }

    /// Members of the set at `key`, for asserting on index contents.
    pub fn members(&self, key: &str) -> Vec<String> {
        self.lock().smembers(key)
    }
}

#[async_trait]
impl GlobalRegistry for MemoryRegistry {
    async fn exists(&self, account: &str, node_id: &str) -> Result<bool, RegistryError> {
        Ok(self.lock().strings.contains_key(&primary_key(account, node_id)))
    }

    async fn register(
        &self,
        account: &str,
        node_id: &str,
        hostname: &str,
    ) -> Result<(), RegistryError> {
        let mut ks = self.lock();
        let key = primary_key(account, node_id);
        if let Some(owner) = ks.strings.get(&key) {
            return Err(RegistryError::DuplicateConnection {
                hostname: owner.clone(),
            });
        }
        ks.strings.insert(key, hostname.to_string());
        ks.sadd(CONNECTIONS_SET, connections_member(account, node_id, hostname));
        ks.sadd(account, account_member(node_id, hostname));
        ks.sadd(hostname, host_member(account, node_id));
        Ok(())
    }

    async fn unregister(
        &self,
        account: &str,
        node_id: &str,
        hostname: &str,
    ) -> Result<(), RegistryError> {
        let mut ks = self.lock();
        ks.strings.remove(&primary_key(account, node_id));
        ks.srem(CONNECTIONS_SET, &connections_member(account, node_id, hostname));
        ks.srem(account, &account_member(node_id, hostname));
        ks.srem(hostname, &host_member(account, node_id));
        Ok(())
    }

    async fn get(&self, account: &str, node_id: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.lock().strings.get(&primary_key(account, node_id)).cloned())
    }

    async fn get_by_account(&self, account: &str) -> Result<HashMap<String, String>, RegistryError> {
        Ok(parse_account_members(self.lock().smembers(account)))
    }

    async fn get_by_host(
        &self,
        hostname: &str,
    ) -> Result<HashMap<String, Vec<String>>, RegistryError> {
        Ok(parse_host_members(self.lock().smembers(hostname)))
    }

    async fn get_all(&self) -> Result<HashMap<String, HashMap<String, String>>, RegistryError> {
        Ok(parse_connection_members(self.lock().smembers(CONNECTIONS_SET)))
    }
}
