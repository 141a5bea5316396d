//! Connection registries.
//!
//! Two levels: the [`LocalRegistry`] maps `(account, node_id)` to the live
//! [`Session`] on this replica, and a [`GlobalRegistry`] maps the same pair
//! to the hostname of the replica that owns it. The global key model:
//!
//! ```text
//! {account}:{node_id}        -> hostname          (primary, SET NX)
//! connections                 ∋ {account}:{node_id}:{hostname}
//! {account}                   ∋ {node_id}:{hostname}
//! {hostname}                  ∋ {account}:{node_id}
//! ```
//!
//! [`Registrar`] ties both together for the connection lifecycle.

pub mod local;
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::registrar::{ActiveRegistrarFactory, Reconciliation};
use crate::session::Session;

pub use local::LocalRegistry;
pub use memory::MemoryRegistry;
pub use self::redis::RedisRegistry;

/// Set holding every `{account}:{node_id}:{hostname}` member.
pub const CONNECTIONS_SET: &str = "connections";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("connection already registered to {hostname}")]
    DuplicateConnection { hostname: String },
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// The globally unique identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub account: String,
    pub node_id: String,
}

impl ConnectionKey {
    pub fn new(account: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account, self.node_id)
    }
}

/// Fleet-wide index of which replica owns which connection.
#[async_trait]
pub trait GlobalRegistry: Send + Sync {
    async fn exists(&self, account: &str, node_id: &str) -> Result<bool, RegistryError>;

    /// Claim the pair for `hostname`. Fails with
    /// [`RegistryError::DuplicateConnection`] naming the current owner when
    /// another claim exists.
    async fn register(&self, account: &str, node_id: &str, hostname: &str)
        -> Result<(), RegistryError>;

    /// Remove the claim and its index members.
    async fn unregister(
        &self,
        account: &str,
        node_id: &str,
        hostname: &str,
    ) -> Result<(), RegistryError>;

    async fn get(&self, account: &str, node_id: &str) -> Result<Option<String>, RegistryError>;

    /// `node_id -> hostname` for one account.
    async fn get_by_account(&self, account: &str) -> Result<HashMap<String, String>, RegistryError>;

    /// `account -> [node_id]` owned by one replica.
    async fn get_by_host(
        &self,
        hostname: &str,
    ) -> Result<HashMap<String, Vec<String>>, RegistryError>;

    /// `account -> node_id -> hostname` across the fleet.
    async fn get_all(&self) -> Result<HashMap<String, HashMap<String, String>>, RegistryError>;
}

pub(crate) fn primary_key(account: &str, node_id: &str) -> String {
    format!("{account}:{node_id}")
}

pub(crate) fn connections_member(account: &str, node_id: &str, hostname: &str) -> String {
    format!("{account}:{node_id}:{hostname}")
}

pub(crate) fn account_member(node_id: &str, hostname: &str) -> String {
    format!("{node_id}:{hostname}")
}

pub(crate) fn host_member(account: &str, node_id: &str) -> String {
    format!("{account}:{node_id}")
}

/// `{node_id}:{hostname}` members into `node_id -> hostname`.
pub(crate) fn parse_account_members(members: Vec<String>) -> HashMap<String, String> {
    members
        .into_iter()
        .filter_map(|m| {
            m.split_once(':')
                .map(|(node, host)| (node.to_string(), host.to_string()))
        })
        .collect()
}

/// `{account}:{node_id}` members into `account -> [node_id]`.
pub(crate) fn parse_host_members(members: Vec<String>) -> HashMap<String, Vec<String>> {
    let mut by_account: HashMap<String, Vec<String>> = HashMap::new();
    for member in members {
        if let Some((account, node)) = member.split_once(':') {
            by_account
                .entry(account.to_string())
                .or_default()
                .push(node.to_string());
        }
    }
    by_account
}

/// `{account}:{node_id}:{hostname}` members into the nested map.
pub(crate) fn parse_connection_members(
    members: Vec<String>,
) -> HashMap<String, HashMap<String, String>> {
    let mut all: HashMap<String, HashMap<String, String>> = HashMap::new();
    for member in members {
        let mut parts = member.splitn(3, ':');
        if let (Some(account), Some(node), Some(host)) = (parts.next(), parts.next(), parts.next())
        {
            all.entry(account.to_string())
                .or_default()
                .insert(node.to_string(), host.to_string());
        }
    }
    all
}

/// Registers and unregisters sessions on both levels and owns the Active
/// Registrar lifecycle. Without a global registry only the local level is
/// used.
pub struct Registrar {
    local: LocalRegistry,
    global: Option<Arc<dyn GlobalRegistry>>,
    active: Option<ActiveRegistrarFactory>,
    hostname: String,
}

impl Registrar {
    pub fn local_only(local: LocalRegistry, hostname: String) -> Self {
        Self {
            local,
            global: None,
            active: None,
            hostname,
        }
    }

    pub fn with_global(
        local: LocalRegistry,
        global: Arc<dyn GlobalRegistry>,
        active: ActiveRegistrarFactory,
        hostname: String,
    ) -> Self {
        Self {
            local,
            global: Some(global),
            active: Some(active),
            hostname,
        }
    }

    pub fn local(&self) -> &LocalRegistry {
        &self.local
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn active(&self) -> Option<&ActiveRegistrarFactory> {
        self.active.as_ref()
    }

    /// Claim the pair globally, then locally, then start watching it.
    /// A lost claim leaves the local registry untouched.
    pub async fn register(&self, session: &Arc<Session>) -> Result<(), RegistryError> {
        let (account, node_id) = (session.account(), session.node_id());

        if let Some(global) = &self.global {
            match global.register(account, node_id, &self.hostname).await {
                Ok(()) => {}
                Err(RegistryError::DuplicateConnection { hostname: owner }) => {
                    self.take_over_stale(account, node_id, owner).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(previous) = self.local.register(account, node_id, session.clone()).await {
            warn!(account = %account, node_id = %node_id, "Replaced existing local session");
            previous.cancel_token().cancel();
        }

        if let Some(active) = &self.active {
            active.start(session.clone()).await;
        }

        info!(account = %account, node_id = %node_id, hostname = %self.hostname, "Registered connection");
        Ok(())
    }

    /// A claim held by a replica that is gone from DNS is replaced; any
    /// other existing claim is a duplicate.
    async fn take_over_stale(
        &self,
        account: &str,
        node_id: &str,
        owner: String,
    ) -> Result<(), RegistryError> {
        let outcome = match &self.active {
            Some(active) if owner != self.hostname => {
                active.replace_if_stale(account, node_id, owner.clone()).await
            }
            _ => Reconciliation::LostTo {
                owner: owner.clone(),
            },
        };

        match outcome {
            Reconciliation::StaleReplaced { stale_owner } => {
                info!(account = %account, node_id = %node_id, stale_owner = %stale_owner, "Took over stale connection claim");
                Ok(())
            }
            Reconciliation::LostTo { owner } => {
                metrics::duplicate_connection();
                warn!(
                    account = %account,
                    node_id = %node_id,
                    owner = %owner,
                    "Connection already registered to another gateway"
                );
                Err(RegistryError::DuplicateConnection { hostname: owner })
            }
            _ => Err(RegistryError::DuplicateConnection { hostname: owner }),
        }
    }

    /// Undo [`Registrar::register`] for `session`. A no-op when a newer
    /// session has taken the pair or it was never registered.
    pub async fn unregister(&self, session: &Arc<Session>) {
        let (account, node_id) = (session.account(), session.node_id());

        if !self.local.unregister(account, node_id, session).await {
            debug!(account = %account, node_id = %node_id, "Session not registered locally");
            return;
        }

        if let Some(active) = &self.active {
            active.stop(account, node_id).await;
        }

        if let Some(global) = &self.global {
            match global.get(account, node_id).await {
                Ok(Some(owner)) if owner == self.hostname => {
                    if let Err(e) = global.unregister(account, node_id, &self.hostname).await {
                        warn!(account = %account, node_id = %node_id, error = %e, "Unable to unregister connection globally");
                    }
                }
                Ok(owner) => {
                    debug!(account = %account, node_id = %node_id, owner = ?owner, "Global claim belongs elsewhere, leaving it");
                }
                Err(e) => {
                    metrics::redis_lookup_failed();
                    warn!(account = %account, node_id = %node_id, error = %e, "Unable to read global claim");
                }
            }
        }

        info!(account = %account, node_id = %node_id, "Unregistered connection");
    }
}
