//! Active Registrar: a per-connection watchdog that keeps the global claim
//! for a connection pointing at the replica that actually holds it.
//!
//! Every tick (uniformly jittered between the configured bounds) reads the
//! claim and acts on what it finds:
//!
//! | claim                          | action                                   |
//! |--------------------------------|------------------------------------------|
//! | missing                        | claim again; close on a lost race        |
//! | this replica                   | nothing                                  |
//! | another replica that is in DNS | close this connection                    |
//! | another replica not in DNS     | drop the stale claim, claim for this one |
//! | lookup error                   | skip the tick                            |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dns::PodResolver;
use crate::metrics;
use crate::registry::{ConnectionKey, GlobalRegistry, RegistryError};
use crate::session::{Session, Sessionlike};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The claim already names this replica.
    Owned,
    /// The claim was missing and this replica took it.
    ReRegistered,
    /// A claim by a replica absent from DNS was replaced.
    StaleReplaced { stale_owner: String },
    /// A live replica holds the claim.
    LostTo { owner: String },
    /// A lookup failed; try again next tick.
    Skipped,
}

/// Compare the global claim for `(account, node_id)` against `hostname`
/// and repair it where this replica is entitled to.
pub async fn reconcile(
    global: &dyn GlobalRegistry,
    resolver: &dyn PodResolver,
    hostname: &str,
    account: &str,
    node_id: &str,
) -> Reconciliation {
    let owner = match global.get(account, node_id).await {
        Ok(owner) => owner,
        Err(e) => {
            metrics::redis_lookup_failed();
            warn!(error = %e, "Unable to read connection claim");
            return Reconciliation::Skipped;
        }
    };

    match owner {
        None => claim(global, hostname, account, node_id).await,
        Some(owner) if owner == hostname => Reconciliation::Owned,
        Some(owner) => replace_if_stale(global, resolver, hostname, account, node_id, owner).await,
    }
}

/// Take over a claim held by `owner` if `owner` is no longer running.
pub async fn replace_if_stale(
    global: &dyn GlobalRegistry,
    resolver: &dyn PodResolver,
    hostname: &str,
    account: &str,
    node_id: &str,
    owner: String,
) -> Reconciliation {
    let pods = match resolver.pods().await {
        Ok(pods) => pods,
        Err(e) => {
            metrics::pod_lookup_failed();
            warn!(error = %e, "Unable to resolve running replicas");
            return Reconciliation::Skipped;
        }
    };

    if pods.contains(&owner) {
        return Reconciliation::LostTo { owner };
    }

    warn!(stale_owner = %owner, "Claim held by a replica that is no longer running");
    if let Err(e) = global.unregister(account, node_id, &owner).await {
        metrics::redis_lookup_failed();
        warn!(error = %e, "Unable to remove stale claim");
        return Reconciliation::Skipped;
    }
    metrics::stale_connection_unregistered();

    match claim(global, hostname, account, node_id).await {
        Reconciliation::ReRegistered => Reconciliation::StaleReplaced { stale_owner: owner },
        other => other,
    }
}

async fn claim(
    global: &dyn GlobalRegistry,
    hostname: &str,
    account: &str,
    node_id: &str,
) -> Reconciliation {
    match global.register(account, node_id, hostname).await {
        Ok(()) => {
            metrics::connection_re_registered();
            Reconciliation::ReRegistered
        }
        Err(RegistryError::DuplicateConnection { hostname: owner }) => {
            Reconciliation::LostTo { owner }
        }
        Err(e) => {
            metrics::redis_lookup_failed();
            warn!(error = %e, "Unable to claim connection");
            Reconciliation::Skipped
        }
    }
}

struct Running {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    global: Arc<dyn GlobalRegistry>,
    resolver: Arc<dyn PodResolver>,
    hostname: String,
    min_delay: Duration,
    max_delay: Duration,
    running: RwLock<HashMap<String, Running>>,
    next_id: AtomicU64,
}

impl Inner {
    fn jittered_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Drop the map entry for `key` if it still belongs to registrar `id`.
    async fn forget(&self, key: &str, id: u64) {
        let mut running = self.running.write().await;
        if running.get(key).is_some_and(|r| r.id == id) {
            running.remove(key);
        }
    }
}

/// Starts and stops one watchdog per connection. Clones share state.
#[derive(Clone)]
pub struct ActiveRegistrarFactory {
    inner: Arc<Inner>,
}

impl ActiveRegistrarFactory {
    pub fn new(
        global: Arc<dyn GlobalRegistry>,
        resolver: Arc<dyn PodResolver>,
        hostname: String,
        (min_delay, max_delay): (Duration, Duration),
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                global,
                resolver,
                hostname,
                min_delay,
                max_delay,
                running: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Watch `session`'s claim until the session closes or [`Self::stop`]
    /// is called for its pair.
    pub async fn start(&self, session: Arc<Session>) {
        let key = ConnectionKey::new(session.account(), session.node_id()).to_string();
        let cancel = session.cancel_token().child_token();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self.inner.running.write().await.insert(
            key.clone(),
            Running {
                id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let span = info_span!(
            "active_registrar",
            account = %session.account(),
            node_id = %session.node_id()
        );
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                watch(&inner, &session, &cancel).await;
                inner.forget(&key, id).await;
                debug!("Active registrar stopped");
            }
            .instrument(span),
        );
    }

    /// Stop the watchdog for the pair and release its handle.
    pub async fn stop(&self, account: &str, node_id: &str) {
        let key = ConnectionKey::new(account, node_id).to_string();
        if let Some(running) = self.inner.running.write().await.remove(&key) {
            running.cancel.cancel();
        }
    }

    pub async fn is_running(&self, account: &str, node_id: &str) -> bool {
        let key = ConnectionKey::new(account, node_id).to_string();
        self.inner.running.read().await.contains_key(&key)
    }

    /// See [`replace_if_stale`]; used when a new connection finds its pair
    /// already claimed.
    pub async fn replace_if_stale(&self, account: &str, node_id: &str, owner: String) -> Reconciliation {
        replace_if_stale(
            self.inner.global.as_ref(),
            self.inner.resolver.as_ref(),
            &self.inner.hostname,
            account,
            node_id,
            owner,
        )
        .await
    }
}

async fn watch(inner: &Inner, session: &Arc<Session>, cancel: &CancellationToken) {
    loop {
        let delay = inner.jittered_delay();
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let outcome = reconcile(
            inner.global.as_ref(),
            inner.resolver.as_ref(),
            &inner.hostname,
            session.account(),
            session.node_id(),
        )
        .await;

        match outcome {
            Reconciliation::Owned | Reconciliation::Skipped => {}
            Reconciliation::ReRegistered => info!("Re-registered connection"),
            Reconciliation::StaleReplaced { stale_owner } => {
                info!(stale_owner = %stale_owner, "Replaced stale connection claim");
            }
            Reconciliation::LostTo { owner } => {
                metrics::closed_due_to_duplicate();
                warn!(owner = %owner, "Connection is owned by another gateway, closing");
                let _ = session.close().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::registry::{MemoryRegistry, CONNECTIONS_SET};
    use crate::session::tests::test_session;

    fn factory(global: &MemoryRegistry, resolver: &StaticResolver, hostname: &str) -> ActiveRegistrarFactory {
        ActiveRegistrarFactory::new(
            Arc::new(global.clone()),
            Arc::new(resolver.clone()),
            hostname.to_string(),
            (Duration::from_millis(10), Duration::from_millis(20)),
        )
    }

    async fn wait_stopped(factory: &ActiveRegistrarFactory, account: &str, node_id: &str) {
        for _ in 0..100 {
            if !factory.is_running(account, node_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("registrar for {account}:{node_id} still running");
    }

    #[tokio::test]
    async fn test_reconcile_missing_claim() {
        let global = MemoryRegistry::new();
        let resolver = StaticResolver::new(["pod-1"]);
        let outcome = reconcile(&global, &resolver, "pod-1", "01", "node-a").await;
        assert_eq!(outcome, Reconciliation::ReRegistered);
        assert_eq!(global.get("01", "node-a").await.unwrap(), Some("pod-1".into()));
    }

    #[tokio::test]
    async fn test_reconcile_owned() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "pod-1").await.unwrap();
        let resolver = StaticResolver::new(["pod-1"]);
        assert_eq!(
            reconcile(&global, &resolver, "pod-1", "01", "node-a").await,
            Reconciliation::Owned
        );
    }

    #[tokio::test]
    async fn test_reconcile_live_owner_wins() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "pod-2").await.unwrap();
        let resolver = StaticResolver::new(["pod-1", "pod-2"]);
        assert_eq!(
            reconcile(&global, &resolver, "pod-1", "01", "node-a").await,
            Reconciliation::LostTo {
                owner: "pod-2".into()
            }
        );
        assert_eq!(global.get("01", "node-a").await.unwrap(), Some("pod-2".into()));
    }

    #[tokio::test]
    async fn test_reconcile_stale_owner_replaced() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "ghost-host").await.unwrap();
        let resolver = StaticResolver::new(["pod-1"]);

        assert_eq!(
            reconcile(&global, &resolver, "pod-1", "01", "node-a").await,
            Reconciliation::StaleReplaced {
                stale_owner: "ghost-host".into()
            }
        );
        assert_eq!(global.get("01", "node-a").await.unwrap(), Some("pod-1".into()));
        assert_eq!(global.members(CONNECTIONS_SET), vec!["01:node-a:pod-1"]);
        assert_eq!(global.members("01"), vec!["node-a:pod-1"]);
        assert_eq!(global.members("pod-1"), vec!["01:node-a"]);
        assert!(global.members("ghost-host").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_skips_on_dns_failure() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "ghost-host").await.unwrap();
        let resolver = StaticResolver::new(["pod-1"]);
        resolver.set_failing(true);

        assert_eq!(
            reconcile(&global, &resolver, "pod-1", "01", "node-a").await,
            Reconciliation::Skipped
        );
        assert_eq!(global.get("01", "node-a").await.unwrap(), Some("ghost-host".into()));
    }

    #[tokio::test]
    async fn test_jitter_within_bounds() {
        let global = MemoryRegistry::new();
        let f = factory(&global, &StaticResolver::default(), "pod-1");
        for _ in 0..50 {
            let d = f.inner.jittered_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_closes_connection_lost_to_live_peer() {
        let global = MemoryRegistry::new();
        let resolver = StaticResolver::new(["pod-1", "pod-2"]);
        let f = factory(&global, &resolver, "pod-1");
        let (session, _rx) = test_session("01", "node-a", 4);

        global.register("01", "node-a", "pod-2").await.unwrap();
        f.start(session.clone()).await;
        assert!(f.is_running("01", "node-a").await);

        session.cancel_token().cancelled().await;
        wait_stopped(&f, "01", "node-a").await;
        assert_eq!(global.get("01", "node-a").await.unwrap(), Some("pod-2".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reclaims_missing_entry() {
        let global = MemoryRegistry::new();
        let resolver = StaticResolver::new(["pod-1"]);
        let f = factory(&global, &resolver, "pod-1");
        let (session, _rx) = test_session("01", "node-a", 4);

        f.start(session.clone()).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(global.get("01", "node-a").await.unwrap(), Some("pod-1".into()));
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_handle() {
        let global = MemoryRegistry::new();
        let f = factory(&global, &StaticResolver::new(["pod-1"]), "pod-1");
        let (session, _rx) = test_session("01", "node-a", 4);

        f.start(session.clone()).await;
        f.stop("01", "node-a").await;
        assert!(!f.is_running("01", "node-a").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(global.is_empty());
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_close_stops_registrar() {
        let global = MemoryRegistry::new();
        let f = factory(&global, &StaticResolver::new(["pod-1"]), "pod-1");
        let (session, _rx) = test_session("01", "node-a", 4);

        f.start(session.clone()).await;
        session.close().await.unwrap();
        wait_stopped(&f, "01", "node-a").await;
    }
}
