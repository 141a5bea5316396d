//! Live replica roster from the headless service's `A` records.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("lookup of {name} failed: {message}")]
    Lookup { name: String, message: String },
}

/// Answers "which replicas are running right now".
#[async_trait]
pub trait PodResolver: Send + Sync {
    async fn pods(&self) -> Result<HashSet<String>, ResolveError>;
}

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    service_name: String,
}

impl DnsResolver {
    /// Resolve through the system configuration so cluster search domains
    /// apply. Falls back to the library defaults when it cannot be read.
    pub fn new(service_name: impl Into<String>) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!(error = %e, "Unable to read system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self {
            resolver,
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl PodResolver for DnsResolver {
    async fn pods(&self) -> Result<HashSet<String>, ResolveError> {
        let lookup = self
            .resolver
            .lookup_ip(self.service_name.as_str())
            .await
            .map_err(|e| ResolveError::Lookup {
                name: self.service_name.clone(),
                message: e.to_string(),
            })?;
        let pods: HashSet<String> = lookup.iter().map(|ip| ip.to_string()).collect();
        debug!(service = %self.service_name, count = pods.len(), "Resolved replica roster");
        Ok(pods)
    }
}

/// Fixed roster, optionally failing every lookup.
#[derive(Clone, Default)]
pub struct StaticResolver {
    pods: HashSet<String>,
    failing: Arc<AtomicBool>,
}

impl StaticResolver {
    pub fn new<I, S>(pods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pods: pods.into_iter().map(Into::into).collect(),
            failing: Arc::default(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodResolver for StaticResolver {
    async fn pods(&self) -> Result<HashSet<String>, ResolveError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResolveError::Lookup {
                name: "static".to_string(),
                message: "lookup disabled".to_string(),
            });
        }
        Ok(self.pods.clone())
    }
}
