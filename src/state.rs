//! Shared application state passed to handlers via Axum's `State` extractor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::locator::ConnectionLocator;

/// State of the job and management APIs.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Where connections are looked up.
    pub locator: Arc<dyn ConnectionLocator>,
}

impl AppState {
    pub fn new(config: Arc<Config>, locator: Arc<dyn ConnectionLocator>) -> Self {
        Self { config, locator }
    }
}

/// State of the monitoring listener.
#[derive(Clone)]
pub struct MonitoringState {
    pub metrics: Option<PrometheusHandle>,
    /// Cleared once shutdown begins so readiness probes fail first.
    pub ready: Arc<AtomicBool>,
    pub start_time: Instant,
}

impl MonitoringState {
    pub fn new(metrics: Option<PrometheusHandle>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(true)),
            start_time: Instant::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LocalLocator;
    use crate::registry::LocalRegistry;

    #[test]
    fn test_app_state_holds_config_and_locator_only() {
        let state = AppState {
            config: Arc::new(Config::default()),
            locator: Arc::new(LocalLocator::new(LocalRegistry::new())),
        };
        assert_eq!(state.config.server.mgmt_listen, "0.0.0.0:9090");
    }

    #[test]
    fn test_monitoring_readiness_flag_is_shared() {
        let state = MonitoringState::new(None);
        let clone = state.clone();
        clone.set_ready(false);
        assert!(!state.is_ready());
        assert!(state.start_time.elapsed().as_secs() < 60);
    }
}
