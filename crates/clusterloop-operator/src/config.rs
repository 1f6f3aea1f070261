//! Operator configuration
//!
//! Typed settings for the engine, the virtual workspace resolver and the health
//! server. Defaults match the `run` command's flag defaults; each can be
//! overridden from the environment.

use crate::crds::apiexport::VIRTUAL_WORKSPACE_URLS_READY;
use crate::crds::widget::GROUP;
use backoff::ExponentialBackoff;
use std::net::SocketAddr;
use std::time::Duration;

/// Reconciliation engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent reconciles per controller (distinct keys only).
    pub workers: usize,
    /// First retry delay after a failed reconcile.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// Pause before relisting after a watch reported an error.
    pub relist_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            relist_delay: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Delay before retrying a key that has failed `failures` times in a row.
    ///
    /// `base * 2^(failures - 1)`, capped at `backoff_max`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.saturating_sub(1));
        self.backoff_base
            .saturating_mul(multiplier)
            .min(self.backoff_max)
    }
}

/// Backoff for the API calls made once at startup: discovery and the first
/// APIExport list.
pub fn startup_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: Some(Duration::from_secs(120)),
        ..Default::default()
    }
}

/// Virtual workspace resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// APIExport to wait for; empty accepts any export of `group`.
    pub export_name: String,
    /// Condition that marks the export's URLs as usable.
    pub ready_condition: String,
    /// API group recognising this controller's export when no name is given.
    pub group: String,
    /// Pause before reopening a watch that closed without delivering events.
    pub rewatch_delay: Duration,
    /// Retry schedule for the initial APIExport list.
    pub list_backoff: ExponentialBackoff,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            export_name: String::new(),
            ready_condition: VIRTUAL_WORKSPACE_URLS_READY.to_string(),
            group: GROUP.to_string(),
            rewatch_delay: Duration::from_millis(200),
            list_backoff: startup_backoff(),
        }
    }
}

impl ResolverConfig {
    pub fn for_export(name: impl Into<String>) -> Self {
        Self {
            export_name: name.into(),
            ..Default::default()
        }
    }
}

/// Health and metrics listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub metrics_addr: SocketAddr,
    pub health_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.workers, 2);
        let resolver = ResolverConfig::default();
        assert!(resolver.export_name.is_empty());
        assert_eq!(resolver.ready_condition, "VirtualWorkspaceURLsReady");
        assert_eq!(resolver.group, "data.my.domain");
        assert_eq!(ServerConfig::default().health_addr.port(), 8081);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig {
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(5));
        assert_eq!(config.backoff_for(2), Duration::from_millis(10));
        assert_eq!(config.backoff_for(4), Duration::from_millis(40));
        assert_eq!(config.backoff_for(6), Duration::from_millis(100));
        assert_eq!(config.backoff_for(64), Duration::from_millis(100));
    }
}
