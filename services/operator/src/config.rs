//! Configuration for the operator.

use std::time::Duration;

use anyhow::{Context, Result};
use nestplane_api::{ReleaseCatalog, DEFAULT_VERSION};
use nestplane_reconcile::{
    PollPolicy, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, DEFAULT_RECONCILE_INTERVAL,
    DEFAULT_RETRY_INTERVAL,
};

use crate::context::ActorSettings;

/// Default capacity of each cluster actor's event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 100;

/// Operator configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Suffix of every cluster's public hostname.
    pub base_domain: String,

    /// Ingress class annotation put on cluster routes.
    pub ingress_class: String,

    /// Interval between periodic status reconciliations.
    pub reconcile_interval: Duration,

    /// Readiness polling for the datastore and network endpoint.
    pub poll: PollPolicy,

    /// Delay between attempts to record a failure on the resource.
    pub status_retry_interval: Duration,

    /// Capacity of each actor's event queue.
    pub event_queue_capacity: usize,

    /// Version assigned to clusters created without one.
    pub default_version: String,

    /// Channel label resolution.
    pub catalog: ReleaseCatalog,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_domain: "example.com".to_string(),
            ingress_class: "k8sniff".to_string(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            poll: PollPolicy::new(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT),
            status_retry_interval: DEFAULT_RETRY_INTERVAL,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            default_version: DEFAULT_VERSION.to_string(),
            catalog: ReleaseCatalog::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let base_domain =
            std::env::var("NESTPLANE_BASE_DOMAIN").unwrap_or(defaults.base_domain);

        let ingress_class =
            std::env::var("NESTPLANE_INGRESS_CLASS").unwrap_or(defaults.ingress_class);

        let reconcile_interval = env_secs("NESTPLANE_RECONCILE_INTERVAL_SECS")?
            .unwrap_or(defaults.reconcile_interval);

        let poll = PollPolicy::new(
            env_secs("NESTPLANE_POLL_INTERVAL_SECS")?.unwrap_or(defaults.poll.interval),
            env_secs("NESTPLANE_POLL_TIMEOUT_SECS")?.unwrap_or(defaults.poll.timeout),
        );

        let status_retry_interval = env_secs("NESTPLANE_STATUS_RETRY_INTERVAL_SECS")?
            .unwrap_or(defaults.status_retry_interval);

        let event_queue_capacity: usize = std::env::var("NESTPLANE_EVENT_QUEUE_CAPACITY")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("NESTPLANE_EVENT_QUEUE_CAPACITY must be an integer.")?
            .unwrap_or(defaults.event_queue_capacity)
            .max(1);

        let default_version =
            std::env::var("NESTPLANE_DEFAULT_VERSION").unwrap_or(defaults.default_version);
        default_version
            .parse::<nestplane_api::ReleaseVersion>()
            .context("NESTPLANE_DEFAULT_VERSION is not a release version.")?;

        let mut catalog = defaults.catalog;
        if let Ok(pairs) = std::env::var("NESTPLANE_RELEASE_CHANNELS") {
            catalog
                .extend_from_pairs(&pairs)
                .context("NESTPLANE_RELEASE_CHANNELS must be label=version pairs.")?;
        }

        let log_level =
            std::env::var("NESTPLANE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            base_domain,
            ingress_class,
            reconcile_interval,
            poll,
            status_retry_interval,
            event_queue_capacity,
            default_version,
            catalog,
            log_level,
        })
    }

    /// Per-actor settings derived from this configuration.
    pub fn actor_settings(&self) -> ActorSettings {
        ActorSettings {
            base_domain: self.base_domain.clone(),
            ingress_class: self.ingress_class.clone(),
            reconcile_interval: self.reconcile_interval,
            poll: self.poll,
            status_retry_interval: self.status_retry_interval,
            event_queue_capacity: self.event_queue_capacity,
            default_version: self.default_version.clone(),
        }
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    std::env::var(key)
        .ok()
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be an integer (seconds)."))
        .map(|secs| secs.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(8));
        assert_eq!(config.poll.interval, Duration::from_secs(5));
        assert_eq!(config.poll.timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.status_retry_interval, Duration::from_secs(5));
        assert_eq!(config.event_queue_capacity, 100);
        assert_eq!(config.default_version, "stable-1.9");
    }

    #[test]
    fn test_actor_settings_follow_config() {
        let config = Config {
            base_domain: "nest.internal".to_string(),
            ..Config::default()
        };
        let settings = config.actor_settings();
        assert_eq!(settings.base_domain, "nest.internal");
        assert_eq!(settings.event_queue_capacity, 100);
    }
}
