use std::time::Duration;

use clap::Args;

/// `mainTuning` from spec.md §6: the handful of knobs that govern
/// status-read timeouts and bounded retry. Loaded once from CLI/env at
/// startup and additionally kept live via a watch on the
/// `weblogic-operator-cm` ConfigMap, so an operator can widen
/// `domain_presence_failure_retry_max_count` without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Args)]
pub struct Tuning {
    /// Delay before the first status read of a newly adopted domain.
    #[arg(long, env, default_value = "1")]
    pub initial_short_delay_seconds: u64,

    /// Timeout for one status-read fiber before it is treated as a
    /// transient failure and retried.
    #[arg(long, env, default_value = "5")]
    pub status_update_timeout_seconds: u64,

    /// Steady-state interval between status reads once a domain is settled.
    #[arg(long, env, default_value = "10")]
    pub status_update_interval_seconds: u64,

    /// Base delay fed into the full-jitter backoff after a make-right failure.
    #[arg(long, env, default_value = "10")]
    pub domain_presence_failure_retry_seconds: u64,

    /// Above this many consecutive make-right failures, retries stop
    /// until the user edits the spec.
    #[arg(long, env, default_value = "5")]
    pub domain_presence_failure_retry_max_count: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            initial_short_delay_seconds: 1,
            status_update_timeout_seconds: 5,
            status_update_interval_seconds: 10,
            domain_presence_failure_retry_seconds: 10,
            domain_presence_failure_retry_max_count: 5,
        }
    }
}

impl Tuning {
    pub fn initial_short_delay(&self) -> Duration {
        Duration::from_secs(self.initial_short_delay_seconds)
    }

    pub fn status_update_timeout(&self) -> Duration {
        Duration::from_secs(self.status_update_timeout_seconds)
    }

    pub fn status_update_interval(&self) -> Duration {
        Duration::from_secs(self.status_update_interval_seconds)
    }

    pub fn failure_retry_base(&self) -> Duration {
        Duration::from_secs(self.domain_presence_failure_retry_seconds)
    }

    pub fn max_failure_retries(&self) -> u32 {
        self.domain_presence_failure_retry_max_count
    }

    /// Parses the handful of `mainTuning` keys out of a ConfigMap's
    /// `data`, keeping any field not present unchanged. Unknown or
    /// unparsable values are ignored rather than failing the watch.
    pub fn merge_from_config_map(&self, data: &std::collections::BTreeMap<String, String>) -> Tuning {
        let mut next = *self;
        if let Some(v) = data.get("initialShortDelaySeconds").and_then(|v| v.parse().ok()) {
            next.initial_short_delay_seconds = v;
        }
        if let Some(v) = data
            .get("statusUpdateTimeoutSeconds")
            .and_then(|v| v.parse().ok())
        {
            next.status_update_timeout_seconds = v;
        }
        if let Some(v) = data
            .get("statusUpdateIntervalSeconds")
            .and_then(|v| v.parse().ok())
        {
            next.status_update_interval_seconds = v;
        }
        if let Some(v) = data
            .get("domainPresenceFailureRetrySeconds")
            .and_then(|v| v.parse().ok())
        {
            next.domain_presence_failure_retry_seconds = v;
        }
        if let Some(v) = data
            .get("domainPresenceFailureRetryMaxCount")
            .and_then(|v| v.parse().ok())
        {
            next.domain_presence_failure_retry_max_count = v;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_from_config_map_only_touches_present_keys() {
        let base = Tuning::default();
        let mut data = std::collections::BTreeMap::new();
        data.insert("domainPresenceFailureRetryMaxCount".to_string(), "9".to_string());
        let merged = base.merge_from_config_map(&data);
        assert_eq!(merged.domain_presence_failure_retry_max_count, 9);
        assert_eq!(
            merged.status_update_timeout_seconds,
            base.status_update_timeout_seconds
        );
    }

    #[test]
    fn merge_from_config_map_ignores_unparsable_values() {
        let base = Tuning::default();
        let mut data = std::collections::BTreeMap::new();
        data.insert("statusUpdateTimeoutSeconds".to_string(), "not-a-number".to_string());
        let merged = base.merge_from_config_map(&data);
        assert_eq!(merged, base);
    }
}
