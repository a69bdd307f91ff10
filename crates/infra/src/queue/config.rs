//! Queue configuration.

use std::time::Duration;

use super::QueueError;

pub const ENV_WORKERS: &str = "CADENCE_QUEUE_WORKERS";
pub const ENV_POLL_DELAY_MS: &str = "CADENCE_QUEUE_POLL_DELAY_MS";

/// Periodic unstick runs every `UNSTICK_POLL_MULTIPLIER` poll delays.
const UNSTICK_POLL_MULTIPLIER: u32 = 15;
const MIN_UNSTICK_INTERVAL: Duration = Duration::from_secs(1);

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name for logging.
    pub name: String,
    /// Number of worker tasks (at least 1).
    pub workers: usize,
    /// How long the manager waits between scans when idle.
    pub poll_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            workers: 1,
            poll_delay: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.workers == 0 {
            return Err(QueueError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Base interval between periodic unstick passes (jittered by the manager).
    pub fn unstick_interval(&self) -> Duration {
        self.poll_delay
            .saturating_mul(UNSTICK_POLL_MULTIPLIER)
            .max(MIN_UNSTICK_INTERVAL)
    }

    /// Defaults overridden by `CADENCE_QUEUE_WORKERS` and
    /// `CADENCE_QUEUE_POLL_DELAY_MS` when set.
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, QueueError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_WORKERS) {
            config.workers = raw.trim().parse::<usize>().map_err(|e| {
                QueueError::InvalidConfig(format!("{ENV_WORKERS}={raw:?}: {e}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_POLL_DELAY_MS) {
            let millis: u64 = raw.trim().parse().map_err(|e| {
                QueueError::InvalidConfig(format!("{ENV_POLL_DELAY_MS}={raw:?}: {e}"))
            })?;
            config.poll_delay = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_delay, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = QueueConfig::default().with_workers(0).validate().unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
    }

    #[test]
    fn unstick_interval_scales_with_poll_delay() {
        let config = QueueConfig::default().with_poll_delay(Duration::from_millis(200));
        assert_eq!(config.unstick_interval(), Duration::from_secs(3));

        let config = QueueConfig::default().with_poll_delay(Duration::ZERO);
        assert_eq!(config.unstick_interval(), MIN_UNSTICK_INTERVAL);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            (ENV_WORKERS, "4"),
            (ENV_POLL_DELAY_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_delay, Duration::from_millis(250));

        assert_eq!(QueueConfig::from_lookup(lookup(&[])).unwrap(), QueueConfig::default());
    }

    #[test]
    fn unparsable_environment_is_rejected() {
        assert!(QueueConfig::from_lookup(lookup(&[(ENV_WORKERS, "many")])).is_err());
        assert!(QueueConfig::from_lookup(lookup(&[(ENV_WORKERS, "0")])).is_err());
        assert!(QueueConfig::from_lookup(lookup(&[(ENV_POLL_DELAY_MS, "-5")])).is_err());
    }
}
