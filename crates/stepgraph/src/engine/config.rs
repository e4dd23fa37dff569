//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker pool sizing for async handlers and parallel macro-nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Threads kept warm
    pub core_pool_size: usize,

    /// Upper bound on concurrent handler executions
    pub max_pool_size: usize,

    /// Queued handler invocations before callers wait
    pub queue_capacity: usize,

    /// Idle worker keep-alive
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 4,
            max_pool_size: 16,
            queue_capacity: 64,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Whether step traces are recorded through `tracing`
    pub tracing_enabled: bool,

    /// Worker pool for async handlers and parallel macro-nodes
    pub worker_pool: WorkerPoolConfig,

    /// Default instance-lock lease
    #[serde(with = "duration_millis")]
    pub lock_lease: Duration,

    /// How long engine operations wait to acquire an instance lock
    #[serde(with = "duration_millis")]
    pub lock_wait: Duration,

    /// Pause between lock acquisition attempts
    #[serde(with = "duration_millis")]
    pub lock_retry_interval: Duration,

    /// Default jitter for retry policies that omit it
    pub default_jitter: f64,

    /// Whether events are published on the external broadcast bus
    pub external_events_enabled: bool,

    /// Broadcast channel capacity
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracing_enabled: true,
            worker_pool: WorkerPoolConfig::default(),
            lock_lease: Duration::from_secs(30),
            lock_wait: Duration::from_secs(10),
            lock_retry_interval: Duration::from_millis(15),
            default_jitter: 0.1,
            external_events_enabled: true,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Set the instance-lock lease
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Set the lock acquisition wait budget
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Set the default retry jitter (clamped to 0.0-1.0)
    pub fn with_default_jitter(mut self, jitter: f64) -> Self {
        self.default_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Enable or disable the external event bus
    pub fn with_external_events(mut self, enabled: bool) -> Self {
        self.external_events_enabled = enabled;
        self
    }

    /// Set the worker pool configuration
    pub fn with_worker_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.worker_pool = pool;
        self
    }

    /// Enable or disable step tracing
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.tracing_enabled);
        assert_eq!(config.lock_lease, Duration::from_secs(30));
        assert_eq!(config.worker_pool.max_pool_size, 16);
        assert_eq!(config.default_jitter, 0.1);
    }

    #[test]
    fn test_builders_clamp() {
        let config = EngineConfig::default().with_default_jitter(3.0);
        assert_eq!(config.default_jitter, 1.0);
    }

    #[test]
    fn test_serialization() {
        let config = EngineConfig::default()
            .with_lock_lease(Duration::from_secs(5))
            .with_external_events(false);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
