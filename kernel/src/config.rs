//! μKernel Configuration
//!
//! Configuration for the scheduler, process supervision and the daemon.

use crate::sys::process::HeartbeatTiming;
use crate::sys::scheduler::{MAX_PROCESSES, MAX_USER_PROCESSES};
use crate::sys::syscall::{HEARTBEAT_GRACE_PERIOD, HEARTBEAT_INTERVAL};
use crate::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Admission and allocation settings
    pub scheduler: SchedulerConfig,

    /// Liveness settings
    pub heartbeat: HeartbeatConfig,

    /// Buffered scheduler events per subscriber
    pub event_capacity: usize,

    /// Logging level
    pub log_level: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            event_capacity: 1024,
            log_level: "info".into(),
        }
    }
}

impl KernelConfig {
    /// Small limits for tests
    pub fn testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                max_processes: 10,
                max_user_processes: 10,
                pid_probe_budget: 10,
                ..SchedulerConfig::default()
            },
            log_level: "debug".into(),
            ..Self::default()
        }
    }

    /// Override the table limits
    pub fn with_limits(mut self, max_processes: usize, max_user_processes: usize) -> Self {
        self.scheduler.max_processes = max_processes;
        self.scheduler.max_user_processes = max_user_processes;
        self.scheduler.pid_probe_budget = max_processes;
        self
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> KernelResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> KernelResult<()> {
        let scheduler = &self.scheduler;

        if scheduler.max_processes == 0 {
            return Err(KernelError::InvalidConfiguration(
                "max_processes must be at least 1".into()
            ));
        }

        // PIDs must fit in a ProcessId
        if scheduler.max_processes > u32::MAX as usize {
            return Err(KernelError::InvalidConfiguration(
                format!("max_processes {} is too large", scheduler.max_processes)
            ));
        }

        if scheduler.max_user_processes == 0 {
            return Err(KernelError::InvalidConfiguration(
                "max_user_processes must be at least 1".into()
            ));
        }

        if scheduler.pid_probe_budget == 0 {
            return Err(KernelError::InvalidConfiguration(
                "pid_probe_budget must be at least 1".into()
            ));
        }

        if self.heartbeat.interval.is_zero() {
            return Err(KernelError::InvalidConfiguration(
                "heartbeat interval must be non-zero".into()
            ));
        }

        if matches!(scheduler.drain_interval, Some(d) if d.is_zero()) {
            return Err(KernelError::InvalidConfiguration(
                "drain interval must be non-zero".into()
            ));
        }

        if self.event_capacity == 0 {
            return Err(KernelError::InvalidConfiguration(
                "event_capacity must be at least 1".into()
            ));
        }

        Ok(())
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Process table capacity; PIDs range over `0..max_processes`
    pub max_processes: usize,

    /// Live processes allowed per non-root uid
    pub max_user_processes: usize,

    /// Slots probed per PID allocation before giving up
    pub pid_probe_budget: usize,

    /// Run a drain pass after every kill
    pub drain_on_kill: bool,

    /// Periodic drain, off when unset
    #[serde(default, with = "humantime_serde")]
    pub drain_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_processes: MAX_PROCESSES,
            max_user_processes: MAX_USER_PROCESSES,
            pid_probe_budget: MAX_PROCESSES,
            drain_on_kill: true,
            drain_interval: None,
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Period between heartbeats
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Delay before the first heartbeat
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
            grace_period: HEARTBEAT_GRACE_PERIOD,
        }
    }
}

impl HeartbeatConfig {
    pub fn timing(&self) -> HeartbeatTiming {
        HeartbeatTiming {
            interval: self.interval,
            grace_period: self.grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.scheduler.max_processes, 200);
        assert_eq!(config.scheduler.max_user_processes, 20);
        assert!(config.scheduler.drain_on_kill);
        assert_eq!(config.heartbeat.interval, Duration::from_millis(1000));
        assert_eq!(config.heartbeat.grace_period, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = KernelConfig::testing();
        assert!(config.validate().is_ok());

        config.scheduler.pid_probe_budget = 0;
        assert!(config.validate().is_err());

        let mut config = KernelConfig::testing();
        config.heartbeat.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let config = KernelConfig::default().with_limits(0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel.json");

        let mut config = KernelConfig::testing();
        config.scheduler.drain_interval = Some(Duration::from_millis(250));
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"1s\""));

        let loaded = KernelConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel.json");

        let config = KernelConfig::default().with_limits(4, 0);
        config.save(&path).unwrap();
        assert!(matches!(
            KernelConfig::load(&path),
            Err(KernelError::InvalidConfiguration(_))
        ));

        assert!(KernelConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
