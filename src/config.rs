//! Pool-wide configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Global configuration for the pool.
///
/// All intervals are tunable so that tests can run the background tasks at
/// millisecond cadence; the defaults are production values.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Total process budget across all groups (default: 6)
    #[serde(default = "default_max")]
    pub max: usize,

    /// Idle time after which an enabled process above its group's minimum
    /// is garbage collected, in seconds (default: 300)
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time_secs: u64,

    /// Idle time after which a group's preloader is cleaned up, in seconds
    /// (default: 900)
    #[serde(default = "default_preloader_idle_time")]
    pub preloader_idle_time_secs: u64,

    /// Ceiling on the garbage collector's sleep between runs, in seconds
    /// (default: 300). The GC wakes earlier when a deadline is pending.
    #[serde(default = "default_gc_interval_ceiling")]
    pub gc_interval_ceiling_secs: u64,

    /// Cadence of the detached-process checker, in milliseconds (default: 1000)
    #[serde(default = "default_detached_check_interval")]
    pub detached_check_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL for a detached process that
    /// has drained its sessions, in seconds (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Cadence of the analytics collector, in milliseconds (default: 5000).
    /// Set to 0 to disable collection.
    #[serde(default = "default_analytics_interval")]
    pub analytics_interval_ms: u64,

    /// Re-verify pool invariants after every mutating operation (default: false)
    #[serde(default)]
    pub self_checking: bool,

    /// Hook scripts invoked on lifecycle events, keyed by event name
    /// (`attached_process`, `detached_process`, `spawn_failed`, `oob_work`)
    #[serde(default)]
    pub hooks: HashMap<String, HookScript>,
}

/// A single configured hook script.
#[derive(Debug, Deserialize, Clone)]
pub struct HookScript {
    /// Shell command to run
    pub command: String,

    /// A non-zero exit from a mandatory hook is surfaced as an error instead
    /// of being logged and swallowed (default: false)
    #[serde(default)]
    pub mandatory: bool,
}

fn default_max() -> usize {
    6
}

fn default_max_idle_time() -> u64 {
    300
}

fn default_preloader_idle_time() -> u64 {
    900
}

fn default_gc_interval_ceiling() -> u64 {
    300
}

fn default_detached_check_interval() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_analytics_interval() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: default_max(),
            max_idle_time_secs: default_max_idle_time(),
            preloader_idle_time_secs: default_preloader_idle_time(),
            gc_interval_ceiling_secs: default_gc_interval_ceiling(),
            detached_check_interval_ms: default_detached_check_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            analytics_interval_ms: default_analytics_interval(),
            self_checking: false,
            hooks: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn preloader_idle_time(&self) -> Duration {
        Duration::from_secs(self.preloader_idle_time_secs)
    }

    pub fn gc_interval_ceiling(&self) -> Duration {
        Duration::from_secs(self.gc_interval_ceiling_secs)
    }

    pub fn detached_check_interval(&self) -> Duration {
        Duration::from_millis(self.detached_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn analytics_interval(&self) -> Option<Duration> {
        if self.analytics_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.analytics_interval_ms))
        }
    }
}
