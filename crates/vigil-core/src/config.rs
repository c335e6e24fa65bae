//! Per-root configuration for the reconciliation engine.
//!
//! [`RootConfig`] contains all tuning knobs for one watched root. All fields
//! have sensible defaults; override selectively via TOML
//! ([`RootConfig::from_toml_str`]) or environment variables
//! ([`RootConfig::with_env_overrides`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

/// Configuration knobs for one watched root.
///
/// # Environment Variable Overrides
///
/// | Variable                  | Field                    | Default       |
/// |---------------------------|--------------------------|---------------|
/// | `VIGIL_TRIGGER_SETTLE_MS` | `trigger_settle_ms`      | `20`          |
/// | `VIGIL_GC_INTERVAL_MS`    | `gc_interval_ms`         | `86_400_000`  |
/// | `VIGIL_GC_AGE_MS`         | `gc_age_ms`              | `259_200_000` |
/// | `VIGIL_IDLE_REAP_AGE_MS`  | `idle_reap_age_ms`       | `432_000_000` |
/// | `VIGIL_NOTIFY_SLEEP_MS`   | `notify_sleep_ms`        | `0`           |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Quiet period (ms) that must elapse with no events before the root is
    /// considered settled. Also the worker's baseline wait timeout.
    pub trigger_settle_ms: u64,

    /// Minimum interval (ms) between age-out passes over deleted nodes.
    /// `0` disables age-out.
    pub gc_interval_ms: u64,

    /// Age (ms) a deleted node must reach before an age-out pass reclaims
    /// it.
    pub gc_age_ms: u64,

    /// Idle age (ms) after which the root is eligible for reaping.
    /// `0` disables reaping.
    pub idle_reap_age_ms: u64,

    /// Delay (ms) applied after waking on notifications, working around
    /// kernels that report events before the file has left the cache.
    /// Adds latency to every sync; leave at `0` unless affected.
    pub notify_sleep_ms: u64,

    /// Pre-size hint for a directory's child map on first scan.
    pub hint_num_files_per_dir: usize,

    /// Whether child names are compared case-sensitively. Defaults to the
    /// platform convention.
    pub case_sensitive: bool,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            trigger_settle_ms: 20,
            gc_interval_ms: 86_400_000,
            gc_age_ms: 259_200_000,
            idle_reap_age_ms: 432_000_000,
            notify_sleep_ms: 0,
            hint_num_files_per_dir: 64,
            case_sensitive: default_case_sensitive(),
        }
    }
}

const fn default_case_sensitive() -> bool {
    !cfg!(any(windows, target_os = "macos"))
}

impl RootConfig {
    /// Parse a TOML fragment into a config, falling back to defaults for
    /// absent keys.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidConfig`] when the fragment does not
    /// parse.
    pub fn from_toml_str(contents: &str) -> WatchResult<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| WatchError::InvalidConfig {
            field: "(toml)",
            value: e.to_string(),
            reason: "not a valid root config fragment",
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load overrides from environment variables.
    ///
    /// Only overrides fields for which variables are set; unparsable values
    /// are logged and ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        for (key, field) in [
            ("VIGIL_TRIGGER_SETTLE_MS", &mut self.trigger_settle_ms),
            ("VIGIL_GC_INTERVAL_MS", &mut self.gc_interval_ms),
            ("VIGIL_GC_AGE_MS", &mut self.gc_age_ms),
            ("VIGIL_IDLE_REAP_AGE_MS", &mut self.idle_reap_age_ms),
            ("VIGIL_NOTIFY_SLEEP_MS", &mut self.notify_sleep_ms),
        ] {
            if let Ok(raw) = std::env::var(key) {
                match raw.parse::<u64>() {
                    Ok(value) => *field = value,
                    Err(_) => {
                        tracing::warn!(key, value = %raw, "ignoring unparsable env override");
                    }
                }
            }
        }
        self
    }

    /// Check invariants between knobs.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidConfig`] for values the worker cannot
    /// run with.
    pub fn validate(&self) -> WatchResult<()> {
        if self.trigger_settle_ms == 0 {
            return Err(WatchError::InvalidConfig {
                field: "trigger_settle_ms",
                value: "0".into(),
                reason: "the settle period must be non-zero; the worker wait would spin",
            });
        }
        if self.hint_num_files_per_dir == 0 {
            return Err(WatchError::InvalidConfig {
                field: "hint_num_files_per_dir",
                value: "0".into(),
                reason: "the size hint must be at least 1",
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn trigger_settle(&self) -> Duration {
        Duration::from_millis(self.trigger_settle_ms)
    }

    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    #[must_use]
    pub const fn gc_age(&self) -> Duration {
        Duration::from_millis(self.gc_age_ms)
    }

    #[must_use]
    pub const fn idle_reap_age(&self) -> Duration {
        Duration::from_millis(self.idle_reap_age_ms)
    }

    #[must_use]
    pub const fn notify_sleep(&self) -> Option<Duration> {
        if self.notify_sleep_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.notify_sleep_ms))
        }
    }
}
