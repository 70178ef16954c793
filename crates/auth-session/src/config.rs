//! Session tuning knobs

use std::time::Duration;

use serde::Deserialize;

/// Session configuration, usually the `[session]` table of a host's TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// A token counts as expired this long before its `expires_at`.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_tolerance_secs: u64,
    /// Start the proactive refresh task when the manager is built.
    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// The proactive task refreshes tokens expiring within this window.
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

fn default_clock_skew() -> u64 {
    60
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_refresh_threshold() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance_secs: default_clock_skew(),
            auto_refresh: false,
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

impl SessionConfig {
    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock_skew_tolerance_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    /// Reject settings the refresh task cannot run with.
    pub fn validate(&self) -> common::Result<()> {
        if self.auto_refresh && self.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0 when auto_refresh is enabled".into(),
            ));
        }
        if self.auto_refresh && self.refresh_threshold_secs < self.clock_skew_tolerance_secs {
            return Err(common::Error::Config(format!(
                "refresh_threshold_secs ({}) must not be below clock_skew_tolerance_secs ({})",
                self.refresh_threshold_secs, self.clock_skew_tolerance_secs
            )));
        }
        Ok(())
    }
}
