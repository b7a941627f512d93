//! Tracker configuration.

use serde::{Deserialize, Serialize};

/// Tuning knobs for the tracking task.
///
/// Hosts may pass a partial JSON document over FFI; missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    /// Sampling interval used when the run-state carries no interval.
    /// Default: 5000 ms
    pub default_interval_ms: i64,

    /// Requested intervals below this are raised to it.
    /// Default: 1000 ms
    pub min_interval_ms: i64,

    /// Hard timeout for a single reverse-geocode lookup.
    /// Default: 2000 ms
    pub geocode_timeout_ms: u64,

    /// Fraction of the sampling interval that must elapse between two status
    /// indicator updates. Storage cadence is unaffected.
    /// Default: 0.7
    pub status_throttle_ratio: f64,

    /// Derive speed and bearing from the previous point when a fix lacks them.
    /// Default: true
    pub derive_motion: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 5_000,
            min_interval_ms: 1_000,
            geocode_timeout_ms: 2_000,
            status_throttle_ratio: 0.7,
            derive_motion: true,
        }
    }
}

impl TrackerConfig {
    /// Parse a (possibly partial) JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Resolve the interval a run should use: the persisted/requested value
    /// if present, clamped to `min_interval_ms`.
    pub fn effective_interval_ms(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_interval_ms)
            .max(self.min_interval_ms)
    }

    pub fn geocode_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.geocode_timeout_ms)
    }
}
