//! OS boundary traits.
//!
//! The host platform implements these; the engine only ever talks to the OS
//! through them. Permission and provider state are re-queried on every use
//! because the user can revoke either at any moment.

use serde::{Deserialize, Serialize};

use crate::tracker::Command;
use crate::TrackerResult;

// ============================================================================
// Permissions and provider availability
// ============================================================================

/// Capability checks against the OS.
pub trait AccessChecker: Send + Sync {
    /// Foreground location permission (enough for a user-initiated start).
    fn has_location_permission(&self) -> bool;

    /// Background-capable location permission, required when there is no
    /// visible activity to ask the user from (boot, restart).
    fn has_background_location_permission(&self) -> bool;

    /// Whether the device's location provider is switched on.
    fn is_location_provider_enabled(&self) -> bool;
}

// ============================================================================
// Status indicator
// ============================================================================

/// Content of the persistent, user-visible tracking indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub session_id: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub point_count: u32,
}

impl StatusUpdate {
    pub const TITLE: &'static str = "Tracking location";

    /// Action id of the single embedded "stop" button.
    pub const STOP_ACTION: &'static str = "stop";

    /// Indicator shown before the first fix arrives.
    pub fn waiting(session_id: i64, point_count: u32) -> Self {
        Self {
            session_id,
            latitude: None,
            longitude: None,
            address: None,
            point_count,
        }
    }

    pub fn text(&self) -> String {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => {
                let coords = format!("Lat: {:.5}, Lon: {:.5}", lat, lng);
                match &self.address {
                    Some(address) => format!("{}\n{}", coords, address),
                    None => coords,
                }
            }
            _ => "Waiting for location...".to_string(),
        }
    }
}

/// The persistent status indicator (a foreground notification on mobile).
pub trait StatusNotifier: Send + Sync {
    /// Promote the task to a long-running, user-visible state.
    fn promote(&self, status: &StatusUpdate);

    /// Refresh the indicator content. Called at a throttled cadence.
    fn update(&self, status: &StatusUpdate);

    /// Tear down the indicator and the long-running state.
    fn dismiss(&self);
}

// ============================================================================
// Clock
// ============================================================================

/// Wall-clock source in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ============================================================================
// Task launching
// ============================================================================

/// Asks the OS to (re)launch the tracking task with a command.
pub trait TaskLauncher: Send + Sync {
    fn launch(&self, command: Command) -> TrackerResult<()>;
}
