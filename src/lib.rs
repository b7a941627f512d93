//! # Location Tracker
//!
//! Continuous GPS tracking engine for mobile clients.
//!
//! This library provides:
//! - A long-running sampling task that groups fixes into tracking sessions
//! - Durable SQLite storage for sessions and their point sequences
//! - A durable run-state record so tracking resumes after process death,
//!   OS service kills and device reboots
//! - Best-effort reverse geocoding behind a hard timeout
//!
//! ## Features
//!
//! - **`http`** - Enable the OpenStreetMap Nominatim reverse geocoder
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use location_tracker::{geo_utils, GpsPoint};
//!
//! let london = GpsPoint::new(51.5074, -0.1278);
//! let paris = GpsPoint::new(48.8566, 2.3522);
//! let meters = geo_utils::haversine_distance(&london, &paris);
//! assert!(meters > 340_000.0 && meters < 345_000.0);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{GeocodeError, SourceError, StoreError, StoreResult, TrackerError, TrackerResult};

// Tuning knobs
pub mod config;
pub use config::TrackerConfig;

// Geographic utilities (distance, bearing, speed)
pub mod geo_utils;

// Durable session storage
pub mod store;
pub use store::{SessionStore, SqliteSessionStore};

// Durable "is tracking intended" record
pub mod run_state;
pub use run_state::{FileRunStateStore, RunState, RunStateStore};

// Best-effort address lookup
pub mod geocode;
pub use geocode::{Geocoder, NoopGeocoder, ReverseGeocoder};

#[cfg(feature = "http")]
pub use geocode::NominatimGeocoder;

// OS boundary: permissions, provider, status indicator, clock, launcher
pub mod platform;
pub use platform::{AccessChecker, Clock, StatusNotifier, StatusUpdate, SystemClock, TaskLauncher};

// Location sampling sources
pub mod source;
pub use source::{ChannelLocationSource, LocationSource};

// Process-wide collaborator lookup
pub mod services;
pub use services::{install_services, resolve_services, Services, TrackerEvent};

// The tracking task and its command protocol
pub mod tracker;
pub use tracker::{Command, CommandQueue, LivenessFlag, Outcome, StatusThrottle, TrackingTask};

// Device boot entry point
pub mod boot;
pub use boot::{BootOutcome, BootReactor};

// Permission / provider loss detection
pub mod access;
pub use access::{AccessLoss, AccessReactor};

// Session query surface for the UI
pub mod summary;
pub use summary::{watch_overviews, SessionOverview};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("LocationTracker"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use location_tracker::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A contiguous tracking run from start to stop.
///
/// `end_time == None` means the session is open and still accumulating points.
/// At most one open session exists at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Creation-time derived, unique
    pub session_id: i64,
    /// Unix timestamp in milliseconds
    pub start_time: i64,
    /// Unix timestamp in milliseconds, None while open
    pub end_time: Option<i64>,
    /// Cached number of points, updated atomically with each append
    pub point_count: u32,
}

impl Session {
    /// A new open session starting at `start_time`.
    pub fn open(session_id: i64, start_time: i64) -> Self {
        Self {
            session_id,
            start_time,
            end_time: None,
            point_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Copy of this session with `end_time` set.
    pub fn closed_at(&self, end_time: i64) -> Self {
        Self {
            end_time: Some(end_time),
            ..*self
        }
    }
}

/// A single accepted, timestamped sample belonging to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPoint {
    pub session_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp in milliseconds (wall clock at acceptance)
    pub timestamp: i64,
    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// Speed in m/s
    pub speed: Option<f64>,
    /// Bearing in degrees, 0 = north
    pub bearing: Option<f64>,
    /// Reverse-geocoded address, None if not resolved in time
    pub address: Option<String>,
}

impl LocationPoint {
    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// A session together with its points, ordered by timestamp ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWithPoints {
    pub session: Session,
    pub points: Vec<LocationPoint>,
}

/// A raw fix delivered by a location source, before it is stamped and stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
}

impl LocationSample {
    /// A fix carrying only a position.
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            altitude: None,
            speed: None,
            bearing: None,
        }
    }

    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_session_close_keeps_identity() {
        let open = Session::open(1_000, 1_000);
        assert!(open.is_open());

        let closed = open.closed_at(2_500);
        assert!(!closed.is_open());
        assert_eq!(closed.session_id, 1_000);
        assert_eq!(closed.start_time, 1_000);
        assert_eq!(closed.end_time, Some(2_500));
    }

    #[test]
    fn test_session_json_is_camel_case() {
        let json = serde_json::to_string(&Session::open(7, 7)).unwrap();
        assert!(json.contains("\"sessionId\":7"));
        assert!(json.contains("\"endTime\":null"));
    }
}
