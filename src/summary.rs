//! Session query surface for the UI.
//!
//! Turns stored sessions into display-ready overviews: total distance,
//! average speed, formatted duration and local start/end times.

use chrono::{DateTime, FixedOffset, Local, Offset};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::geo_utils;
use crate::store::SessionStore;
use crate::{GpsPoint, LocationPoint, SessionWithPoints, StoreResult};

/// Douglas-Peucker tolerance for the map preview (about 11 m).
const PREVIEW_TOLERANCE: f64 = 0.0001;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Display-ready view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub session_id: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub point_count: u32,
    /// Ordered by timestamp ascending
    pub points: Vec<LocationPoint>,
    /// Haversine sum over consecutive points, meters
    pub distance_m: f64,
    /// Meters per second over the elapsed time, 0 if no time has elapsed
    pub avg_speed_mps: f64,
    /// `HH:MM:SS`
    pub duration: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    /// Simplified track for map thumbnails
    pub preview: Vec<GpsPoint>,
}

impl SessionOverview {
    pub fn from_session(stored: &SessionWithPoints, offset: FixedOffset) -> Self {
        let session = &stored.session;
        let points = &stored.points;

        let distance_m = geo_utils::track_distance(points);

        // Open sessions run until their latest point
        let until = session
            .end_time
            .or_else(|| points.last().map(|p| p.timestamp))
            .unwrap_or(session.start_time);
        let elapsed_ms = (until - session.start_time).max(0);

        let avg_speed_mps = geo_utils::speed_mps(distance_m, elapsed_ms).unwrap_or(0.0);

        let track: Vec<GpsPoint> = points.iter().map(LocationPoint::position).collect();

        Self {
            session_id: session.session_id,
            start_time: session.start_time,
            end_time: session.end_time,
            point_count: session.point_count,
            points: points.clone(),
            distance_m,
            avg_speed_mps,
            duration: format_duration(elapsed_ms),
            started_at: format_timestamp(session.start_time, offset),
            ended_at: session.end_time.map(|end| format_timestamp(end, offset)),
            preview: geo_utils::simplify_track(&track, PREVIEW_TOLERANCE),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// The device's current UTC offset.
pub fn local_offset() -> FixedOffset {
    Local::now().offset().fix()
}

/// Format milliseconds as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_duration(ms: i64) -> String {
    let total_secs = ms.max(0) / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

/// Format a Unix-millisecond timestamp in `offset`.
pub fn format_timestamp(ms: i64, offset: FixedOffset) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|utc| utc.with_timezone(&offset).format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Overview of every stored session.
pub fn overviews(
    store: &dyn SessionStore,
    offset: FixedOffset,
) -> StoreResult<Vec<SessionOverview>> {
    Ok(store
        .sessions_snapshot()?
        .iter()
        .map(|s| SessionOverview::from_session(s, offset))
        .collect())
}

/// Live overviews: emits now and after every store mutation.
pub fn watch_overviews(
    store: &dyn SessionStore,
    offset: FixedOffset,
) -> BoxStream<'static, StoreResult<Vec<SessionOverview>>> {
    store
        .get_all_sessions()
        .map(move |snapshot| {
            snapshot.map(|sessions| {
                sessions
                    .iter()
                    .map(|s| SessionOverview::from_session(s, offset))
                    .collect()
            })
        })
        .boxed()
}
