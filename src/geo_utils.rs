//! Geographic utilities: distance, bearing and speed over GPS points.
//!
//! All distances are great-circle (Haversine) distances in meters.

use geo::{algorithm::simplify::Simplify, Coord, LineString};

use crate::{GpsPoint, LocationPoint};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters.
///
/// # Example
/// ```
/// use location_tracker::{geo_utils::haversine_distance, GpsPoint};
///
/// let a = GpsPoint::new(0.0, 0.0);
/// let b = GpsPoint::new(0.0, 1.0);
/// let d = haversine_distance(&a, &b);
/// assert!((d - 111_195.0).abs() < 1.0);
/// ```
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from `from` to `to` in degrees, normalized to [0, 360).
pub fn initial_bearing(from: &GpsPoint, to: &GpsPoint) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlng = (to.longitude - from.longitude).to_radians();

    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Speed in m/s covering `distance_m` in `elapsed_ms`.
///
/// Returns None for a non-positive elapsed time.
pub fn speed_mps(distance_m: f64, elapsed_ms: i64) -> Option<f64> {
    if elapsed_ms <= 0 {
        return None;
    }
    Some(distance_m / (elapsed_ms as f64 / 1000.0))
}

/// Total length of a polyline in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Total distance of a recorded track (Haversine sum over consecutive points).
pub fn track_distance(points: &[LocationPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0].position(), &w[1].position()))
        .sum()
}

/// Speed and bearing implied by moving from `prev` to `next` over `elapsed_ms`.
pub fn motion_between(prev: &GpsPoint, next: &GpsPoint, elapsed_ms: i64) -> Option<(f64, f64)> {
    let speed = speed_mps(haversine_distance(prev, next), elapsed_ms)?;
    Some((speed, initial_bearing(prev, next)))
}

/// Douglas-Peucker simplification of a track.
///
/// `tolerance` is in degrees (0.0001 is roughly 11 meters).
pub fn simplify_track(points: &[GpsPoint], tolerance: f64) -> Vec<GpsPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let coords: Vec<Coord> = points
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();

    LineString::new(coords)
        .simplify(&tolerance)
        .0
        .iter()
        .map(|c| GpsPoint::new(c.y, c.x))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(session_id: i64, lat: f64, lng: f64, timestamp: i64) -> LocationPoint {
        LocationPoint {
            session_id,
            latitude: lat,
            longitude: lng,
            timestamp,
            accuracy: None,
            altitude: None,
            speed: None,
            bearing: None,
            address: None,
        }
    }

    #[test]
    fn test_haversine_london_paris() {
        let london = GpsPoint::new(51.5074, -0.1278);
        let paris = GpsPoint::new(48.8566, 2.3522);
        let d = haversine_distance(&london, &paris);
        assert!(d > 340_000.0 && d < 345_000.0, "got {}", d);
    }

    #[test]
    fn test_haversine_same_point_is_zero() {
        let p = GpsPoint::new(10.0, 20.0);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = GpsPoint::new(0.0, 0.0);
        assert!((initial_bearing(&origin, &GpsPoint::new(1.0, 0.0)) - 0.0).abs() < 1e-6);
        assert!((initial_bearing(&origin, &GpsPoint::new(0.0, 1.0)) - 90.0).abs() < 1e-6);
        assert!((initial_bearing(&origin, &GpsPoint::new(-1.0, 0.0)) - 180.0).abs() < 1e-6);
        assert!((initial_bearing(&origin, &GpsPoint::new(0.0, -1.0)) - 270.0).abs() < 1e-6);
    }

    #[test]
    fn test_speed_requires_positive_elapsed() {
        assert_eq!(speed_mps(100.0, 10_000), Some(10.0));
        assert_eq!(speed_mps(100.0, 0), None);
        assert_eq!(speed_mps(100.0, -1), None);
    }

    #[test]
    fn test_track_distance_matches_polyline_length() {
        let track = vec![
            point(1, 51.5074, -0.1278, 0),
            point(1, 51.5080, -0.1290, 1_000),
            point(1, 51.5090, -0.1300, 2_000),
        ];
        let positions: Vec<GpsPoint> = track.iter().map(|p| p.position()).collect();

        let d = track_distance(&track);
        assert!(d > 0.0);
        assert!((d - polyline_length(&positions)).abs() < 1e-9);
        assert_eq!(track_distance(&track[..1]), 0.0);
    }

    #[test]
    fn test_motion_between() {
        let a = GpsPoint::new(0.0, 0.0);
        let b = GpsPoint::new(0.0, 0.001);
        let (speed, bearing) = motion_between(&a, &b, 10_000).unwrap();
        assert!((speed - 11.1195).abs() < 0.01);
        assert!((bearing - 90.0).abs() < 1e-6);
        assert!(motion_between(&a, &b, 0).is_none());
    }

    #[test]
    fn test_simplify_straight_line() {
        let line: Vec<GpsPoint> = (0..20)
            .map(|i| GpsPoint::new(51.5 + i as f64 * 0.001, -0.12))
            .collect();
        let simplified = simplify_track(&line, 0.0001);
        assert_eq!(simplified.len(), 2);
        assert_eq!(simplified[0], line[0]);
        assert_eq!(simplified[1], line[19]);
    }
}
