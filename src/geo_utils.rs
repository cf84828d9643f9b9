//! # Geographic Utilities
//!
//! Geometry kernel for zone detection: point distances, point-to-polyline
//! distances and bounding-box pre-filtering.
//!
//! All functions are pure and never fail. Malformed input degrades to a value
//! that cannot match anything (an infinite distance, an empty box) instead of
//! panicking.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`point_to_segment_distance`] | Distance from a point to a line segment |
//! | [`point_to_polyline_distance`] | Minimum distance from a point to a polyline |
//! | [`is_point_near_polyline`] | Tolerance check against a polyline |
//! | [`compute_bounds`] | Bounding box of a polyline |
//! | [`is_within_bounds`] | Inclusive bounding-box containment |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! ## Example
//!
//! ```rust
//! use parking_guard::{GpsPoint, geo_utils};
//!
//! let street = vec![
//!     GpsPoint::new(48.8566, 2.3500),
//!     GpsPoint::new(48.8566, 2.3530),
//! ];
//!
//! // ~11m north of the street centerline
//! let me = GpsPoint::new(48.8567, 2.3515);
//! let dist = geo_utils::point_to_polyline_distance(&me, &street);
//! assert!(dist > 5.0 && dist < 20.0);
//! assert!(geo_utils::is_point_near_polyline(&me, &street, 40.0));
//! ```
//!
//! ## Algorithm Notes
//!
//! Segment projection uses an equirectangular approximation centered on the
//! query point. At city scale (spans up to ~20km) the projected parameter is
//! accurate enough; the final distance is always measured with haversine.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

/// Mean Earth radius used by [`geo::Haversine`].
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Meters per degree of latitude (and of longitude at the equator), on the
/// same sphere the haversine distances are measured on.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// Returns the distance in meters along the Earth's surface.
///
/// # Example
///
/// ```rust
/// use parking_guard::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Distance in meters from `point` to the segment `start..end`.
///
/// The point is projected onto the segment in a local equirectangular frame,
/// the projection parameter is clamped to `[0, 1]`, and the haversine distance
/// to the projected point is returned. A zero-length segment is treated as the
/// single point `start`.
pub fn point_to_segment_distance(point: &GpsPoint, start: &GpsPoint, end: &GpsPoint) -> f64 {
    // Longitude degrees shrink with latitude; scale them so both axes are comparable.
    let kx = point.latitude.to_radians().cos();

    let ax = (start.longitude - point.longitude) * kx;
    let ay = start.latitude - point.latitude;
    let dx = (end.longitude - start.longitude) * kx;
    let dy = end.latitude - start.latitude;

    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 || !len_sq.is_finite() {
        return haversine_distance(point, start);
    }

    let t = (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0);
    let projected = GpsPoint::new(
        start.latitude + t * (end.latitude - start.latitude),
        start.longitude + t * (end.longitude - start.longitude),
    );

    haversine_distance(point, &projected)
}

/// Minimum distance in meters from `point` to any segment of `polyline`.
///
/// Polylines with fewer than two points cannot contain anything and yield
/// `f64::INFINITY`.
///
/// # Example
///
/// ```rust
/// use parking_guard::{GpsPoint, geo_utils};
///
/// let single = vec![GpsPoint::new(48.8566, 2.3522)];
/// let p = GpsPoint::new(48.8566, 2.3522);
/// assert!(geo_utils::point_to_polyline_distance(&p, &single).is_infinite());
/// ```
pub fn point_to_polyline_distance(point: &GpsPoint, polyline: &[GpsPoint]) -> f64 {
    if polyline.len() < 2 {
        return f64::INFINITY;
    }

    polyline
        .windows(2)
        .map(|w| point_to_segment_distance(point, &w[0], &w[1]))
        .fold(f64::INFINITY, f64::min)
}

/// Check whether `point` lies within `tolerance_meters` of `polyline`.
#[inline]
pub fn is_point_near_polyline(point: &GpsPoint, polyline: &[GpsPoint], tolerance_meters: f64) -> bool {
    point_to_polyline_distance(point, polyline) <= tolerance_meters
}

/// Calculate the total length of a polyline in meters.
///
/// Empty or single-point polylines return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Convert meters to approximate degrees of longitude at a given latitude.
///
/// Degrees of longitude shrink with `cos(latitude)`, so the returned value is
/// at least as large as the equivalent in latitude degrees. Near the poles the
/// cosine is floored to keep the result finite.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = METERS_PER_DEGREE * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Compute the bounding box of a polyline in a single pass.
///
/// For empty input the result has inverted MIN/MAX values, so
/// [`is_within_bounds`] rejects every point.
///
/// # Example
///
/// ```rust
/// use parking_guard::{GpsPoint, geo_utils};
///
/// let track = vec![
///     GpsPoint::new(51.5000, -0.1300),
///     GpsPoint::new(51.5100, -0.1200),
///     GpsPoint::new(51.5050, -0.1250),
/// ];
///
/// let bounds = geo_utils::compute_bounds(&track);
/// assert_eq!(bounds.min_lat, 51.5000);
/// assert_eq!(bounds.max_lat, 51.5100);
/// assert_eq!(bounds.min_lng, -0.1300);
/// assert_eq!(bounds.max_lng, -0.1200);
/// ```
pub fn compute_bounds(points: &[GpsPoint]) -> Bounds {
    let mut min_lat = f64::MAX;
    let mut max_lat = f64::MIN;
    let mut min_lng = f64::MAX;
    let mut max_lng = f64::MIN;

    for p in points {
        min_lat = min_lat.min(p.latitude);
        max_lat = max_lat.max(p.latitude);
        min_lng = min_lng.min(p.longitude);
        max_lng = max_lng.max(p.longitude);
    }

    Bounds { min_lat, max_lat, min_lng, max_lng }
}

/// Inclusive containment check on both axes.
#[inline]
pub fn is_within_bounds(point: &GpsPoint, bounds: &Bounds) -> bool {
    point.latitude >= bounds.min_lat
        && point.latitude <= bounds.max_lat
        && point.longitude >= bounds.min_lng
        && point.longitude <= bounds.max_lng
}

// =============================================================================
// Unit Tests
// =============================================================================
