//! # Parking Guard
//!
//! Geofenced parking-restriction detection for a moving GPS position.
//!
//! This library provides:
//! - Point-to-polyline geometry with bounding-box pre-filtering
//! - Weekly restriction schedules (restricted days and time ranges)
//! - A zone watcher emitting enter/exit events as the user moves along
//!   restricted streets
//! - A confirmed-parking manager scheduling an end-of-parking reminder and
//!   auto-clearing on expiry or movement
//! - A route cache used as fallback when the live fetch fails
//! - [`ParkingGuard`], a tokio service tying these together behind a
//!   cloneable [`GuardHandle`]
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::NaiveDate;
//! use parking_guard::{LocationSample, RouteRecord, WatchConfig, ZoneWatcher};
//!
//! let record: RouteRecord = serde_json::from_str(r#"{
//!     "id": 7,
//!     "street": "Rue de Rivoli",
//!     "coordinates": [[2.3500, 48.8566], [2.3530, 48.8566]],
//!     "days": ["Monday"],
//!     "time_ranges": [{"start": "07:00:00", "end": "09:00:00"}]
//! }"#).unwrap();
//!
//! let mut watcher = ZoneWatcher::new(WatchConfig::default());
//! watcher.set_routes(parking_guard::validate_records(vec![record]));
//!
//! // 2024-01-01 is a Monday
//! let now = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
//! let sample = LocationSample::new(48.8567, 2.3515, now.and_utc());
//!
//! let events = watcher.update(Some(sample), &now);
//! assert_eq!(events.len(), 1);
//! assert_eq!(watcher.current_zone().unwrap().street(), "Rue de Rivoli");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{CacheError, GuardError, ParkingError, ProviderError, RouteError, SinkError};

pub mod geo_utils;

pub mod schedule;
pub use schedule::{complement_time_ranges, RestrictionSchedule, TimeRange};

pub mod routes;
pub use routes::{
    validate_records, RestrictedRoute, RestrictionKind, RouteId, RouteRecord, RouteSet, Side,
    TimeRangeRecord,
};

pub mod providers;
pub use providers::{
    Clock, LoggingSink, ManualClock, NotificationSink, Reminder, ReminderId, RouteProvider,
    StaticRouteProvider, SystemClock,
};

pub mod cache;
pub use cache::{CachedRoutes, FileStore, KeyValueStore, MemoryStore, RouteCache};

pub mod watcher;
pub use watcher::{WatchConfig, WatchStats, ZoneEvent, ZoneWatcher};

pub mod parking;
pub use parking::{ConfirmedParking, ParkingConfig, ParkingManager};

pub mod refresh;
pub use refresh::{refresh_routes, RefreshOutcome, RefreshPolicy, RouteSource};

pub mod service;
pub use service::{GuardConfig, GuardHandle, ParkingGuard};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use parking_guard::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
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

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Grow the box by `meters` on every side.
    ///
    /// The longitude margin is computed at the latitude farthest from the
    /// equator, where longitude degrees are shortest.
    pub fn expand(&self, meters: f64) -> Self {
        if meters <= 0.0 {
            return *self;
        }
        let lat_margin = meters / geo_utils::METERS_PER_DEGREE;
        let widest_lat = self.min_lat.abs().max(self.max_lat.abs());
        let lng_margin = geo_utils::meters_to_degrees(meters, widest_lat);

        Self {
            min_lat: self.min_lat - lat_margin,
            max_lat: self.max_lat + lat_margin,
            min_lng: self.min_lng - lng_margin,
            max_lng: self.max_lng + lng_margin,
        }
    }
}

/// One position fix from the location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self { latitude, longitude, timestamp }
    }

    pub fn point(&self) -> GpsPoint {
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
    fn test_bounds_expand() {
        let b = Bounds { min_lat: 48.8566, max_lat: 48.8566, min_lng: 2.35, max_lng: 2.353 };
        let grown = b.expand(40.0);
        // 40m of latitude is ~0.00036 degrees
        assert!((grown.max_lat - b.max_lat - 40.0 / geo_utils::METERS_PER_DEGREE).abs() < 1e-12);
        // Longitude degrees are shorter at this latitude, so the margin is wider
        assert!(grown.max_lng - b.max_lng > grown.max_lat - b.max_lat);
        assert_eq!(b.expand(0.0), b);
    }

    #[test]
    fn test_bounds_expand_covers_haversine_radius() {
        let b = Bounds { min_lat: 48.8566, max_lat: 48.8566, min_lng: 2.35, max_lng: 2.353 };
        let grown = b.expand(40.0);
        let north = GpsPoint::new(grown.max_lat, 2.3515);
        let east = GpsPoint::new(48.8566, grown.max_lng);
        assert!(geo_utils::haversine_distance(&GpsPoint::new(48.8566, 2.3515), &north) >= 40.0 - 1e-6);
        assert!(geo_utils::haversine_distance(&GpsPoint::new(48.8566, 2.353), &east) >= 40.0 - 1e-6);
    }

    #[test]
    fn test_location_sample_point() {
        let s = LocationSample::new(48.8566, 2.3522, Utc::now());
        assert_eq!(s.point(), GpsPoint::new(48.8566, 2.3522));
    }
}
