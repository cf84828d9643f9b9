//! Restricted routes: the typed ingestion boundary and the working set.
//!
//! Route data arrives from an external provider as loosely-shaped
//! [`RouteRecord`]s. Each record is validated into an immutable
//! [`RestrictedRoute`] before it can reach the zone watcher; malformed records
//! (no id, fewer than two valid points, unknown weekdays, unparseable times)
//! are rejected and logged.
//!
//! A [`RouteSet`] is one fetch worth of routes in fetch order, with an R-tree
//! over their bounding boxes for cheap candidate lookup.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RouteError;
use crate::geo_utils::{compute_bounds, point_to_polyline_distance, polyline_length};
use crate::schedule::{parse_weekday, weekday_name, RestrictionSchedule, TimeRange, TIME_FORMAT};
use crate::{Bounds, GpsPoint};

// ============================================================================
// Identifiers and tags
// ============================================================================

/// Whole-number float ids below this (2^53) are exact integers.
const MAX_EXACT_FLOAT_ID: f64 = 9_007_199_254_740_992.0;

/// Route identifier, normalized to a string.
///
/// Backends send ids both as JSON numbers and as strings. Both deserialize to
/// the same `RouteId`, so `42` and `"42"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RouteId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<u64> for RouteId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for RouteId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for RouteId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
            Float(f64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => RouteId::new(s),
            RawId::Unsigned(n) => RouteId::from(n),
            RawId::Signed(n) => RouteId::from(n),
            RawId::Float(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_ID => RouteId(format!("{}", f as i64)),
            RawId::Float(f) => RouteId(f.to_string()),
        })
    }
}

/// Which side of the street the restriction applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Side {
    #[default]
    Both,
    Odd,
    Even,
}

impl Side {
    fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "both" | "all" => Some(Side::Both),
            "odd" => Some(Side::Odd),
            "even" => Some(Side::Even),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Side::Both => "both",
            Side::Odd => "odd",
            Side::Even => "even",
        }
    }
}

/// Kind of restriction a route carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestrictionKind {
    #[default]
    NoParking,
    NoStopping,
    AlternateDays,
}

impl RestrictionKind {
    fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "noparking" => Some(RestrictionKind::NoParking),
            "nostopping" => Some(RestrictionKind::NoStopping),
            "alternatedays" | "alternate" => Some(RestrictionKind::AlternateDays),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RestrictionKind::NoParking => "no-parking",
            RestrictionKind::NoStopping => "no-stopping",
            RestrictionKind::AlternateDays => "alternate-days",
        }
    }
}

/// Lowercase and strip separators: "No_Parking", "no-parking" and "noParking" all become "noparking".
fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

// ============================================================================
// Wire records
// ============================================================================

/// A time range as it appears on the wire ("HH:MM:SS" strings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRangeRecord {
    pub start: String,
    pub end: String,
}

/// A route as delivered by the provider, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: RouteId,
    /// Street / display name
    #[serde(default, alias = "name")]
    pub street: String,
    /// Polyline in GeoJSON order: `[longitude, latitude]`
    #[serde(default)]
    pub coordinates: Vec<[f64; 2]>,
    /// Weekday names ("Monday", ...)
    #[serde(default, alias = "restricted_days")]
    pub days: Vec<String>,
    #[serde(default)]
    pub time_ranges: Vec<TimeRangeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub restriction_type: Option<String>,
}

// ============================================================================
// Validated route
// ============================================================================

/// An immutable, validated restricted route.
///
/// The bounding box is derived from the polyline at construction and always
/// bounds every vertex. There are no setters; a refresh builds new routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RouteRecord", into = "RouteRecord")]
pub struct RestrictedRoute {
    id: RouteId,
    street: String,
    polyline: Vec<GpsPoint>,
    schedule: RestrictionSchedule,
    side: Side,
    kind: RestrictionKind,
    bounds: Bounds,
}

impl RestrictedRoute {
    /// Build a route from already-typed parts.
    ///
    /// Invalid points are dropped; fewer than two remaining points is an error.
    pub fn new(
        id: RouteId,
        street: impl Into<String>,
        polyline: Vec<GpsPoint>,
        schedule: RestrictionSchedule,
        side: Side,
        kind: RestrictionKind,
    ) -> Result<Self, RouteError> {
        if id.is_empty() {
            return Err(RouteError::EmptyId);
        }

        let polyline: Vec<GpsPoint> = polyline.into_iter().filter(|p| p.is_valid()).collect();
        if polyline.len() < 2 {
            return Err(RouteError::TooFewPoints { id: id.to_string(), count: polyline.len() });
        }

        let bounds = compute_bounds(&polyline);

        Ok(Self {
            id,
            street: street.into(),
            polyline,
            schedule,
            side,
            kind,
            bounds,
        })
    }

    pub fn id(&self) -> &RouteId {
        &self.id
    }

    pub fn street(&self) -> &str {
        &self.street
    }

    pub fn polyline(&self) -> &[GpsPoint] {
        &self.polyline
    }

    pub fn schedule(&self) -> &RestrictionSchedule {
        &self.schedule
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn kind(&self) -> RestrictionKind {
        self.kind
    }

    /// Bounding box of the polyline vertices.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Whether the route's restriction is in force at `now`.
    #[inline]
    pub fn is_restricted_at(&self, now: &chrono::NaiveDateTime) -> bool {
        self.schedule.is_restricted_at(now)
    }

    /// Distance in meters from `point` to this route's polyline.
    #[inline]
    pub fn distance_to(&self, point: &GpsPoint) -> f64 {
        point_to_polyline_distance(point, &self.polyline)
    }
}

impl TryFrom<RouteRecord> for RestrictedRoute {
    type Error = RouteError;

    fn try_from(record: RouteRecord) -> Result<Self, Self::Error> {
        let id = record.id;
        if id.is_empty() {
            return Err(RouteError::EmptyId);
        }

        let polyline: Vec<GpsPoint> = record
            .coordinates
            .iter()
            .map(|[lng, lat]| GpsPoint::new(*lat, *lng))
            .collect();

        let days = record
            .days
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<Vec<_>, _>>()?;

        let mut ranges = Vec::with_capacity(record.time_ranges.len());
        for raw in &record.time_ranges {
            match TimeRange::parse(&raw.start, &raw.end)? {
                Some(range) => ranges.push(range),
                None => warn!(
                    "[Routes] Dropping wrapping time range {}-{} on route {}",
                    raw.start, raw.end, id
                ),
            }
        }

        let side = match record.side.as_deref() {
            None => Side::default(),
            Some(label) => Side::from_label(label).unwrap_or_else(|| {
                warn!("[Routes] Unknown side '{}' on route {}, assuming both", label, id);
                Side::Both
            }),
        };

        let kind = match record.restriction_type.as_deref() {
            None => RestrictionKind::default(),
            Some(label) => RestrictionKind::from_label(label).unwrap_or_else(|| {
                warn!("[Routes] Unknown restriction type '{}' on route {}, assuming no-parking", label, id);
                RestrictionKind::NoParking
            }),
        };

        RestrictedRoute::new(
            id,
            record.street,
            polyline,
            RestrictionSchedule::new(days, ranges),
            side,
            kind,
        )
    }
}

impl From<RestrictedRoute> for RouteRecord {
    fn from(route: RestrictedRoute) -> Self {
        RouteRecord {
            coordinates: route.polyline.iter().map(|p| [p.longitude, p.latitude]).collect(),
            days: route.schedule.days.iter().map(|d| weekday_name(*d).to_string()).collect(),
            time_ranges: route
                .schedule
                .ranges
                .iter()
                .map(|r| TimeRangeRecord {
                    start: r.start.format(TIME_FORMAT).to_string(),
                    end: r.end.format(TIME_FORMAT).to_string(),
                })
                .collect(),
            side: Some(route.side.label().to_string()),
            restriction_type: Some(route.kind.label().to_string()),
            id: route.id,
            street: route.street,
        }
    }
}

/// Validate provider records, keeping fetch order and dropping the malformed ones.
pub fn validate_records(records: Vec<RouteRecord>) -> Vec<RestrictedRoute> {
    let total = records.len();
    let routes: Vec<RestrictedRoute> = records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            match RestrictedRoute::try_from(record) {
                Ok(route) => {
                    debug!(
                        "[Routes] {} ({}): {} points, {:.0}m",
                        route.id(),
                        route.street(),
                        route.polyline().len(),
                        polyline_length(route.polyline())
                    );
                    Some(route)
                }
                Err(e) => {
                    warn!("[Routes] Rejected route {}: {}", id, e);
                    None
                }
            }
        })
        .collect();

    if routes.len() < total {
        warn!("[Routes] Accepted {}/{} routes", routes.len(), total);
    } else {
        debug!("[Routes] Accepted all {} routes", total);
    }
    routes
}

// ============================================================================
// Working set
// ============================================================================

/// Bounding box of one route, indexed by its position in fetch order.
#[derive(Debug, Clone)]
struct RouteEnvelope {
    position: usize,
    bounds: Bounds,
}

impl RTreeObject for RouteEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

/// One immutable snapshot of the restricted routes, in fetch order.
///
/// The spatial index stores each route's bounding box grown by `margin_meters`
/// so that points within the zone radius of a polyline, but outside its raw
/// vertex box, are still candidates.
pub struct RouteSet {
    routes: Vec<Arc<RestrictedRoute>>,
    index: RTree<RouteEnvelope>,
    margin_meters: f64,
}

impl RouteSet {
    /// Build a snapshot. Routes with a duplicate id are dropped (first one wins).
    pub fn new(routes: Vec<RestrictedRoute>, margin_meters: f64) -> Self {
        let mut seen: HashSet<RouteId> = HashSet::with_capacity(routes.len());
        let routes: Vec<Arc<RestrictedRoute>> = routes
            .into_iter()
            .filter(|route| {
                let fresh = seen.insert(route.id().clone());
                if !fresh {
                    warn!("[Routes] Duplicate route id {}, keeping the first", route.id());
                }
                fresh
            })
            .map(Arc::new)
            .collect();

        let envelopes: Vec<RouteEnvelope> = routes
            .iter()
            .enumerate()
            .map(|(position, route)| RouteEnvelope {
                position,
                bounds: route.bounds().expand(margin_meters),
            })
            .collect();

        Self {
            index: RTree::bulk_load(envelopes),
            routes,
            margin_meters,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0.0)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn margin_meters(&self) -> f64 {
        self.margin_meters
    }

    /// All routes in fetch order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RestrictedRoute>> {
        self.routes.iter()
    }

    pub fn get(&self, id: &RouteId) -> Option<&Arc<RestrictedRoute>> {
        self.routes.iter().find(|r| r.id() == id)
    }

    /// Routes whose expanded bounding box contains `point`, in fetch order.
    pub fn candidates_at(&self, point: &GpsPoint) -> Vec<&Arc<RestrictedRoute>> {
        let query = AABB::from_point([point.longitude, point.latitude]);
        let mut positions: Vec<usize> = self
            .index
            .locate_in_envelope_intersecting(&query)
            .map(|e| e.position)
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|i| &self.routes[i]).collect()
    }

}

impl fmt::Debug for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSet")
            .field("routes", &self.routes.len())
            .field("margin_meters", &self.margin_meters)
            .finish()
    }
}

impl Default for RouteSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};

    fn record(id: &str) -> RouteRecord {
        RouteRecord {
            id: RouteId::new(id),
            street: "Rue de Rivoli".to_string(),
            coordinates: vec![[2.3500, 48.8566], [2.3530, 48.8566]],
            days: vec!["Monday".to_string(), "Thursday".to_string()],
            time_ranges: vec![TimeRangeRecord { start: "07:00:00".into(), end: "09:00:00".into() }],
            side: Some("odd".to_string()),
            restriction_type: Some("no_stopping".to_string()),
        }
    }

    fn route_at(id: &str, lat: f64) -> RestrictedRoute {
        let mut r = record(id);
        r.coordinates = vec![[2.3500, lat], [2.3530, lat]];
        RestrictedRoute::try_from(r).unwrap()
    }

    #[test]
    fn test_route_id_from_number_or_string() {
        let from_num: RouteId = serde_json::from_str("42").unwrap();
        let from_str: RouteId = serde_json::from_str("\"42\"").unwrap();
        let from_float: RouteId = serde_json::from_str("42.0").unwrap();
        let padded: RouteId = serde_json::from_str("\" 42 \"").unwrap();
        assert_eq!(from_num, from_str);
        assert_eq!(from_float, from_str);
        assert_eq!(padded, from_str);
        assert_eq!(RouteId::from(42u64), from_str);
    }

    #[test]
    fn test_route_id_from_huge_float() {
        let huge: RouteId = serde_json::from_str("1e20").unwrap();
        assert_eq!(huge.as_str(), "100000000000000000000");
        let negative: RouteId = serde_json::from_str("-7.0").unwrap();
        assert_eq!(negative.as_str(), "-7");
        let fractional: RouteId = serde_json::from_str("4.5").unwrap();
        assert_eq!(fractional.as_str(), "4.5");
    }

    #[test]
    fn test_route_set_candidates_at_radius_edge() {
        use crate::geo_utils::METERS_PER_DEGREE;
        let set = RouteSet::new(vec![route_at("r1", 48.8566)], 40.0);

        // 2cm inside the radius, north of the middle and east of the end
        let north = GpsPoint::new(48.8566 + 39.98 / METERS_PER_DEGREE, 2.3515);
        let east_lng = 2.3530 + crate::geo_utils::meters_to_degrees(39.98, 48.8566);
        let east = GpsPoint::new(48.8566, east_lng);
        for p in [north, east] {
            let distance = set.get(&RouteId::new("r1")).unwrap().distance_to(&p);
            assert!(distance < 40.0, "distance {}", distance);
            assert_eq!(set.candidates_at(&p).len(), 1);
        }
    }

    #[test]
    fn test_record_validation() {
        let route = RestrictedRoute::try_from(record("r1")).unwrap();
        assert_eq!(route.id().as_str(), "r1");
        assert_eq!(route.street(), "Rue de Rivoli");
        // GeoJSON [lon, lat] becomes (lat, lon)
        assert_eq!(route.polyline()[0], GpsPoint::new(48.8566, 2.3500));
        assert_eq!(route.schedule().days, vec![Weekday::Mon, Weekday::Thu]);
        assert_eq!(route.side(), Side::Odd);
        assert_eq!(route.kind(), RestrictionKind::NoStopping);
    }

    #[test]
    fn test_record_rejects_short_polyline() {
        let mut r = record("r1");
        r.coordinates = vec![[2.35, 48.85]];
        assert!(matches!(RestrictedRoute::try_from(r), Err(RouteError::TooFewPoints { count: 1, .. })));
    }

    #[test]
    fn test_record_drops_invalid_points() {
        let mut r = record("r1");
        r.coordinates = vec![[2.35, 48.85], [f64::NAN, 48.86], [200.0, 48.0]];
        assert!(matches!(RestrictedRoute::try_from(r), Err(RouteError::TooFewPoints { count: 1, .. })));
    }

    #[test]
    fn test_record_rejects_empty_id_and_bad_day() {
        let mut r = record("  ");
        assert_eq!(RestrictedRoute::try_from(r.clone()), Err(RouteError::EmptyId));
        r.id = RouteId::new("r1");
        r.days.push("Caturday".to_string());
        assert!(matches!(RestrictedRoute::try_from(r), Err(RouteError::UnknownWeekday(_))));
    }

    #[test]
    fn test_record_drops_wrapping_range() {
        let mut r = record("r1");
        r.time_ranges.push(TimeRangeRecord { start: "22:00:00".into(), end: "02:00:00".into() });
        let route = RestrictedRoute::try_from(r).unwrap();
        assert_eq!(route.schedule().ranges.len(), 1);
    }

    #[test]
    fn test_label_normalization() {
        assert_eq!(RestrictionKind::from_label("noParking"), Some(RestrictionKind::NoParking));
        assert_eq!(RestrictionKind::from_label("alternate-days"), Some(RestrictionKind::AlternateDays));
        assert_eq!(Side::from_label("EVEN"), Some(Side::Even));
        assert_eq!(Side::from_label("left"), None);
    }

    #[test]
    fn test_bounds_cover_polyline() {
        let mut r = record("r1");
        r.coordinates = vec![[2.3500, 48.8566], [2.3515, 48.8580], [2.3545, 48.8550]];
        let route = RestrictedRoute::try_from(r).unwrap();
        let b = route.bounds();
        assert!(route.polyline().iter().all(|p| crate::geo_utils::is_within_bounds(p, b)));
    }

    #[test]
    fn test_route_json_roundtrip_keeps_bounds() {
        let route = RestrictedRoute::try_from(record("r1")).unwrap();
        let json = serde_json::to_string(&route).unwrap();
        assert!(json.contains("\"coordinates\":[[2.35,48.8566],[2.353,48.8566]]"));
        let back: RestrictedRoute = serde_json::from_str(&json).unwrap();
        assert_eq!(back, route);
    }

    #[test]
    fn test_restricted_at() {
        let route = RestrictedRoute::try_from(record("r1")).unwrap();
        let monday_8 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
        let monday_10 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        assert!(route.is_restricted_at(&monday_8));
        assert!(!route.is_restricted_at(&monday_10));
    }

    #[test]
    fn test_validate_records_keeps_order() {
        let mut bad = record("bad");
        bad.coordinates.clear();
        let routes = validate_records(vec![record("a"), bad, record("b")]);
        let ids: Vec<&str> = routes.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_route_set_candidates_in_fetch_order() {
        // Two parallel streets 22m apart, one far away
        let set = RouteSet::new(
            vec![route_at("north", 48.8568), route_at("far", 48.9000), route_at("south", 48.8566)],
            40.0,
        );
        let p = GpsPoint::new(48.8567, 2.3515);
        let ids: Vec<&str> = set.candidates_at(&p).iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["north", "south"]);
    }

    #[test]
    fn test_route_set_margin_covers_offset_points() {
        // A perfectly horizontal street has a zero-height vertex box
        let set = RouteSet::new(vec![route_at("r1", 48.8566)], 40.0);
        let just_north = GpsPoint::new(48.8569, 2.3515); // ~33m
        assert_eq!(set.candidates_at(&just_north).len(), 1);

        let unpadded = RouteSet::new(vec![route_at("r1", 48.8566)], 0.0);
        assert!(unpadded.candidates_at(&just_north).is_empty());
    }

    #[test]
    fn test_route_set_dedups_ids() {
        let set = RouteSet::new(vec![route_at("r1", 48.8566), route_at("r1", 48.9)], 40.0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&RouteId::new("r1")).unwrap().polyline()[0].latitude, 48.8566);
    }
}
