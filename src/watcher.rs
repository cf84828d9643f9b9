//! # Zone Watcher
//!
//! Tracks whether the user is currently inside the zone of a restricted route
//! (the buffered area within `zone_radius_meters` of its polyline) and emits
//! [`ZoneEvent`]s on transitions.
//!
//! ## Update Cycle
//!
//! 1. Samples without a fix, with invalid coordinates, or older than the last
//!    accepted sample are ignored.
//! 2. **Movement gate**: a sample closer than `min_movement_meters` to the last
//!    recorded position is skipped entirely (no re-evaluation).
//! 3. **Candidate scan**: bounding-box candidates from the route index, in
//!    fetch order, that are restricted right now; the first whose polyline is
//!    within the zone radius wins.
//! 4. **Transition**: exit the old zone (if any) before entering a new one.
//!
//! [`ZoneWatcher::recheck`] re-runs steps 3–4 at the last position without the
//! movement gate, so a restriction window opening or closing is noticed while
//! the user stands still.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::geo_utils::haversine_distance;
use crate::routes::{RestrictedRoute, RouteSet};
use crate::{GpsPoint, LocationSample};

/// Configuration for zone detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Maximum distance from a route's polyline to count as inside its zone.
    /// Default: 40.0 meters
    pub zone_radius_meters: f64,

    /// Samples that moved less than this from the last recorded position are ignored.
    /// Default: 10.0 meters (filters GPS jitter)
    pub min_movement_meters: f64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            zone_radius_meters: 40.0,
            min_movement_meters: 10.0,
        }
    }
}

/// A zone transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    Enter(Arc<RestrictedRoute>),
    Exit(Arc<RestrictedRoute>),
}

impl ZoneEvent {
    pub fn route(&self) -> &Arc<RestrictedRoute> {
        match self {
            ZoneEvent::Enter(route) | ZoneEvent::Exit(route) => route,
        }
    }

    pub fn is_enter(&self) -> bool {
        matches!(self, ZoneEvent::Enter(_))
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Samples received, including ignored ones
    pub samples: u64,
    /// Samples signalling "no fix"
    pub no_fix: u64,
    /// Samples with out-of-range or non-finite coordinates
    pub invalid: u64,
    /// Samples older than the last accepted one
    pub stale: u64,
    /// Samples dropped by the movement gate
    pub gated: u64,
    /// Candidate scans run (from samples or rechecks)
    pub evaluations: u64,
    /// Point-to-polyline distance computations
    pub polyline_checks: u64,
}

/// Zone-transition state machine.
///
/// Owns its state exclusively; independent watchers never share anything.
pub struct ZoneWatcher {
    config: WatchConfig,
    routes: Arc<RouteSet>,
    last_position: Option<GpsPoint>,
    last_timestamp: Option<DateTime<Utc>>,
    current_zone: Option<Arc<RestrictedRoute>>,
    subscribers: Vec<mpsc::UnboundedSender<ZoneEvent>>,
    stats: WatchStats,
}

impl ZoneWatcher {
    /// Create a watcher with an empty route set.
    pub fn new(config: WatchConfig) -> Self {
        Self {
            routes: Arc::new(RouteSet::new(Vec::new(), config.zone_radius_meters)),
            config,
            last_position: None,
            last_timestamp: None,
            current_zone: None,
            subscribers: Vec::new(),
            stats: WatchStats::default(),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn current_zone(&self) -> Option<&Arc<RestrictedRoute>> {
        self.current_zone.as_ref()
    }

    pub fn last_position(&self) -> Option<GpsPoint> {
        self.last_position
    }

    pub fn routes(&self) -> &Arc<RouteSet> {
        &self.routes
    }

    pub fn stats(&self) -> WatchStats {
        self.stats
    }

    /// Replace the working set with `routes`, indexed for this watcher's radius.
    pub fn set_routes(&mut self, routes: Vec<RestrictedRoute>) {
        let set = RouteSet::new(routes, self.config.zone_radius_meters);
        self.replace_routes(Arc::new(set));
    }

    /// Swap in a prebuilt snapshot.
    ///
    /// A snapshot indexed with a margin smaller than the zone radius is
    /// re-indexed with the radius. The current zone is kept until the next
    /// evaluation decides otherwise.
    pub fn replace_routes(&mut self, routes: Arc<RouteSet>) {
        let radius = self.config.zone_radius_meters;
        let routes = if routes.margin_meters() < radius {
            warn!(
                "[ZoneWatcher] Route index margin {:.0}m is smaller than zone radius {:.0}m, re-indexing",
                routes.margin_meters(),
                radius
            );
            let owned = routes.iter().map(|r| RestrictedRoute::clone(r)).collect();
            Arc::new(RouteSet::new(owned, radius))
        } else {
            routes
        };
        info!("[ZoneWatcher] Working set replaced: {} routes", routes.len());
        self.routes = routes;
    }

    /// Register a subscriber. Events arrive in emission order.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ZoneEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Process one sample from the location source. `None` means "no fix".
    ///
    /// Returns the transitions caused by this sample, exit before enter.
    pub fn update(&mut self, sample: Option<LocationSample>, now: &NaiveDateTime) -> Vec<ZoneEvent> {
        self.stats.samples += 1;

        let Some(sample) = sample else {
            self.stats.no_fix += 1;
            debug!("[ZoneWatcher] No fix");
            return Vec::new();
        };

        let position = sample.point();
        if !position.is_valid() {
            self.stats.invalid += 1;
            debug!("[ZoneWatcher] Ignoring invalid position {:?}", position);
            return Vec::new();
        }

        if let Some(last_ts) = self.last_timestamp {
            if sample.timestamp < last_ts {
                self.stats.stale += 1;
                debug!("[ZoneWatcher] Ignoring stale sample from {}", sample.timestamp);
                return Vec::new();
            }
        }
        self.last_timestamp = Some(sample.timestamp);

        if let Some(last) = self.last_position {
            let moved = haversine_distance(&last, &position);
            if moved < self.config.min_movement_meters {
                self.stats.gated += 1;
                debug!("[ZoneWatcher] Moved {:.1}m, below gate", moved);
                return Vec::new();
            }
        }
        self.last_position = Some(position);

        self.evaluate(&position, now)
    }

    /// Re-evaluate at the last recorded position, bypassing the movement gate.
    pub fn recheck(&mut self, now: &NaiveDateTime) -> Vec<ZoneEvent> {
        match self.last_position {
            Some(position) => self.evaluate(&position, now),
            None => Vec::new(),
        }
    }

    /// Forget all state and drop subscribers. No events are emitted.
    pub fn reset(&mut self) {
        self.last_position = None;
        self.last_timestamp = None;
        self.current_zone = None;
        self.subscribers.clear();
    }

    fn evaluate(&mut self, position: &GpsPoint, now: &NaiveDateTime) -> Vec<ZoneEvent> {
        self.stats.evaluations += 1;
        let found = self.find_zone(position, now);
        let events = self.transition(found);
        self.publish(&events);
        events
    }

    /// First restricted route, in fetch order, whose zone contains `position`.
    fn find_zone(&mut self, position: &GpsPoint, now: &NaiveDateTime) -> Option<Arc<RestrictedRoute>> {
        let radius = self.config.zone_radius_meters;
        let routes = Arc::clone(&self.routes);

        for route in routes.candidates_at(position) {
            if !route.is_restricted_at(now) {
                continue;
            }

            self.stats.polyline_checks += 1;
            let distance = route.distance_to(position);
            if distance <= radius {
                debug!("[ZoneWatcher] Match {} at {:.1}m", route.id(), distance);
                return Some(Arc::clone(route));
            }
        }

        None
    }

    fn transition(&mut self, found: Option<Arc<RestrictedRoute>>) -> Vec<ZoneEvent> {
        match (self.current_zone.take(), found) {
            (Some(current), Some(next)) if current.id() == next.id() => {
                self.current_zone = Some(next);
                Vec::new()
            }
            (Some(current), Some(next)) => {
                info!(
                    "[ZoneWatcher] Switched zone {} ({}) -> {} ({})",
                    current.id(),
                    current.street(),
                    next.id(),
                    next.street()
                );
                self.current_zone = Some(Arc::clone(&next));
                vec![ZoneEvent::Exit(current), ZoneEvent::Enter(next)]
            }
            (None, Some(next)) => {
                info!("[ZoneWatcher] Entered zone {} ({})", next.id(), next.street());
                self.current_zone = Some(Arc::clone(&next));
                vec![ZoneEvent::Enter(next)]
            }
            (Some(current), None) => {
                info!("[ZoneWatcher] Exited zone {} ({})", current.id(), current.street());
                vec![ZoneEvent::Exit(current)]
            }
            (None, None) => Vec::new(),
        }
    }

    fn publish(&mut self, events: &[ZoneEvent]) {
        if events.is_empty() {
            return;
        }
        self.subscribers
            .retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }
}

impl Default for ZoneWatcher {
    fn default() -> Self {
        Self::new(WatchConfig::default())
    }
}
