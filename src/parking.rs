//! # Confirmed Parking
//!
//! Holds at most one user-confirmed parking record. Confirming schedules a
//! reminder at the end of the allowed time and arms an expiry watch; the record
//! is cleared when the user cancels, when the end time elapses, or when the
//! user moves away from where they confirmed.
//!
//! Notification failures never block a state transition: a reminder that
//! fails to schedule is logged and the record is created without it, and
//! cancellation is best effort.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ParkingError;
use crate::geo_utils::haversine_distance;
use crate::providers::{Clock, NotificationSink, Reminder, ReminderId};
use crate::routes::{RestrictedRoute, RouteId};
use crate::{GpsPoint, LocationSample};

/// Configuration for the confirmed-parking workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkingConfig {
    /// Moving this far from the confirmed position clears the confirmation.
    /// Default: 30.0 meters
    pub move_threshold_meters: f64,

    /// Confirmation is only accepted this close to the route's polyline.
    /// Default: 50.0 meters
    pub eligibility_tolerance_meters: f64,

    /// Delay after the end time before the confirmation auto-clears.
    /// Default: 500 ms
    pub expiry_grace_ms: u64,
}

impl Default for ParkingConfig {
    fn default() -> Self {
        Self {
            move_threshold_meters: 30.0,
            eligibility_tolerance_meters: 50.0,
            expiry_grace_ms: 500,
        }
    }
}

/// The active confirmation. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedParking {
    pub route_id: RouteId,
    pub street: String,
    pub confirmed_at: NaiveDateTime,
    pub confirmed_position: GpsPoint,
    pub end_time: Option<NaiveDateTime>,
    pub scheduled_reminder_ids: Vec<ReminderId>,
}

/// Confirmed-parking state machine (`Unconfirmed` / `Confirmed(record)`).
pub struct ParkingManager {
    config: ParkingConfig,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    current: Option<ConfirmedParking>,
    expiry: Option<Instant>,
}

impl ParkingManager {
    pub fn new(config: ParkingConfig, sink: Arc<dyn NotificationSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            sink,
            clock,
            current: None,
            expiry: None,
        }
    }

    pub fn config(&self) -> &ParkingConfig {
        &self.config
    }

    /// The active confirmation, if any.
    pub fn current(&self) -> Option<&ConfirmedParking> {
        self.current.as_ref()
    }

    /// Whether `route_id` is the confirmed route.
    pub fn is_confirmed(&self, route_id: &RouteId) -> bool {
        self.current.as_ref().is_some_and(|c| &c.route_id == route_id)
    }

    /// When the armed expiry watch fires, if armed.
    pub fn expiry_deadline(&self) -> Option<Instant> {
        self.expiry
    }

    /// Check that `position` is close enough to `route` to confirm parking there.
    ///
    /// Returns the distance to the route on success.
    pub fn check_eligibility(&self, route: &RestrictedRoute, position: &GpsPoint) -> Result<f64, ParkingError> {
        let distance = route.distance_to(position);
        let tolerance = self.config.eligibility_tolerance_meters;
        if distance <= tolerance {
            Ok(distance)
        } else {
            Err(ParkingError::TooFarFromRoute { distance, tolerance })
        }
    }

    /// Confirm parking on `route` after checking eligibility.
    ///
    /// Without an explicit `end_time`, the confirmation ends when the route's
    /// next restriction starts. A rejected confirmation leaves any previous
    /// one untouched.
    pub async fn confirm_on_route(
        &mut self,
        route: &RestrictedRoute,
        position: GpsPoint,
        end_time: Option<NaiveDateTime>,
    ) -> Result<ConfirmedParking, ParkingError> {
        let distance = match self.check_eligibility(route, &position) {
            Ok(d) => d,
            Err(e) => {
                info!("[Parking] Rejected confirmation on {}: {}", route.id(), e);
                return Err(e);
            }
        };
        debug!("[Parking] Eligible for {} at {:.1}m", route.id(), distance);

        let end_time = end_time.or_else(|| route.schedule().next_restriction_start(&self.clock.now()));
        Ok(self
            .confirm(route.id().clone(), route.street().to_string(), position, end_time)
            .await)
    }

    /// Replace any confirmation with a new one.
    ///
    /// Reminders of the previous confirmation are cancelled and its expiry
    /// watch disarmed before anything new is scheduled or armed.
    pub async fn confirm(
        &mut self,
        route_id: RouteId,
        street: String,
        position: GpsPoint,
        end_time: Option<NaiveDateTime>,
    ) -> ConfirmedParking {
        self.expiry = None;
        if let Some(previous) = self.current.take() {
            debug!("[Parking] Superseding confirmation on {}", previous.route_id);
            self.cancel_reminders(previous.scheduled_reminder_ids).await;
        }

        let now = self.clock.now();
        let mut reminder_ids = Vec::new();

        if let Some(end) = end_time.filter(|end| *end > now) {
            let reminder = Reminder::parking_ended(route_id.clone(), &street);
            match self.sink.schedule_at(end, reminder).await {
                Ok(id) => {
                    debug!("[Parking] Scheduled reminder {} at {}", id, end);
                    reminder_ids.push(id);
                }
                Err(e) => warn!("[Parking] Reminder for {} not scheduled: {}", route_id, e),
            }
        }

        if let Some(end) = end_time {
            let remaining = (end - now).to_std().unwrap_or(Duration::ZERO);
            self.expiry = Some(Instant::now() + remaining + Duration::from_millis(self.config.expiry_grace_ms));
        }

        info!(
            "[Parking] Confirmed {} ({}) until {}",
            route_id,
            street,
            end_time.map_or_else(|| "further notice".to_string(), |t| t.to_string())
        );

        let record = ConfirmedParking {
            route_id,
            street,
            confirmed_at: now,
            confirmed_position: position,
            end_time,
            scheduled_reminder_ids: reminder_ids,
        };
        self.current = Some(record.clone());
        record
    }

    /// Drop the confirmation. Returns `false` if there was none.
    pub async fn clear(&mut self) -> bool {
        self.expiry = None;
        let Some(record) = self.current.take() else {
            return false;
        };
        info!("[Parking] Cleared confirmation on {}", record.route_id);
        self.cancel_reminders(record.scheduled_reminder_ids).await;
        true
    }

    /// Clear the confirmation if the user moved `move_threshold_meters` or more
    /// from where they confirmed. Returns `true` if it was cleared.
    pub async fn on_location(&mut self, sample: Option<LocationSample>) -> bool {
        let (Some(record), Some(sample)) = (self.current.as_ref(), sample) else {
            return false;
        };
        let position = sample.point();
        if !position.is_valid() {
            return false;
        }

        let moved = haversine_distance(&record.confirmed_position, &position);
        if moved < self.config.move_threshold_meters {
            return false;
        }

        info!("[Parking] Moved {:.0}m from confirmed spot on {}", moved, record.route_id);
        self.clear().await
    }

    /// Clear the confirmation if its expiry deadline has been reached.
    pub async fn expire(&mut self) -> bool {
        match self.expiry {
            Some(deadline) if Instant::now() >= deadline => {
                info!("[Parking] Confirmation expired");
                self.clear().await
            }
            _ => false,
        }
    }

    /// Disarm the expiry watch. The record and its reminders are left as they are.
    pub fn shutdown(&mut self) {
        self.expiry = None;
    }

    async fn cancel_reminders(&self, ids: Vec<ReminderId>) {
        for id in ids {
            if let Err(e) = self.sink.cancel(id.clone()).await {
                warn!("[Parking] Failed to cancel reminder {}: {}", id, e);
            }
        }
    }
}
