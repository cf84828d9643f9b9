//! Narrow interfaces to the collaborators the engine does not own.
//!
//! - [`RouteProvider`]: fetches the restricted route list (e.g. over HTTP)
//! - [`NotificationSink`]: schedules and cancels local notifications
//! - [`Clock`]: local wall-clock time for schedule evaluation
//!
//! The key/value store lives in [`cache`](crate::cache). The location source is
//! any `futures::Stream<Item = Option<LocationSample>>`.
//!
//! Async collaborators return boxed futures so they can be used as trait
//! objects (`Arc<dyn RouteProvider>`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{Duration, NaiveDateTime};
use futures::future::{self, BoxFuture};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, SinkError};
use crate::routes::{RouteId, RouteRecord};

// ============================================================================
// Route Provider
// ============================================================================

/// Source of the live restricted-route list.
pub trait RouteProvider: Send + Sync {
    /// Fetch all restricted routes. May fail with network or parse errors.
    fn fetch_restricted_routes(&self) -> BoxFuture<'_, Result<Vec<RouteRecord>, ProviderError>>;
}

/// Provider serving a fixed list, for demos and offline use.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteProvider {
    records: Vec<RouteRecord>,
}

impl StaticRouteProvider {
    pub fn new(records: Vec<RouteRecord>) -> Self {
        Self { records }
    }
}

impl RouteProvider for StaticRouteProvider {
    fn fetch_restricted_routes(&self) -> BoxFuture<'_, Result<Vec<RouteRecord>, ProviderError>> {
        Box::pin(future::ready(Ok(self.records.clone())))
    }
}

// ============================================================================
// Notification Sink
// ============================================================================

/// Identifier of a scheduled notification, as assigned by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReminderId(pub String);

impl std::fmt::Display for ReminderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content of a scheduled notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub route_id: RouteId,
    pub title: String,
    pub body: String,
}

impl Reminder {
    /// The "your parking window has ended" reminder for a confirmed spot.
    pub fn parking_ended(route_id: RouteId, street: &str) -> Self {
        Self {
            route_id,
            title: "Parking time is over".to_string(),
            body: format!("Your confirmed parking on {} has ended. Please move your vehicle.", street),
        }
    }
}

/// Schedules local notifications. Both operations may fail.
///
/// Cancelling an id that already fired or was already cancelled should succeed;
/// callers treat cancellation errors as non-fatal either way.
pub trait NotificationSink: Send + Sync {
    fn schedule_at(&self, at: NaiveDateTime, reminder: Reminder) -> BoxFuture<'_, Result<ReminderId, SinkError>>;

    fn cancel(&self, id: ReminderId) -> BoxFuture<'_, Result<(), SinkError>>;
}

/// Sink that only logs, handing out sequential ids.
#[derive(Debug, Default)]
pub struct LoggingSink {
    next_id: AtomicU64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSink for LoggingSink {
    fn schedule_at(&self, at: NaiveDateTime, reminder: Reminder) -> BoxFuture<'_, Result<ReminderId, SinkError>> {
        let id = ReminderId(format!("reminder-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1));
        info!("[LoggingSink] Scheduled {} at {}: {}", id, at, reminder.title);
        Box::pin(future::ready(Ok(id)))
    }

    fn cancel(&self, id: ReminderId) -> BoxFuture<'_, Result<(), SinkError>> {
        info!("[LoggingSink] Cancelled {}", id);
        Box::pin(future::ready(Ok(())))
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The system's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// A clock that only moves when told to. Used for simulations and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_manual_clock_advance() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), start + Duration::minutes(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_logging_sink_ids_are_unique() {
        let sink = LoggingSink::new();
        let at = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
        let reminder = Reminder::parking_ended(RouteId::new("r1"), "Rue de Rivoli");
        let a = sink.schedule_at(at, reminder.clone()).await.unwrap();
        let b = sink.schedule_at(at, reminder).await.unwrap();
        assert_ne!(a, b);
        assert!(sink.cancel(a).await.is_ok());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticRouteProvider::new(vec![]);
        assert_eq!(provider.fetch_restricted_routes().await.unwrap(), vec![]);
    }
}
