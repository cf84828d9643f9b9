//! Error types for route ingestion, collaborators and the parking workflow.
//!
//! Geometry and schedule evaluation never fail; everything that can go wrong
//! happens at a boundary (ingestion, the network, the notification sink, the
//! key/value store) or is a rejected user action.

use thiserror::Error;

use crate::routes::RouteId;

/// A route record that cannot enter the working set.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("route has an empty id")]
    EmptyId,
    #[error("route {id} has {count} valid points, at least 2 are required")]
    TooFewPoints { id: String, count: usize },
    #[error("unrecognized weekday: {0}")]
    UnknownWeekday(String),
    #[error("invalid time of day (expected HH:MM:SS): {0}")]
    InvalidTime(String),
}

/// Failure reported by a [`RouteProvider`](crate::providers::RouteProvider).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to parse route data: {0}")]
    Parse(String),
}

/// Failure reported by a [`NotificationSink`](crate::providers::NotificationSink).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("failed to schedule reminder: {0}")]
    Schedule(String),
    #[error("failed to cancel reminder {id}: {reason}")]
    Cancel { id: String, reason: String },
}

/// Failure reading or writing the persistent key/value store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Rejected confirmed-parking action. No state is mutated when returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParkingError {
    #[error("too far from route: {distance:.0}m away, must be within {tolerance:.0}m")]
    TooFarFromRoute { distance: f64, tolerance: f64 },
    #[error("unknown route: {0}")]
    UnknownRoute(RouteId),
    #[error("no position fix yet")]
    NoPosition,
}

/// Error returned by the [`GuardHandle`](crate::service::GuardHandle).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error(transparent)]
    Parking(#[from] ParkingError),
    #[error("parking guard is not running")]
    Stopped,
}
