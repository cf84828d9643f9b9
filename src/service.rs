//! # Parking Guard Service
//!
//! One tokio task owning the [`ZoneWatcher`] and the [`ParkingManager`]. All
//! inputs are handled strictly one at a time, so the state machines never see
//! concurrent mutation:
//!
//! | Input | Effect |
//! |-------|--------|
//! | Location sample | parking movement check, then zone watcher update |
//! | [`GuardHandle`] command | confirm / clear / query / subscribe / refresh / shutdown |
//! | Finished route refresh | atomic route-set swap, then recheck |
//! | Recheck tick | re-evaluate the zone at the last position |
//! | Refresh tick | start a route refresh (if enabled) |
//! | Parking expiry deadline | clear the confirmation |
//!
//! Route refreshes run in their own task so a slow network never blocks
//! location handling. Their result is applied as a single message.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::cache::{KeyValueStore, RouteCache, ROUTE_CACHE_KEY};
use crate::error::{GuardError, ParkingError};
use crate::parking::{ConfirmedParking, ParkingConfig, ParkingManager};
use crate::providers::{Clock, NotificationSink, RouteProvider};
use crate::refresh::{refresh_routes, RefreshOutcome, RefreshPolicy, RouteSource};
use crate::routes::{RestrictedRoute, RouteId};
use crate::watcher::{WatchConfig, ZoneEvent, ZoneWatcher};
use crate::{GpsPoint, LocationSample};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the whole service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub watch: WatchConfig,
    pub parking: ParkingConfig,
    pub refresh: RefreshPolicy,

    /// Period of the time-window recheck. 0 disables it.
    /// Default: 30 seconds
    pub recheck_interval_secs: u64,

    /// Period of automatic route refreshes. `None` refreshes only at startup
    /// and on request.
    /// Default: None
    pub refresh_interval_secs: Option<u64>,

    /// Key the route cache is stored under.
    /// Default: "restricted_routes"
    pub cache_key: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            parking: ParkingConfig::default(),
            refresh: RefreshPolicy::default(),
            recheck_interval_secs: 30,
            refresh_interval_secs: None,
            cache_key: ROUTE_CACHE_KEY.to_string(),
        }
    }
}

impl GuardConfig {
    /// Parse a (possibly partial) JSON config. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Confirm {
        route_id: RouteId,
        end_time: Option<NaiveDateTime>,
        reply: oneshot::Sender<Result<ConfirmedParking, GuardError>>,
    },
    Clear {
        reply: oneshot::Sender<bool>,
    },
    CurrentZone {
        reply: oneshot::Sender<Option<Arc<RestrictedRoute>>>,
    },
    Confirmation {
        reply: oneshot::Sender<Option<ConfirmedParking>>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<ZoneEvent>>,
    },
    Refresh {
        reply: oneshot::Sender<RouteSource>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`ParkingGuard`].
///
/// Every call fails with [`GuardError::Stopped`] once the service has shut
/// down. Dropping the last handle shuts the service down.
#[derive(Clone)]
pub struct GuardHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl GuardHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, GuardError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| GuardError::Stopped)?;
        rx.await.map_err(|_| GuardError::Stopped)
    }

    /// Confirm parking on `route_id` at the latest position fix.
    ///
    /// Without `end_time`, the confirmation lasts until the route's next
    /// restriction starts.
    pub async fn confirm(
        &self,
        route_id: RouteId,
        end_time: Option<NaiveDateTime>,
    ) -> Result<ConfirmedParking, GuardError> {
        self.request(|reply| Command::Confirm { route_id, end_time, reply }).await?
    }

    /// Cancel the confirmation. Returns `false` if there was none.
    pub async fn clear(&self) -> Result<bool, GuardError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    pub async fn current_zone(&self) -> Result<Option<Arc<RestrictedRoute>>, GuardError> {
        self.request(|reply| Command::CurrentZone { reply }).await
    }

    pub async fn confirmation(&self) -> Result<Option<ConfirmedParking>, GuardError> {
        self.request(|reply| Command::Confirmation { reply }).await
    }

    pub async fn is_confirmed(&self, route_id: &RouteId) -> Result<bool, GuardError> {
        let current = self.confirmation().await?;
        Ok(current.is_some_and(|c| &c.route_id == route_id))
    }

    /// Receive zone transitions from now on.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ZoneEvent>, GuardError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    /// Refresh routes and wait until the new set is in use.
    ///
    /// Joins a refresh already in flight instead of starting another.
    pub async fn refresh(&self) -> Result<RouteSource, GuardError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// Stop the service. Idempotent.
    ///
    /// Timers are disarmed and subscribers dropped. Reminders already handed to
    /// the notification sink are left in place.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("[ParkingGuard] Already stopped");
        }
    }
}

// ============================================================================
// Service Task
// ============================================================================

/// The service task state.
pub struct ParkingGuard {
    config: GuardConfig,
    watcher: ZoneWatcher,
    parking: ParkingManager,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn RouteProvider>,
    cache: RouteCache,
    last_fix: Option<GpsPoint>,
    refresh_task: Option<JoinHandle<RefreshOutcome>>,
    refresh_waiters: Vec<oneshot::Sender<RouteSource>>,
}

impl ParkingGuard {
    /// Start the service on the current tokio runtime.
    ///
    /// A route refresh is started immediately. The service runs until
    /// [`GuardHandle::shutdown`] or until every handle is dropped; the end of
    /// the location stream does not stop it.
    pub fn spawn<S>(
        config: GuardConfig,
        provider: Arc<dyn RouteProvider>,
        sink: Arc<dyn NotificationSink>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        locations: S,
    ) -> GuardHandle
    where
        S: Stream<Item = Option<LocationSample>> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut guard = Self {
            watcher: ZoneWatcher::new(config.watch.clone()),
            parking: ParkingManager::new(config.parking.clone(), sink, Arc::clone(&clock)),
            cache: RouteCache::with_key(store, config.cache_key.clone()),
            clock,
            provider,
            last_fix: None,
            refresh_task: None,
            refresh_waiters: Vec::new(),
            config,
        };

        info!(
            "[ParkingGuard] Starting (zone radius {:.0}m, recheck every {}s)",
            guard.config.watch.zone_radius_meters, guard.config.recheck_interval_secs
        );
        guard.start_refresh();
        tokio::spawn(guard.run(locations, rx));

        GuardHandle { commands: tx }
    }

    async fn run<S>(mut self, mut locations: S, mut commands: mpsc::UnboundedReceiver<Command>)
    where
        S: Stream<Item = Option<LocationSample>> + Unpin,
    {
        let mut recheck = periodic(self.config.recheck_interval_secs);
        let mut refresh_tick = self.config.refresh_interval_secs.and_then(periodic);
        let mut locations_open = true;

        loop {
            tokio::select! {
                biased;

                _ = sleep_until(self.parking.expiry_deadline()) => {
                    self.parking.expire().await;
                }
                result = join_refresh(&mut self.refresh_task) => {
                    self.refresh_task = None;
                    self.apply_refresh(result);
                }
                sample = locations.next(), if locations_open => match sample {
                    Some(sample) => self.on_sample(sample).await,
                    None => {
                        info!("[ParkingGuard] Location source ended");
                        locations_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.stop();
                        break;
                    }
                },
                _ = tick(&mut recheck) => {
                    let now = self.clock.now();
                    self.watcher.recheck(&now);
                }
                _ = tick(&mut refresh_tick) => {
                    self.start_refresh();
                }
            }
        }
    }

    async fn on_sample(&mut self, sample: Option<LocationSample>) {
        if let Some(position) = sample.map(|s| s.point()).filter(GpsPoint::is_valid) {
            self.last_fix = Some(position);
        }
        self.parking.on_location(sample).await;
        let now = self.clock.now();
        self.watcher.update(sample, &now);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Confirm { route_id, end_time, reply } => {
                let result = self.confirm(route_id, end_time).await;
                let _ = reply.send(result.map_err(GuardError::from));
            }
            Command::Clear { reply } => {
                let cleared = self.parking.clear().await;
                let _ = reply.send(cleared);
            }
            Command::CurrentZone { reply } => {
                let _ = reply.send(self.watcher.current_zone().cloned());
            }
            Command::Confirmation { reply } => {
                let _ = reply.send(self.parking.current().cloned());
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.watcher.subscribe());
            }
            Command::Refresh { reply } => {
                self.refresh_waiters.push(reply);
                self.start_refresh();
            }
            Command::Shutdown { reply } => {
                // Handled by the event loop
                let _ = reply.send(());
            }
        }
    }

    async fn confirm(
        &mut self,
        route_id: RouteId,
        end_time: Option<NaiveDateTime>,
    ) -> Result<ConfirmedParking, ParkingError> {
        let route = self
            .watcher
            .routes()
            .get(&route_id)
            .cloned()
            .ok_or(ParkingError::UnknownRoute(route_id))?;
        let position = self.last_fix.ok_or(ParkingError::NoPosition)?;
        self.parking.confirm_on_route(&route, position, end_time).await
    }

    fn start_refresh(&mut self) {
        if self.refresh_task.is_some() {
            debug!("[ParkingGuard] Refresh already in flight");
            return;
        }

        let provider = Arc::clone(&self.provider);
        let cache = self.cache.clone();
        let policy = self.config.refresh.clone();
        self.refresh_task = Some(tokio::spawn(async move {
            refresh_routes(provider.as_ref(), &cache, &policy).await
        }));
    }

    fn apply_refresh(&mut self, result: Result<RefreshOutcome, JoinError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[ParkingGuard] Route refresh task failed: {}", e);
                // Waiters observe the failure as a dropped reply
                self.refresh_waiters.clear();
                return;
            }
        };

        info!(
            "[ParkingGuard] Applying {} routes from {:?}",
            outcome.routes.len(),
            outcome.source
        );
        self.watcher.set_routes(outcome.routes);
        let now = self.clock.now();
        self.watcher.recheck(&now);

        for waiter in self.refresh_waiters.drain(..) {
            let _ = waiter.send(outcome.source);
        }
    }

    fn stop(&mut self) {
        info!("[ParkingGuard] Shutting down");
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.refresh_waiters.clear();
        self.parking.shutdown();
        self.watcher.reset();
    }
}

fn periodic(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn join_refresh(task: &mut Option<JoinHandle<RefreshOutcome>>) -> Result<RefreshOutcome, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => future::pending().await,
    }
}
