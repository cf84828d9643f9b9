//! Simulated drive across two restricted streets, ending with a confirmed parking.
//!
//! Run with: cargo run --example commute

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use futures::channel::mpsc::unbounded;
use parking_guard::{
    GuardConfig, LocationSample, LoggingSink, ManualClock, MemoryStore, ParkingGuard, RouteRecord,
    StaticRouteProvider, ZoneEvent,
};

const ROUTES: &str = r#"[
    {
        "id": 101,
        "street": "Rue de Rivoli",
        "coordinates": [[2.3480, 48.8566], [2.3530, 48.8566]],
        "days": ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"],
        "time_ranges": [{"start": "07:00", "end": "09:30"}],
        "type": "no stopping"
    },
    {
        "id": "102",
        "street": "Rue du Louvre",
        "coordinates": [[2.3560, 48.8560], [2.3560, 48.8600]],
        "restricted_days": ["Monday"],
        "time_ranges": [{"start": "08:00:00", "end": "12:00:00"}],
        "side": "odd"
    }
]"#;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let records: Vec<RouteRecord> = match serde_json::from_str(ROUTES) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("Invalid route data: {}", e);
            return;
        }
    };

    // 2024-01-01 is a Monday
    let start = NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(8, 15, 0))
        .unwrap_or_default();
    let clock = Arc::new(ManualClock::new(start));

    let (locations, rx) = unbounded();
    let guard = ParkingGuard::spawn(
        GuardConfig::default(),
        Arc::new(StaticRouteProvider::new(records)),
        Arc::new(LoggingSink::new()),
        Arc::new(MemoryStore::new()),
        clock.clone(),
        rx,
    );

    match guard.refresh().await {
        Ok(source) => println!("Routes loaded from {:?}\n", source),
        Err(e) => {
            eprintln!("Guard stopped: {}", e);
            return;
        }
    }

    let mut events = match guard.subscribe().await {
        Ok(events) => events,
        Err(e) => {
            eprintln!("Guard stopped: {}", e);
            return;
        }
    };

    // West to east along Rivoli, then north up Louvre
    let drive = [
        (48.8570, 2.3400),
        (48.8567, 2.3485),
        (48.8567, 2.3500),
        (48.8566, 2.3520),
        (48.8563, 2.3545),
        (48.8570, 2.3561),
        (48.8585, 2.3561),
    ];

    println!("Driving...");
    for (step, (lat, lng)) in drive.iter().enumerate() {
        clock.advance(Duration::seconds(20));
        let at = (start + Duration::seconds(20 * (step as i64 + 1))).and_utc();
        if locations.unbounded_send(Some(LocationSample::new(*lat, *lng, at))).is_err() {
            break;
        }

        // A query is answered after the sample above was processed
        let zone = guard.current_zone().await.ok().flatten();
        while let Ok(event) = events.try_recv() {
            match event {
                ZoneEvent::Enter(route) => println!(
                    "   ENTER {} ({}, {})",
                    route.street(),
                    route.kind().label(),
                    route.side().label()
                ),
                ZoneEvent::Exit(route) => println!("   EXIT  {}", route.street()),
            }
        }
        println!(
            "{}. ({:.4}, {:.4}) zone: {}",
            step + 1,
            lat,
            lng,
            zone.as_ref().map_or("none", |r| r.street())
        );
    }

    println!("\nParking on Rue du Louvre until 10:00");
    let end = start + Duration::minutes(105);
    match guard.confirm("102".into(), Some(end)).await {
        Ok(parking) => println!(
            "   Confirmed {} until {:?}, reminders: {:?}",
            parking.street,
            parking.end_time,
            parking.scheduled_reminder_ids
        ),
        Err(e) => println!("   Rejected: {}", e),
    }

    println!("\nWalking away");
    let at = (start + Duration::minutes(5)).and_utc();
    let _ = locations.unbounded_send(Some(LocationSample::new(48.8590, 2.3600, at)));
    let still_confirmed = guard.is_confirmed(&"102".into()).await.unwrap_or(false);
    println!("   Still confirmed: {}", still_confirmed);

    guard.shutdown().await;
}
