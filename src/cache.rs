//! Persistent route cache.
//!
//! The last successfully fetched route set is stored as one JSON document under
//! a single key of a string-keyed [`KeyValueStore`]. Saving overwrites the
//! previous document wholesale.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::routes::{validate_records, RestrictedRoute, RouteRecord};

/// Default key the route set is stored under.
pub const ROUTE_CACHE_KEY: &str = "restricted_routes";

// ============================================================================
// Key/Value Stores
// ============================================================================

/// String-keyed persistent storage holding JSON strings.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    fn set(&self, key: &str, value: String) -> Result<(), CacheError>;
}

/// In-process store. Contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.lock().map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|e| CacheError::Backend(e.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Store keeping one `<key>.json` file per key in a directory.
///
/// Writes go to a temporary file first and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ============================================================================
// Route Cache
// ============================================================================

/// A previously persisted route set.
#[derive(Debug, Clone)]
pub struct CachedRoutes {
    pub fetched_at: DateTime<Utc>,
    pub routes: Vec<RestrictedRoute>,
}

/// On-disk shape. Routes are kept as records so one bad entry does not void the rest.
#[derive(Serialize, Deserialize)]
struct CachePayload {
    fetched_at: DateTime<Utc>,
    routes: Vec<RouteRecord>,
}

/// Route cache over a key/value store.
#[derive(Clone)]
pub struct RouteCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl RouteCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, ROUTE_CACHE_KEY)
    }

    pub fn with_key(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self { store, key: key.into() }
    }

    /// Load the last persisted set.
    ///
    /// Returns `None` when nothing was saved yet. Store errors and corrupt
    /// payloads are logged and also reported as `None`.
    pub fn load(&self) -> Option<CachedRoutes> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("[RouteCache] No cached routes under '{}'", self.key);
                return None;
            }
            Err(e) => {
                warn!("[RouteCache] Failed to read '{}': {}", self.key, e);
                return None;
            }
        };

        let payload: CachePayload = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!("[RouteCache] Ignoring corrupt cache '{}': {}", self.key, e);
                return None;
            }
        };

        let routes = validate_records(payload.routes);
        info!(
            "[RouteCache] Loaded {} routes fetched at {}",
            routes.len(),
            payload.fetched_at.to_rfc3339()
        );

        Some(CachedRoutes { fetched_at: payload.fetched_at, routes })
    }

    /// Overwrite the cache with `routes`.
    pub fn save(&self, routes: &[RestrictedRoute], fetched_at: DateTime<Utc>) -> Result<(), CacheError> {
        let payload = CachePayload {
            fetched_at,
            routes: routes.iter().cloned().map(RouteRecord::from).collect(),
        };
        let json = serde_json::to_string(&payload)?;
        self.store.set(&self.key, json)?;
        debug!("[RouteCache] Saved {} routes under '{}'", routes.len(), self.key);
        Ok(())
    }
}
