use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::Error::FromSqlConversionFailure;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::db::{self, now_timestamp};
use crate::errors::{AppError, AppResult, ResolutionError};
use crate::geocoder::{Coordinates, GeocodeResult, GeocodeStatus};

pub type Resolution = Result<GeocodeResult, ResolutionError>;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub address: String,
    pub result: GeocodeResult,
    pub inserted_at: DateTime<Utc>,
}

/// Persistent, write-once geocode cache keyed by normalized address.
pub struct AddressCache {
    db: Arc<Mutex<Connection>>,
    path: PathBuf,
    #[cfg(test)]
    fail_next_store: AtomicBool,
}

/// Keys being resolved during one batch run, so concurrent rows for one
/// address share a single live call. Markers (failed ones included) go away
/// with the run.
#[derive(Default)]
pub struct RunClaims {
    markers: Mutex<HashMap<String, watch::Receiver<Option<Resolution>>>>,
}

impl RunClaims {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Outcome of [`AddressCache::claim`].
pub enum Claim {
    /// Already persisted by an earlier run or row.
    Hit(CacheEntry),
    /// Caller is the sole resolver for the key and must call [`InFlight::complete`].
    Owner(InFlight),
    /// Another row is resolving (or has resolved) the key during this run.
    Waiter(Pending),
}

pub struct InFlight {
    key: String,
    sender: watch::Sender<Option<Resolution>>,
    completed: bool,
}

impl InFlight {
    pub fn complete(mut self, resolution: Resolution) {
        self.completed = true;
        self.sender.send_replace(Some(resolution));
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.completed {
            warn!(key = %self.key, "in-flight resolution abandoned");
            self.sender.send_replace(Some(Err(abandoned(&self.key))));
        }
    }
}

pub struct Pending {
    key: String,
    receiver: watch::Receiver<Option<Resolution>>,
}

impl Pending {
    pub async fn wait(mut self) -> Resolution {
        let resolved = match self.receiver.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| Err(abandoned(&self.key)))
    }
}

fn abandoned(key: &str) -> ResolutionError {
    ResolutionError::new("ERROR", format!("resolution of {key} was abandoned"))
}

impl AddressCache {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let context = db::bootstrap(path)?;
        Ok(Self::from_connection(context.connection, context.path))
    }

    pub fn in_memory() -> AppResult<Self> {
        let context = db::in_memory()?;
        Ok(Self::from_connection(context.connection, context.path))
    }

    fn from_connection(connection: Connection, path: PathBuf) -> Self {
        Self {
            db: Arc::new(Mutex::new(connection)),
            path,
            #[cfg(test)]
            fail_next_store: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, key: &str) -> AppResult<Option<CacheEntry>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT normalized_key, address, status, lat, lng, raw_json, inserted_at
            FROM geocode_cache
            WHERE normalized_key = ?1",
            [key],
            |row| parse_entry(row),
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Persists a terminal result. Existing entries are never overwritten.
    pub fn store(&self, key: &str, address: &str, result: &GeocodeResult) -> AppResult<()> {
        #[cfg(test)]
        if self.fail_next_store.swap(false, Ordering::SeqCst) {
            return Err(AppError::CacheWrite {
                key: key.to_string(),
                reason: "simulated write failure".into(),
            });
        }

        let (lat, lng) = match result.coordinates {
            Some(Coordinates { lat, lng }) => (Some(lat), Some(lng)),
            None => (None, None),
        };
        let raw = serde_json::to_string(&result.raw)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO geocode_cache (normalized_key, address, status, lat, lng, raw_json, inserted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(normalized_key) DO NOTHING",
            (
                key,
                address,
                result.status.as_str(),
                lat,
                lng,
                raw,
                now_timestamp(),
            ),
        )
        .map_err(|err| AppError::CacheWrite {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        trace!(key, "cache entry stored");
        Ok(())
    }

    /// Checks the run's in-flight markers, then the persisted table, and
    /// otherwise makes the caller the resolver for `key`.
    pub fn claim(&self, claims: &RunClaims, key: &str) -> AppResult<Claim> {
        let mut in_flight = claims.markers.lock();
        if let Some(receiver) = in_flight.get(key) {
            debug!(key, "joining in-flight resolution");
            return Ok(Claim::Waiter(Pending {
                key: key.to_string(),
                receiver: receiver.clone(),
            }));
        }

        if let Some(entry) = self.lookup(key)? {
            return Ok(Claim::Hit(entry));
        }

        let (sender, receiver) = watch::channel(None);
        in_flight.insert(key.to_string(), receiver);
        Ok(Claim::Owner(InFlight {
            key: key.to_string(),
            sender,
            completed: false,
        }))
    }

    pub fn entry_count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM geocode_cache", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub(crate) fn fail_next_store(&self) {
        self.fail_next_store.store(true, Ordering::SeqCst);
    }
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let key: String = row.get(0)?;
    let address: String = row.get(1)?;
    let status: String = row.get(2)?;
    let lat: Option<f64> = row.get(3)?;
    let lng: Option<f64> = row.get(4)?;
    let raw_json: String = row.get(5)?;
    let inserted_at: String = row.get(6)?;

    let coordinates = match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
        _ => None,
    };
    let raw = serde_json::from_str(&raw_json)
        .map_err(|err| FromSqlConversionFailure(5, Type::Text, Box::new(err)))?;
    let inserted_at = DateTime::parse_from_rfc3339(&inserted_at)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| FromSqlConversionFailure(6, Type::Text, Box::new(err)))?;

    Ok(CacheEntry {
        key,
        address,
        result: GeocodeResult {
            status: GeocodeStatus::parse(&status),
            coordinates,
            raw,
        },
        inserted_at,
    })
}
