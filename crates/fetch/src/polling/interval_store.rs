//! Shared, persisted poll interval
//!
//! One [`IntervalStore`] holds the poll period every poller falls back to.
//! Changing it persists the value and notifies subscribers, which is how
//! running pollers pick up a new period without caller intervention.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Preference key the interval is persisted under
pub const POLL_INTERVAL_KEY: &str = "poll_interval_ms";

/// Interval used when nothing is persisted
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Errors from a [`PreferenceStore`]
#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preference I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("preference serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value persistence for user preferences
pub trait PreferenceStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, PreferenceError>;
    fn save(&self, key: &str, value: serde_json::Value) -> Result<(), PreferenceError>;
}

/// Non-persistent preferences
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, PreferenceError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: serde_json::Value) -> Result<(), PreferenceError> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// Preferences kept as a JSON object in a single file
///
/// The file is read on every load and rewritten on every save; a missing
/// file reads as empty.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<serde_json::Map<String, serde_json::Value>, PreferenceError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(serde_json::Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, PreferenceError> {
        Ok(self.read_all()?.remove(key))
    }

    fn save(&self, key: &str, value: serde_json::Value) -> Result<(), PreferenceError> {
        let _guard = self.write_lock.lock();
        let mut all = self.read_all()?;
        all.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&all)?)?;
        Ok(())
    }
}

/// Rejected interval change
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("poll interval must be greater than zero")]
    Zero,
}

/// Old and new value delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntervalChange {
    pub old: Duration,
    pub new: Duration,
}

/// Callback invoked on every interval change
pub type IntervalListener = Arc<dyn Fn(IntervalChange) + Send + Sync>;

/// Handle returned by [`IntervalStore::on_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

/// Poll interval shared by every poller of an application
pub struct IntervalStore {
    preferences: Arc<dyn PreferenceStore>,
    current: RwLock<Duration>,
    next_listener: AtomicU64,
    listeners: RwLock<BTreeMap<u64, IntervalListener>>,
}

impl IntervalStore {
    /// Load the persisted interval, falling back to [`DEFAULT_POLL_INTERVAL`]
    pub fn new(preferences: Arc<dyn PreferenceStore>) -> Self {
        let current = match preferences.load(POLL_INTERVAL_KEY) {
            Ok(Some(value)) => match value.as_u64().filter(|ms| *ms > 0) {
                Some(ms) => Duration::from_millis(ms),
                None => {
                    warn!(%value, "Ignoring invalid persisted poll interval");
                    DEFAULT_POLL_INTERVAL
                }
            },
            Ok(None) => DEFAULT_POLL_INTERVAL,
            Err(e) => {
                warn!(error = %e, "Failed to load poll interval, using default");
                DEFAULT_POLL_INTERVAL
            }
        };

        Self {
            preferences,
            current: RwLock::new(current),
            next_listener: AtomicU64::new(0),
            listeners: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store backed by [`InMemoryPreferences`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPreferences::new()))
    }

    pub fn get_interval(&self) -> Duration {
        *self.current.read()
    }

    /// Change the interval, persist it and notify listeners
    ///
    /// Setting the current value again is a no-op. A failure to persist is
    /// logged; the new interval still takes effect.
    pub fn set_interval(&self, interval: Duration) -> Result<(), IntervalError> {
        if interval.is_zero() {
            return Err(IntervalError::Zero);
        }

        let old = {
            let mut current = self.current.write();
            let old = *current;
            *current = interval;
            old
        };
        if old == interval {
            return Ok(());
        }

        let ms = interval.as_millis() as u64;
        if let Err(e) = self.preferences.save(POLL_INTERVAL_KEY, ms.into()) {
            warn!(error = %e, interval_ms = ms, "Failed to persist poll interval");
        }

        debug!(
            old_ms = old.as_millis() as u64,
            new_ms = ms,
            "Poll interval changed"
        );
        self.notify(IntervalChange { old, new: interval });
        Ok(())
    }

    /// Subscribe to interval changes
    pub fn on_change<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(IntervalChange) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, Arc::new(listener));
        SubscriptionHandle(id)
    }

    /// Unsubscribe; returns false if the handle was already removed
    pub fn remove_listener(&self, handle: SubscriptionHandle) -> bool {
        self.listeners.write().remove(&handle.0).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn notify(&self, change: IntervalChange) {
        // Listeners may subscribe or unsubscribe while being notified.
        let listeners: Vec<IntervalListener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for IntervalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalStore")
            .field("interval", &self.get_interval())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
