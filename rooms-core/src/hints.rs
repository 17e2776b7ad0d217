//! Small key/value store with expiry, used for hints that bias a room's
//! initial role (e.g. "this process stopped hosting at t").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::RoomId;
use crate::protocol::now_ms;

/// Injectable hint storage. Values expire after their TTL.
pub trait HintStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    /// Epoch ms after which the entry is gone; `None` never expires.
    expires_at: Option<u64>,
}

impl Entry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| now_ms().saturating_add(t.as_millis() as u64)),
        }
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local hints.
#[derive(Default)]
pub struct MemoryHints {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryHints {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HintStore for MemoryHints {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_live(now_ms()) => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(value, ttl));
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Hints persisted as a JSON file, so they survive a process restart.
/// I/O failures are logged and treated as "no hint".
pub struct FileHints {
    path: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FileHints {
    /// Open (or lazily create) the hint file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn persist(&self, entries: &HashMap<String, Entry>) {
        let now = now_ms();
        let live: HashMap<&String, &Entry> =
            entries.iter().filter(|(_, e)| e.is_live(now)).collect();
        let result = serde_json::to_vec_pretty(&live)
            .map_err(std::io::Error::from)
            .and_then(|bytes| {
                if let Some(dir) = self.path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&self.path, bytes)
            });
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist hints");
        }
    }
}

fn load_entries(path: &Path) -> HashMap<String, Entry> {
    let Ok(s) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&s) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable hint file");
            HashMap::new()
        }
    }
}

impl HintStore for FileHints {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now_ms()))
            .map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), Entry::new(value, ttl));
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }
}

fn stopped_hosting_key(room: &RoomId) -> String {
    format!("rooms/stopped-hosting/{}", room)
}

/// Record that this process stopped hosting `room` now.
pub fn record_stopped_hosting(store: &dyn HintStore, room: &RoomId, cooldown: Duration) {
    store.set(
        &stopped_hosting_key(room),
        now_ms().to_string(),
        Some(cooldown),
    );
}

/// True when this process stopped hosting `room` less than `cooldown` ago.
pub fn recently_stopped_hosting(store: &dyn HintStore, room: &RoomId, cooldown: Duration) -> bool {
    let Some(stamp) = store.get(&stopped_hosting_key(room)) else {
        return false;
    };
    let Ok(stamp) = stamp.parse::<u64>() else {
        return false;
    };
    now_ms().saturating_sub(stamp) < cooldown.as_millis() as u64
}
