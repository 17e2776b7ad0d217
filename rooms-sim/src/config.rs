//! Load config from file and environment.

use rooms_core::RoomConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Simulation configuration. File: ~/.config/rooms/sim.toml or /etc/rooms/sim.toml.
/// Env overrides: ROOMS_ROOM_ID, ROOMS_PEERS, ROOMS_STAGGER_MS, ROOMS_HINT_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Room every simulated peer joins (default "R1").
    #[serde(default = "default_room_id")]
    pub room_id: String,
    /// Number of peers started before the host is severed (default 3).
    #[serde(default = "default_peers")]
    pub peers: usize,
    /// Delay between peer starts in ms (default 50).
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// Persist last-host hints here instead of in memory.
    #[serde(default)]
    pub hint_file: Option<PathBuf>,
    /// Retry and cooldown settings shared by all peers.
    #[serde(default)]
    pub room: RoomConfig,
}

fn default_room_id() -> String {
    "R1".to_string()
}
fn default_peers() -> usize {
    3
}
fn default_stagger_ms() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room_id: default_room_id(),
            peers: default_peers(),
            stagger_ms: default_stagger_ms(),
            hint_file: None,
            room: RoomConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("ROOMS_ROOM_ID") {
        if !s.is_empty() {
            c.room_id = s;
        }
    }
    if let Ok(s) = std::env::var("ROOMS_PEERS") {
        if let Ok(n) = s.parse::<usize>() {
            c.peers = n;
        }
    }
    if let Ok(s) = std::env::var("ROOMS_STAGGER_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.stagger_ms = ms;
        }
    }
    if let Some(p) = std::env::var_os("ROOMS_HINT_FILE") {
        c.hint_file = Some(PathBuf::from(p));
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/rooms/sim.toml"));
    }
    out.push(PathBuf::from("/etc/rooms/sim.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}
