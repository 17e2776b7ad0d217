//! Room wire protocol: payload types carried between members.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every payload exchanged in a room. Encoding is JSON, tagged by `type`
/// (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    /// Full state replacement. Also used as the catch-up sent to new peers.
    State { data: Value, timestamp: u64 },
    /// Named action applied by every member that knows it.
    Action {
        data: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
        timestamp: u64,
    },
}

impl Payload {
    pub fn state(data: Value) -> Self {
        Payload::State {
            data,
            timestamp: now_ms(),
        }
    }

    pub fn action(name: impl Into<String>, args: Vec<Value>) -> Self {
        Payload::Action {
            data: name.into(),
            args,
            timestamp: now_ms(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Payload::State { timestamp, .. } | Payload::Action { timestamp, .. } => *timestamp,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_stamp_the_current_time() {
        let before = now_ms();
        let state = Payload::state(Value::from(1));
        let action = Payload::action("increment", vec![]);
        let after = now_ms();
        for payload in [state, action] {
            assert!((before..=after).contains(&payload.timestamp()));
        }
    }
}
