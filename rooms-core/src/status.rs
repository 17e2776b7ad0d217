//! Member connection status. Transitions only move forward.

use std::fmt;

/// Status of a member, in lifecycle order. `Disconnected` is final.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConnectionStatus {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Uninitialized => "uninitialized",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    /// Check that moving from `self` to `next` keeps the order.
    pub fn check_transition(self, next: ConnectionStatus) -> Result<(), StatusOrderError> {
        if next < self {
            return Err(StatusOrderError {
                previous: self,
                requested: next,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted to move a status backwards.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("status ({requested}) does not conform to the status order (previous status was {previous})")]
pub struct StatusOrderError {
    pub previous: ConnectionStatus,
    pub requested: ConnectionStatus,
}

/// A status with forward-only assignment.
#[derive(Debug, Clone, Copy)]
pub struct StatusCell {
    current: ConnectionStatus,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            current: ConnectionStatus::Uninitialized,
        }
    }

    pub fn get(&self) -> ConnectionStatus {
        self.current
    }

    /// Assign `next`. Returns `Ok(true)` when the status changed, `Ok(false)` when
    /// it was already `next`. Leaves the status untouched on error.
    pub fn set(&mut self, next: ConnectionStatus) -> Result<bool, StatusOrderError> {
        self.current.check_transition(next)?;
        if next == self.current {
            return Ok(false);
        }
        self.current = next;
        Ok(true)
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = ConnectionStatus> {
        prop_oneof![
            Just(ConnectionStatus::Uninitialized),
            Just(ConnectionStatus::Connecting),
            Just(ConnectionStatus::Connected),
            Just(ConnectionStatus::Disconnected),
        ]
    }

    #[test]
    fn forward_transitions() {
        let mut cell = StatusCell::new();
        assert_eq!(cell.set(ConnectionStatus::Connecting), Ok(true));
        assert_eq!(cell.set(ConnectionStatus::Connecting), Ok(false));
        assert_eq!(cell.set(ConnectionStatus::Connected), Ok(true));
        assert_eq!(cell.set(ConnectionStatus::Disconnected), Ok(true));
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn skipping_forward_is_allowed() {
        let mut cell = StatusCell::new();
        assert_eq!(cell.set(ConnectionStatus::Disconnected), Ok(true));
    }

    #[test]
    fn backwards_fails_and_keeps_status() {
        let mut cell = StatusCell::new();
        cell.set(ConnectionStatus::Connected).unwrap();
        let err = cell.set(ConnectionStatus::Connecting).unwrap_err();
        assert_eq!(err.previous, ConnectionStatus::Connected);
        assert_eq!(err.requested, ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connected);
    }

    proptest! {
        #[test]
        fn observed_statuses_never_decrease(seq in proptest::collection::vec(any_status(), 0..32)) {
            let mut cell = StatusCell::new();
            let mut observed = vec![cell.get()];
            for next in seq {
                let before = cell.get();
                match cell.set(next) {
                    Ok(_) => prop_assert!(next >= before),
                    Err(_) => {
                        prop_assert!(next < before);
                        prop_assert_eq!(cell.get(), before);
                    }
                }
                observed.push(cell.get());
            }
            prop_assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
