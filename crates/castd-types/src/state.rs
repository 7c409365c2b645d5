//! Encoder lifecycle states and their wire-code mapping.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one supervised encoder worker.
///
/// `Null` is the initial state; `Terminated` is terminal. `Spawned` is a
/// controller-local state entered when the handshake completes and has no
/// wire code: workers only ever report the remaining states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderState {
    #[default]
    Null,
    Spawned,
    Configured,
    Ready,
    Started,
    Paused,
    Terminated,
}

impl EncoderState {
    /// Decode a state code received from a worker's property-change
    /// notification. Unknown codes are a recoverable condition for the
    /// caller to log and ignore, not a transition.
    #[must_use]
    pub fn from_wire(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Null),
            1 => Some(Self::Configured),
            2 => Some(Self::Ready),
            3 => Some(Self::Started),
            4 => Some(Self::Paused),
            5 => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Once `Terminated` is reached no further transition is accepted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Null => "NULL",
            Self::Spawned => "SPAWNED",
            Self::Configured => "CONFIGURED",
            Self::Ready => "READY",
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Terminated => "TERMINATED",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_known_codes() {
        assert_eq!(EncoderState::from_wire(0), Some(EncoderState::Null));
        assert_eq!(EncoderState::from_wire(1), Some(EncoderState::Configured));
        assert_eq!(EncoderState::from_wire(2), Some(EncoderState::Ready));
        assert_eq!(EncoderState::from_wire(3), Some(EncoderState::Started));
        assert_eq!(EncoderState::from_wire(4), Some(EncoderState::Paused));
        assert_eq!(EncoderState::from_wire(5), Some(EncoderState::Terminated));
    }

    #[test]
    fn test_from_wire_unknown_codes() {
        assert_eq!(EncoderState::from_wire(-1), None);
        assert_eq!(EncoderState::from_wire(6), None);
        assert_eq!(EncoderState::from_wire(i64::MAX), None);
    }

    #[test]
    fn test_spawned_has_no_wire_code() {
        for code in -8..=8 {
            assert_ne!(EncoderState::from_wire(code), Some(EncoderState::Spawned));
        }
    }

    #[test]
    fn test_default_is_null() {
        assert_eq!(EncoderState::default(), EncoderState::Null);
    }

    #[test]
    fn test_only_terminated_is_terminal() {
        assert!(EncoderState::Terminated.is_terminal());
        assert!(!EncoderState::Null.is_terminal());
        assert!(!EncoderState::Spawned.is_terminal());
        assert!(!EncoderState::Started.is_terminal());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(EncoderState::Null.to_string(), "NULL");
        assert_eq!(EncoderState::Spawned.to_string(), "SPAWNED");
        assert_eq!(EncoderState::Terminated.to_string(), "TERMINATED");
    }
}
