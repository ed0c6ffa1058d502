//! Tape catalog state model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a physical tape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeState {
    /// Fresh tape, no label written yet.
    Empty,
    /// Labeled tape that can still receive appended archives.
    Open,
    /// Capacity reached; no further writes.
    Full,
    /// Mechanical or data error; excluded from allocation.
    Corrupted,
}

impl TapeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapeState::Empty => "empty",
            TapeState::Open => "open",
            TapeState::Full => "full",
            TapeState::Corrupted => "corrupted",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "empty" => Ok(TapeState::Empty),
            "open" => Ok(TapeState::Open),
            "full" => Ok(TapeState::Full),
            "corrupted" => Ok(TapeState::Corrupted),
            other => Err(crate::Error::InvalidTapeTransition {
                from: other.to_string(),
                to: "?".to_string(),
            }),
        }
    }

    /// Validate a state transition, returning a typed error on an illegal one.
    ///
    /// Any state may degrade to `Corrupted`; `Corrupted` and `Full` are
    /// otherwise terminal.
    pub fn check_transition(&self, to: TapeState) -> crate::Result<()> {
        let legal = matches!(
            (self, to),
            (TapeState::Empty, TapeState::Open)
                | (TapeState::Open, TapeState::Full)
                | (_, TapeState::Corrupted)
        );
        if legal {
            Ok(())
        } else {
            Err(crate::Error::InvalidTapeTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    /// Whether the tape may be selected for archival writes.
    pub fn is_writable(&self) -> bool {
        matches!(self, TapeState::Empty | TapeState::Open)
    }
}

impl fmt::Display for TapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current physical position of a tape within the library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TapeLocation {
    /// Stored in a library slot.
    Slot { slot: u32 },
    /// Mounted in a drive.
    Drive { drive_index: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        TapeState::Empty.check_transition(TapeState::Open).unwrap();
        TapeState::Open.check_transition(TapeState::Full).unwrap();
        TapeState::Open.check_transition(TapeState::Corrupted).unwrap();
        TapeState::Full.check_transition(TapeState::Corrupted).unwrap();
    }

    #[test]
    fn illegal_transitions() {
        assert!(TapeState::Full.check_transition(TapeState::Open).is_err());
        assert!(TapeState::Corrupted.check_transition(TapeState::Open).is_err());
        assert!(TapeState::Empty.check_transition(TapeState::Full).is_err());
    }

    #[test]
    fn state_name_roundtrip() {
        for state in [TapeState::Empty, TapeState::Open, TapeState::Full, TapeState::Corrupted] {
            assert_eq!(TapeState::parse(state.as_str()).unwrap(), state);
        }
    }
}
