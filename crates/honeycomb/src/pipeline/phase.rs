//! Pipeline phases reported in the status document.
//!
//! ```text
//! IDLE -> READING -> PARSING -> VALIDATING -> BATCHING -> COMMITTING -> CHECKPOINTING -> IDLE
//!                       |            |                       |
//!                       +-> QUARANTINE (continue)            +-> CIRCUIT_OPEN (halt)
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Reading,
    Parsing,
    Validating,
    Batching,
    Committing,
    Checkpointing,
    Quarantine,
    CircuitOpen,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Reading => "READING",
            Phase::Parsing => "PARSING",
            Phase::Validating => "VALIDATING",
            Phase::Batching => "BATCHING",
            Phase::Committing => "COMMITTING",
            Phase::Checkpointing => "CHECKPOINTING",
            Phase::Quarantine => "QUARANTINE",
            Phase::CircuitOpen => "CIRCUIT_OPEN",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Whether `next` is an edge of the loader state machine.
    ///
    /// Any live phase may fail or finish; terminal phases only restart at idle.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (Done | Failed, Idle) => true,
            (Done | Failed, _) => false,
            (_, Done | Failed) => true,
            (Idle, Reading) => true,
            (Reading, Parsing | Committing) => true,
            (Parsing, Validating | Quarantine) => true,
            (Validating, Batching | Quarantine) => true,
            (Quarantine, Reading | Parsing | Batching | Committing) => true,
            (Batching, Reading | Parsing | Quarantine | Committing) => true,
            (Committing, CircuitOpen | Checkpointing | Reading | Idle) => true,
            (CircuitOpen, Committing) => true,
            (Checkpointing, Idle | Reading) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [
            Phase::Idle,
            Phase::Reading,
            Phase::Parsing,
            Phase::Validating,
            Phase::Batching,
            Phase::Committing,
            Phase::Checkpointing,
            Phase::Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_edges() {
        assert!(Phase::Parsing.can_transition_to(Phase::Quarantine));
        assert!(Phase::Validating.can_transition_to(Phase::Quarantine));
        assert!(Phase::Committing.can_transition_to(Phase::CircuitOpen));
        assert!(!Phase::Parsing.can_transition_to(Phase::CircuitOpen));
        assert!(!Phase::Checkpointing.can_transition_to(Phase::Committing));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Done.is_terminal());
        assert!(Phase::CircuitOpen.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Reading));
        assert_eq!(serde_json::to_string(&Phase::CircuitOpen).unwrap(), "\"CIRCUIT_OPEN\"");
    }
}
