//! Engine state machine.

use serde::{Deserialize, Serialize};

/// Phase of one mailbox engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Waiting for mailbox activity.
    Idle,
    /// Retrying failed pairs and listing new messages.
    Polling,
    /// Evaluating rules against one message.
    Matching,
    /// Running a matched rule's actions.
    Dispatching,
    /// Writing the outcome to the ledger.
    Recording,
    /// Session lost; backing off before the next connect.
    Reconnecting,
    /// Stopped for good.
    Shutdown,
}

impl EngineState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: EngineState) -> bool {
        use EngineState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Polling) | (Idle, Reconnecting) | (Idle, Shutdown) |
            // From Polling (retries dispatch straight from here)
            (Polling, Matching) | (Polling, Dispatching) | (Polling, Idle) |
            (Polling, Reconnecting) | (Polling, Shutdown) |
            // From Matching (next message, or end of batch)
            (Matching, Dispatching) | (Matching, Recording) | (Matching, Matching) |
            (Matching, Polling) | (Matching, Idle) | (Matching, Shutdown) |
            // From Dispatching: always record, even when stopping
            (Dispatching, Recording) |
            // From Recording
            (Recording, Dispatching) | (Recording, Matching) | (Recording, Polling) |
            (Recording, Idle) | (Recording, Shutdown) |
            // From Reconnecting
            (Reconnecting, Polling) | (Reconnecting, Shutdown)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Matching => "matching",
            Self::Dispatching => "dispatching",
            Self::Recording => "recording",
            Self::Reconnecting => "reconnecting",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}
