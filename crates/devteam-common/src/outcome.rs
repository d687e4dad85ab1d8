use serde::{Deserialize, Serialize};

/// A workflow node's tagged result, matched by the engine rather than
/// thrown across it (see REDESIGN FLAGS: exception-driven control flow at
/// node boundaries is replaced with tagged results).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Success,
    Retryable,
    Fatal,
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }
}
