use std::fmt;

use serde::{Deserialize, Serialize};

/// States of the request loop, in the order they can occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopState {
    GuardCheck,
    Retrieve,
    Plan,
    Execute,
    Verify,
    SelfCorrect,
    Fallback,
    Respond,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::GuardCheck => "GuardCheck",
            LoopState::Retrieve => "Retrieve",
            LoopState::Plan => "Plan",
            LoopState::Execute => "Execute",
            LoopState::Verify => "Verify",
            LoopState::SelfCorrect => "SelfCorrect",
            LoopState::Fallback => "Fallback",
            LoopState::Respond => "Respond",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub state: LoopState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Ordered record of the states a request went through.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, state: LoopState) {
        tracing::debug!(state = state.as_str(), "loop state");
        self.events.push(TraceEvent { state, note: None });
    }

    /// Annotates the current state.
    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        tracing::debug!(%note, "loop note");
        if let Some(last) = self.events.last_mut() {
            last.note = Some(match last.note.take() {
                Some(existing) => format!("{existing}; {note}"),
                None => note,
            });
        }
    }

    pub fn states(&self) -> Vec<LoopState> {
        self.events.iter().map(|e| e.state).collect()
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}
