use std::collections::HashMap;

use tokio::sync::Mutex;
use warden_types::{ConversationTurn, SessionId};

pub const DEFAULT_MAX_SESSIONS: usize = 100;

struct Slot {
    turn: ConversationTurn,
    last_used: u64,
}

struct Sessions {
    slots: HashMap<SessionId, Slot>,
    clock: u64,
}

impl Sessions {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Most recent successful turn per session. Sessions never see each other's
/// turns; the least recently used session is dropped past `max_sessions`.
pub struct ConversationMemory {
    inner: Mutex<Sessions>,
    max_sessions: usize,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl ConversationMemory {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(Sessions {
                slots: HashMap::new(),
                clock: 0,
            }),
            max_sessions: max_sessions.max(1),
        }
    }

    pub async fn last_turn(&self, session: &SessionId) -> Option<ConversationTurn> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let slot = inner.slots.get_mut(session)?;
        slot.last_used = now;
        Some(slot.turn.clone())
    }

    /// Stores `turn` as the session's latest and returns the turn it supersedes.
    pub async fn record(&self, session: &SessionId, turn: ConversationTurn) -> Option<ConversationTurn> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        if let Some(slot) = inner.slots.get_mut(session) {
            slot.last_used = now;
            return Some(std::mem::replace(&mut slot.turn, turn));
        }

        if inner.slots.len() >= self.max_sessions {
            let oldest = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                tracing::debug!(session = %id, "evicting least recently used session");
                inner.slots.remove(&id);
            }
        }
        inner.slots.insert(
            session.clone(),
            Slot {
                turn,
                last_used: now,
            },
        );
        None
    }

    pub async fn forget(&self, session: &SessionId) -> Option<ConversationTurn> {
        self.inner.lock().await.slots.remove(session).map(|s| s.turn)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.slots.len()
    }
}
