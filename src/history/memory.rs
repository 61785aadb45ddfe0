use chrono::{ DateTime, Utc };
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{ debug, info };
use crate::history::{ EvictionPolicy, HistoryStore };
use crate::models::chat::{ Transcript, Turn };
use std::sync::Mutex;

struct SessionEntry {
    transcript: Transcript,
    last_active: DateTime<Utc>,
}

/// Process-local session store. Sessions live in a sharded map so unrelated
/// session ids never wait on each other.
pub struct MemoryHistoryStore {
    sessions: DashMap<String, SessionEntry>,
    max_turns: usize,
    policy: EvictionPolicy,
    capacity_guard: Mutex<()>,
}

impl MemoryHistoryStore {
    /// `max_turns` is rounded down to an even number, minimum one exchange.
    pub fn new(max_turns: usize, policy: EvictionPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: (max_turns.max(2) / 2) * 2,
            policy,
            capacity_guard: Mutex::new(()),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub(crate) fn append_at(&self, session_id: &str, user: Turn, assistant: Turn, now: DateTime<Utc>) {
        let created = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.transcript.push_exchange(user, assistant, self.max_turns);
                entry.last_active = now;
                false
            }
            Entry::Vacant(vacant) => {
                let mut transcript = Transcript::new();
                transcript.push_exchange(user, assistant, self.max_turns);
                vacant.insert(SessionEntry { transcript, last_active: now });
                true
            }
        };

        if created {
            debug!("Created session {}", session_id);
            self.enforce_capacity(session_id);
        }
    }

    fn enforce_capacity(&self, keep: &str) {
        let max_sessions = match self.policy.max_sessions() {
            Some(max) => max,
            None => return,
        };
        // One evictor at a time; concurrent creators must not evict past capacity.
        let _guard = self.capacity_guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.sessions.len() <= max_sessions {
            return;
        }

        let mut candidates: Vec<(String, DateTime<Utc>)> = self.sessions
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.key().clone(), e.value().last_active))
            .collect();
        candidates.sort_by_key(|(_, last_active)| *last_active);

        for (session_id, _) in candidates {
            if self.sessions.len() <= max_sessions {
                break;
            }
            if self.sessions.remove(&session_id).is_some() {
                info!("Evicted least recently active session {}", session_id);
            }
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn lookup(&self, session_id: &str) -> Option<Transcript> {
        self.sessions.get(session_id).map(|entry| entry.transcript.clone())
    }

    fn append(&self, session_id: &str, user: Turn, assistant: Turn) {
        self.append_at(session_id, user, assistant, Utc::now());
    }

    fn clear(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!("Cleared session {}", session_id);
        }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = match self.policy.idle_ttl() {
            Some(ttl) => ttl,
            None => return 0,
        };
        let mut removed = 0;
        self.sessions.retain(|_, entry| {
            let keep = now - entry.last_active <= ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}
