mod memory;

pub use memory::MemoryHistoryStore;

use chrono::{ DateTime, Duration, Utc };
use log::info;
use std::error::Error;
use std::sync::Arc;
use crate::cli::Args;
use crate::models::chat::{ Role, Transcript, Turn };

/// Session id → transcript registry. Every operation is total and synchronous.
pub trait HistoryStore: Send + Sync {
    /// The session's transcript, or `None` if the session does not exist.
    fn lookup(&self, session_id: &str) -> Option<Transcript>;

    /// Appends one exchange, creating the session if needed and trimming the
    /// oldest pairs past the retention limit. Readers never observe half an exchange.
    fn append(&self, session_id: &str, user: Turn, assistant: Turn);

    /// Removes the session. Unknown ids are ignored.
    fn clear(&self, session_id: &str);

    /// Number of live sessions.
    fn len(&self) -> usize;

    /// Drops sessions idle past the policy's TTL and returns how many were removed.
    fn evict_expired(&self, now: DateTime<Utc>) -> usize;

    fn get(&self, session_id: &str) -> Transcript {
        self.lookup(session_id).unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How abandoned sessions leave the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Unbounded,
    Lru {
        max_sessions: usize,
    },
    IdleTtl {
        ttl: Duration,
    },
    LruWithTtl {
        max_sessions: usize,
        ttl: Duration,
    },
}

impl EvictionPolicy {
    /// Zero disables the corresponding limit. A TTL too large for a chrono
    /// `Duration` is an error.
    pub fn from_limits(
        capacity: usize,
        idle_ttl_secs: u64
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let ttl = if idle_ttl_secs == 0 {
            None
        } else {
            let secs = i64::try_from(idle_ttl_secs)?;
            let ttl = Duration::try_seconds(secs).ok_or_else(|| {
                format!("Session idle TTL of {}s is out of range", idle_ttl_secs)
            })?;
            Some(ttl)
        };
        Ok(match (capacity, ttl) {
            (0, None) => EvictionPolicy::Unbounded,
            (max_sessions, None) => EvictionPolicy::Lru { max_sessions },
            (0, Some(ttl)) => EvictionPolicy::IdleTtl { ttl },
            (max_sessions, Some(ttl)) => EvictionPolicy::LruWithTtl { max_sessions, ttl },
        })
    }

    pub fn max_sessions(&self) -> Option<usize> {
        match self {
            EvictionPolicy::Lru { max_sessions } |
            EvictionPolicy::LruWithTtl { max_sessions, .. } => Some(*max_sessions),
            _ => None,
        }
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        match self {
            EvictionPolicy::IdleTtl { ttl } | EvictionPolicy::LruWithTtl { ttl, .. } => Some(*ttl),
            _ => None,
        }
    }
}

pub fn create_history_store(
    args: &Args
) -> Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    match args.history_type.to_lowercase().as_str() {
        "memory" => {
            let policy = EvictionPolicy::from_limits(
                args.session_capacity,
                args.session_idle_ttl_secs
            )?;
            let store = MemoryHistoryStore::new(args.history_max_turns, policy);
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported history store type: {}", args.history_type)
                    )
                )
            ),
    }
}

pub fn initialize_history_store(
    args: &Args
) -> Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    info!(
        "Chat history will be kept in: {} (max {} turns per session)",
        args.history_type,
        args.history_max_turns
    );
    create_history_store(args)
}

/// Periodically applies the store's idle-TTL policy until the runtime shuts down.
pub fn spawn_eviction_sweeper(
    store: Arc<dyn HistoryStore>,
    every: std::time::Duration
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.evict_expired(Utc::now());
            if removed > 0 {
                info!("Evicted {} idle sessions ({} remaining)", removed, store.len());
            }
        }
    })
}

pub fn format_history_for_prompt(transcript: &Transcript) -> String {
    if transcript.is_empty() {
        return String::new();
    }
    let mut result = String::new();
    for turn in transcript.turns() {
        result.push_str(&format!("{}: {}\n", turn.role.label(), turn.content));
    }

    result
}

/// Lays out `<system>\n\n[<history>\n]User: <message>\nAssistant:`.
pub fn build_prompt(system_instruction: &str, transcript: &Transcript, message: &str) -> String {
    format!(
        "{}\n\n{}{}: {}\n{}:",
        system_instruction,
        format_history_for_prompt(transcript),
        Role::User.label(),
        message,
        Role::Assistant.label()
    )
}
