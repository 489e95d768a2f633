//! Per-session, bounded, append-only event buffer.
//!
//! Sequence ids start at 1 and increase by exactly one per append. When a log
//! grows past its limit the oldest half is dropped; logs older than the
//! maximum age are evicted wholesale by [`EventLog::evict_expired`].

use chrono::Utc;
use genstream_types::{BufferedEvent, Event};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{DEFAULT_MAX_EVENTS, DEFAULT_MAX_EVENT_AGE};

struct SessionLog {
    events: VecDeque<BufferedEvent>,
    next_id: u64,
    created_at: Instant,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            created_at: Instant::now(),
        }
    }
}

/// Event logs for all sessions, keyed by session id.
pub struct EventLog {
    logs: Mutex<HashMap<String, SessionLog>>,
    max_events: usize,
    max_age: Duration,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_MAX_EVENT_AGE)
    }
}

impl EventLog {
    pub fn new(max_events: usize, max_age: Duration) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            max_events: max_events.max(2),
            max_age,
        }
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<String, SessionLog>> {
        // Critical sections never panic midway, so a poisoned map is still consistent.
        self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty log for `session_id` if none exists.
    pub fn create(&self, session_id: &str) {
        self.logs()
            .entry(session_id.to_string())
            .or_insert_with(SessionLog::new);
    }

    /// Append an event, assigning the next sequence id.
    ///
    /// Recreates the log if it was evicted in the meantime.
    pub fn append(&self, session_id: &str, event: Event) -> BufferedEvent {
        let mut logs = self.logs();
        let log = logs
            .entry(session_id.to_string())
            .or_insert_with(SessionLog::new);

        let buffered = BufferedEvent {
            id: log.next_id,
            event,
            timestamp: Utc::now(),
        };
        log.next_id += 1;
        log.events.push_back(buffered.clone());

        if log.events.len() > self.max_events {
            let keep = self.max_events / 2;
            let drop = log.events.len() - keep;
            log.events.drain(..drop);
            log::debug!(
                "Trimmed event log for session {} to {} events",
                session_id,
                keep
            );
        }

        buffered
    }

    /// Events with an id strictly greater than `after_id`, in order.
    pub fn since(&self, session_id: &str, after_id: u64) -> Vec<BufferedEvent> {
        let logs = self.logs();
        let Some(log) = logs.get(session_id) else {
            return Vec::new();
        };

        if let Some(first) = log.events.front() {
            if first.id > after_id + 1 {
                log::warn!(
                    "Replay gap for session {}: requested events after {}, oldest retained is {}",
                    session_id,
                    after_id,
                    first.id
                );
            }
        }

        log.events
            .iter()
            .filter(|event| event.id > after_id)
            .cloned()
            .collect()
    }

    /// The id of the most recent event, or 0 when there is none.
    pub fn latest_id(&self, session_id: &str) -> u64 {
        self.logs()
            .get(session_id)
            .map(|log| log.next_id - 1)
            .unwrap_or(0)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.logs().contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.logs().remove(session_id).is_some()
    }

    /// Number of events currently retained for a session.
    pub fn len(&self, session_id: &str) -> usize {
        self.logs()
            .get(session_id)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }

    /// Number of sessions with a log.
    pub fn session_count(&self) -> usize {
        self.logs().len()
    }

    /// Remove every log older than the maximum age. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut logs = self.logs();
        let before = logs.len();
        let max_age = self.max_age;
        logs.retain(|session_id, log| {
            let keep = log.created_at.elapsed() <= max_age;
            if !keep {
                log::info!("Evicting expired event log for session {}", session_id);
            }
            keep
        });
        before - logs.len()
    }
}
