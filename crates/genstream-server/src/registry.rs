//! The session registry: the single owner of all per-session state.
//!
//! Built once by the process entry point and handed to the HTTP and WebSocket
//! layers as router state.

use chrono::{DateTime, Utc};
use genstream_types::{Event, ImageArtifact, SessionSnapshot, SessionStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::abort::AbortRegistry;
use crate::channel::ClientChannel;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::event_log::EventLog;
use crate::executor::JobExecutor;
use crate::multiplexer::Multiplexer;
use crate::session::GenerationSession;

/// What the registry knows about a session beyond its event log.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub prompt: String,
    pub status: SessionStatus,
    pub phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub images: Vec<ImageArtifact>,
    pub error: Option<String>,
}

impl SessionRecord {
    fn new(session_id: &str, prompt: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            status: SessionStatus::Running,
            phase: None,
            created_at: Utc::now(),
            finished_at: None,
            images: Vec::new(),
            error: None,
        }
    }

    fn snapshot(&self, latest_event_id: u64) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            status: self.status,
            phase: self.phase.clone(),
            prompt: self.prompt.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            image_count: self.images.len() as u32,
            images: self.images.clone(),
            latest_event_id,
            error: self.error.clone(),
        }
    }
}

/// Result of a generate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new generation session was spawned.
    Started { session_id: String },
    /// The session already exists; the channel was resubscribed from the beginning.
    Resumed { session_id: String, replayed: usize },
}

impl StartOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            StartOutcome::Started { session_id } | StartOutcome::Resumed { session_id, .. } => {
                session_id
            }
        }
    }
}

struct Inner {
    config: ServerConfig,
    log: Arc<EventLog>,
    aborts: Arc<AbortRegistry>,
    multiplexer: Multiplexer,
    records: Mutex<HashMap<String, SessionRecord>>,
    executor: Arc<dyn JobExecutor>,
    shutdown: CancellationToken,
}

/// Shared handle to all session state. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig, executor: Arc<dyn JobExecutor>) -> Self {
        let log = Arc::new(EventLog::new(config.max_events, config.max_event_age));
        let aborts = Arc::new(AbortRegistry::new());
        let multiplexer = Multiplexer::new(log.clone(), aborts.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                log,
                aborts,
                multiplexer,
                records: Mutex::new(HashMap::new()),
                executor,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.inner.log
    }

    pub fn aborts(&self) -> &Arc<AbortRegistry> {
        &self.inner.aborts
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.multiplexer
    }

    pub fn executor(&self) -> Arc<dyn JobExecutor> {
        self.inner.executor.clone()
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Create the record, log and abort handle for a new session.
    ///
    /// Returns `None` if the session already exists.
    pub fn prepare(&self, session_id: &str, prompt: &str) -> Option<CancellationToken> {
        let mut records = self.records();
        if records.contains_key(session_id) || self.inner.log.exists(session_id) {
            return None;
        }
        records.insert(
            session_id.to_string(),
            SessionRecord::new(session_id, prompt),
        );
        self.inner.log.create(session_id);

        let token = CancellationToken::new();
        self.inner.aborts.register(session_id, token.clone());
        Some(token)
    }

    /// Start a generation, or resume it if the session id is already known.
    ///
    /// When `channel` is given it is bound to the session before the first
    /// event is emitted.
    pub fn start_generation(
        &self,
        prompt: &str,
        session_id: Option<String>,
        channel: Option<&ClientChannel>,
    ) -> Result<StartOutcome> {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4()));

        let Some(token) = self.prepare(&session_id, prompt) else {
            log::info!(
                "Generate for existing session {}, resuming instead of starting a second run",
                session_id
            );
            let replayed = match channel {
                Some(channel) => self.inner.multiplexer.subscribe(channel, &session_id, 0)?,
                None => 0,
            };
            return Ok(StartOutcome::Resumed {
                session_id,
                replayed,
            });
        };

        if let Err(e) = self.inner.executor.validate_prompt(prompt) {
            self.discard(&session_id);
            return Err(e);
        }

        if let Some(channel) = channel {
            self.inner.multiplexer.attach(channel, &session_id);
            channel.send_direct(Event::ack_for_session("Generation started", &session_id));
        }

        log::info!(
            "Starting generation session {} with executor {}",
            session_id,
            self.inner.executor.name()
        );
        GenerationSession::new(self.clone(), &session_id, prompt, token).spawn();

        Ok(StartOutcome::Started { session_id })
    }

    /// Undo `prepare` for a session that never started.
    fn discard(&self, session_id: &str) {
        self.records().remove(session_id);
        self.inner.log.remove(session_id);
        self.inner.aborts.unregister(session_id);
    }

    pub fn update_record(&self, session_id: &str, update: impl FnOnce(&mut SessionRecord)) {
        if let Some(record) = self.records().get_mut(session_id) {
            update(record);
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let latest = self.inner.log.latest_id(session_id);
        self.records()
            .get(session_id)
            .map(|record| record.snapshot(latest))
    }

    /// Snapshots of every known session, newest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let records: Vec<SessionRecord> = self.records().values().cloned().collect();
        let mut snapshots: Vec<SessionSnapshot> = records
            .iter()
            .map(|record| record.snapshot(self.inner.log.latest_id(&record.session_id)))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    pub fn active_count(&self) -> usize {
        self.records()
            .values()
            .filter(|record| record.status == SessionStatus::Running)
            .count()
    }

    /// Cancel a session by id, from outside any channel.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let cancelled = self.inner.aborts.cancel(session_id);
        if cancelled {
            log::info!("Cancel requested for session {}", session_id);
        }
        cancelled
    }

    /// Forget a finished session after the completion grace period.
    pub fn schedule_release(&self, session_id: &str) {
        let registry = self.clone();
        let session_id = session_id.to_string();
        let grace = self.inner.config.completion_grace;
        let shutdown = self.shutdown_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => registry.release(&session_id),
            }
        });
    }

    /// Remove every trace of a session.
    pub fn release(&self, session_id: &str) {
        self.records().remove(session_id);
        self.inner.log.remove(session_id);
        self.inner.multiplexer.release(session_id);
        self.inner.aborts.unregister(session_id);
        log::debug!("Released session {}", session_id);
    }

    /// Evict expired logs, then drop finished sessions whose log is gone.
    ///
    /// Returns the number of evicted logs.
    pub fn evict_expired(&self) -> usize {
        let evicted = self.inner.log.evict_expired();
        if evicted == 0 {
            return 0;
        }

        let orphaned: Vec<String> = self
            .records()
            .values()
            .filter(|record| {
                record.status.is_terminal() && !self.inner.log.exists(&record.session_id)
            })
            .map(|record| record.session_id.clone())
            .collect();
        for session_id in orphaned {
            self.release(&session_id);
        }
        evicted
    }

    /// Stop background tasks owned by the registry.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Reject a missing session with the error clients see.
    pub fn require(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.snapshot(session_id)
            .ok_or_else(|| ServerError::session_not_found(session_id))
    }
}
